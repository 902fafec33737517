use std::{collections::HashMap, sync::RwLock};

use crate::stream::Stream;

/// Live streams of one mux, keyed by their 31-bit id.
pub(crate) struct StreamTable {
    map: RwLock<HashMap<i32, Stream>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, id: i32) -> Option<Stream> {
        self.map.read().unwrap().get(&id).cloned()
    }

    pub fn insert(&self, id: i32, stream: Stream) {
        self.map.write().unwrap().insert(id, stream);
    }

    pub fn remove(&self, id: i32) -> Option<Stream> {
        self.map.write().unwrap().remove(&id)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// Closes every stream. Handles are collected first so the per-stream
    /// close can take the write lock to remove itself.
    pub fn close_all(&self) {
        let streams: Vec<Stream> = self.map.read().unwrap().values().cloned().collect();
        for stream in streams {
            stream.close();
        }
    }
}
