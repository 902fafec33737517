use std::sync::Mutex;

use crate::frame::{Frame, MAX_SEGMENT_SIZE};

/// Free lists are capped so a burst cannot pin memory forever; overflow is
/// simply dropped.
const POOL_CAP: usize = 512;

/// Payload slice queued in a receive window, plus the flag saying whether
/// more segments complete the same logical write.
#[derive(Debug, Default)]
pub(crate) struct Element {
    pub buf: Vec<u8>,
    pub len: u16,
    pub part: bool,
}

/// Per-mux object pools: payload buffers, frame shells, and receive-window
/// list elements. Everything the reader pulls off the carrier and everything
/// the writer puts on it cycles through here.
pub(crate) struct Pools {
    pub buf: BufPool,
    pub frame: FramePool,
    pub element: ElementPool,
}

impl Pools {
    pub fn new() -> Self {
        Self { buf: BufPool::default(), frame: FramePool::default(), element: ElementPool::default() }
    }

    /// Returns a frame and its payload (if still attached) to the pools.
    pub fn retire_frame(&self, mut frame: Box<Frame>) {
        if let Some(buf) = frame.payload.take() {
            self.buf.put(buf);
        }
        self.frame.put(frame);
    }
}

#[derive(Default)]
pub(crate) struct BufPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufPool {
    /// Always returns a buffer of exactly [`MAX_SEGMENT_SIZE`] bytes.
    pub fn get(&self) -> Vec<u8> {
        self.free.lock().unwrap().pop().unwrap_or_else(|| vec![0; MAX_SEGMENT_SIZE])
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < MAX_SEGMENT_SIZE {
            return;
        }
        buf.resize(MAX_SEGMENT_SIZE, 0);
        let mut free = self.free.lock().unwrap();
        if free.len() < POOL_CAP {
            free.push(buf);
        }
    }
}

#[derive(Default)]
pub(crate) struct FramePool {
    free: Mutex<Vec<Box<Frame>>>,
}

impl FramePool {
    pub fn get(&self) -> Box<Frame> {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn put(&self, mut frame: Box<Frame>) {
        frame.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < POOL_CAP {
            free.push(frame);
        }
    }
}

#[derive(Default)]
pub(crate) struct ElementPool {
    free: Mutex<Vec<Box<Element>>>,
}

impl ElementPool {
    pub fn get(&self, buf: Vec<u8>, len: u16, part: bool) -> Box<Element> {
        debug_assert!(len as usize <= buf.len());
        let mut el = self.free.lock().unwrap().pop().unwrap_or_default();
        el.buf = buf;
        el.len = len;
        el.part = part;
        el
    }

    pub fn put(&self, mut el: Box<Element>) {
        el.buf = Vec::new();
        el.len = 0;
        el.part = false;
        let mut free = self.free.lock().unwrap();
        if free.len() < POOL_CAP {
            free.push(el);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_recycle_at_full_size() {
        let p = BufPool::default();
        let mut b = p.get();
        assert_eq!(b.len(), MAX_SEGMENT_SIZE);
        b.truncate(10);
        p.put(b);
        assert_eq!(p.get().len(), MAX_SEGMENT_SIZE);
    }

    #[test]
    fn retire_returns_payload_too() {
        let pools = Pools::new();
        let f = Frame::data(crate::frame::Flag::Msg, 1, b"abc", &pools).unwrap();
        pools.retire_frame(f);
        let g = pools.frame.get();
        assert!(g.payload.is_none());
        assert_eq!(g.len, 0);
    }
}
