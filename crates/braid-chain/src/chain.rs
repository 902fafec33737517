use std::{
    ptr,
    sync::{
        Mutex,
        atomic::{AtomicPtr, AtomicU32, Ordering},
    },
};

use crate::{DEQUE_LIMIT, deque::RingDeque};

struct Node<T> {
    ring: RingDeque<T>,
    /// Written once by the producer that grows the chain, read by consumers.
    next: AtomicPtr<Node<T>>,
    /// Cleared by the consumer that unlinks the predecessor.
    prev: AtomicPtr<Node<T>>,
}

/// Dynamically-sized MPMC queue of boxed items.
///
/// Pushes go to the `head` node only. When it is full, the producer that wins
/// the `new_chain` flag allocates the next node at twice the capacity (capped
/// at [`DEQUE_LIMIT`]), pushes there, and publishes it; everyone else spins
/// until the flag clears. Pops walk from `tail`, unlinking nodes that are
/// drained and have a successor. Unlinked nodes are parked on a retire list
/// rather than freed: a producer that loaded the old head right before the
/// growth can still address it, so nodes only come down with the chain.
pub struct RingChain<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    new_chain: AtomicU32,
    retired: Mutex<Vec<*mut Node<T>>>,
}

unsafe impl<T: Send> Send for RingChain<T> {}
unsafe impl<T: Send> Sync for RingChain<T> {}

impl<T> RingChain<T> {
    /// `init_size` must be a power of two.
    pub fn new(init_size: usize) -> Self {
        let node = Box::into_raw(Box::new(Node {
            ring: RingDeque::new(init_size),
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
        }));
        Self {
            head: AtomicPtr::new(node),
            tail: AtomicPtr::new(node),
            new_chain: AtomicU32::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: Box<T>) {
        let val = Box::into_raw(item);
        loop {
            while self.new_chain.load(Ordering::Acquire) > 0 {
                std::thread::yield_now();
            }

            let head = self.head.load(Ordering::Acquire);
            if unsafe { &(*head).ring }.push(val) {
                return;
            }

            // Head node is full; one producer grows the chain, the rest
            // retry from the top once the flag clears.
            if self
                .new_chain
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let grown = unsafe { &(*head).ring }.len_slots() * 2;
                let size = grown.min(DEQUE_LIMIT);
                let node = Box::into_raw(Box::new(Node {
                    ring: RingDeque::new(size),
                    next: AtomicPtr::new(ptr::null_mut()),
                    prev: AtomicPtr::new(head),
                }));
                unsafe { &(*node).ring }.push(val);
                self.head.store(node, Ordering::Release);
                unsafe { &(*head).next }.store(node, Ordering::Release);
                self.new_chain.store(0, Ordering::Release);
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<Box<T>> {
        let mut node = self.tail.load(Ordering::Acquire);
        if node.is_null() {
            return None;
        }
        loop {
            // Load next *before* the pop attempt: if next was already set and
            // the pop still fails, the node is permanently empty and safe to
            // unlink.
            let next = unsafe { &(*node).next }.load(Ordering::Acquire);

            if let Some(val) = unsafe { &(*node).ring }.pop() {
                return Some(unsafe { Box::from_raw(val) });
            }

            if next.is_null() {
                return None;
            }

            if self
                .tail
                .compare_exchange(node, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe { &(*next).prev }.store(ptr::null_mut(), Ordering::Release);
                self.retired.lock().unwrap().push(node);
            }
            node = next;
        }
    }
}

impl<T> Drop for RingChain<T> {
    fn drop(&mut self) {
        // Exclusive access: free every remaining item, every live node, and
        // every retired node. A retired node can still hold an item stranded
        // by a producer that pushed after the unlink.
        let mut nodes = std::mem::take(&mut *self.retired.lock().unwrap());
        let mut node = self.tail.load(Ordering::Acquire);
        while !node.is_null() {
            nodes.push(node);
            node = unsafe { &(*node).next }.load(Ordering::Acquire);
        }
        for node in nodes {
            let mut boxed = unsafe { Box::from_raw(node) };
            for item in boxed.ring.drain_slots() {
                drop(unsafe { Box::from_raw(item) });
            }
        }
    }
}
