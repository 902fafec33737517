//! Growing lock-free MPMC queue.
//!
//! A [`RingChain`] is a doubly-linked list of [`RingDeque`] nodes. Producers
//! push boxed items at the head node; when it fills, one producer wins a CAS
//! and links a node of twice the capacity. Consumers pop from the tail node
//! and unlink it once drained. Each node is guarded by a single 64-bit
//! `(head, tail)` word, so pushes are wait-free while the node has room and
//! pops are lock-free.

mod chain;
mod deque;

pub use chain::RingChain;
pub use deque::RingDeque;

/// Bits used by each of the head and tail indexes in the packed word.
pub(crate) const DEQUE_BITS: u32 = 32;

/// Largest slot count a single node may reach. Fullness detection wraps the
/// ring without wrapping the index, so this must stay below `1 << 31`.
pub(crate) const DEQUE_LIMIT: usize = 1 << 30;
