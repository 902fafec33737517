use std::{
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    thread,
    time::Instant,
};

use braid_chain::RingChain;
use crossbeam_channel::{Receiver, Sender, after, bounded, never, select};

use crate::{
    error::{Error, Result},
    frame::{Flag, Frame},
    pool::Element,
    stream::Stream,
};

/// How many middle-class pops may run ahead of the lowest class before data
/// frames get a turn.
const MAX_STARVING: u8 = 8;

/// Park/wake state shared by the blocking queues: one failed-pop spin with a
/// yield, then a condvar wait until a push or stop.
struct Waiter {
    lock: Mutex<()>,
    cond: Condvar,
    stopped: AtomicBool,
}

impl Waiter {
    fn new() -> Self {
        Self { lock: Mutex::new(()), cond: Condvar::new(), stopped: AtomicBool::new(false) }
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn block_on<T>(&self, mut try_pop: impl FnMut() -> Option<T>) -> Option<T> {
        let mut spun = false;
        loop {
            if let Some(v) = try_pop() {
                return Some(v);
            }
            if self.is_stopped() {
                return None;
            }
            if spun {
                break;
            }
            spun = true;
            thread::yield_now();
        }
        let mut guard = self.lock.lock().unwrap();
        loop {
            if let Some(v) = try_pop() {
                return Some(v);
            }
            if self.is_stopped() {
                return None;
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

/// Three-class write queue feeding the single carrier writer.
///
/// Pings ride the highest class so latency samples stay honest; stream
/// open/accept control rides the middle; data fills the lowest. The
/// starvation counter bounds how long the middle class may shut data out.
pub(crate) struct PriorityQueue {
    highest: RingChain<Frame>,
    middle: RingChain<Frame>,
    lowest: RingChain<Frame>,
    starving: AtomicU8,
    waiter: Waiter,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            highest: RingChain::new(4),
            middle: RingChain::new(32),
            lowest: RingChain::new(256),
            starving: AtomicU8::new(0),
            waiter: Waiter::new(),
        }
    }

    pub fn push(&self, frame: Box<Frame>) {
        match frame.flag {
            Flag::Ping | Flag::PingReturn => self.highest.push(frame),
            Flag::NewStream | Flag::NewStreamAck | Flag::NewStreamNak => self.middle.push(frame),
            _ => self.lowest.push(frame),
        }
        self.waiter.wake_all();
    }

    /// Blocks until a frame is available; `None` means the queue was stopped.
    pub fn pop(&self) -> Option<Box<Frame>> {
        self.waiter.block_on(|| self.try_pop())
    }

    pub fn try_pop(&self) -> Option<Box<Frame>> {
        if let Some(f) = self.highest.pop() {
            return Some(f);
        }
        let starving = self.starving.load(Ordering::Relaxed);
        if starving < MAX_STARVING {
            if let Some(f) = self.middle.pop() {
                self.starving.store(starving + 1, Ordering::Relaxed);
                return Some(f);
            }
        }
        if let Some(f) = self.lowest.pop() {
            if starving > 0 {
                self.starving.store(starving / 2, Ordering::Relaxed);
            }
            return Some(f);
        }
        if starving > 0 {
            if let Some(f) = self.middle.pop() {
                self.starving.store(starving + 1, Ordering::Relaxed);
                return Some(f);
            }
        }
        None
    }

    pub fn stop(&self) {
        self.waiter.stop();
    }
}

/// Streams the reader has seen NEW_STREAM for, waiting on the accept
/// dispatcher.
pub(crate) struct AcceptQueue {
    chain: RingChain<Stream>,
    waiter: Waiter,
}

impl AcceptQueue {
    pub fn new() -> Self {
        Self { chain: RingChain::new(32), waiter: Waiter::new() }
    }

    pub fn push(&self, stream: Stream) {
        self.chain.push(Box::new(stream));
        self.waiter.wake_all();
    }

    pub fn pop(&self) -> Option<Stream> {
        self.waiter.block_on(|| self.chain.pop()).map(|b| *b)
    }

    pub fn try_pop(&self) -> Option<Stream> {
        self.chain.pop().map(|b| *b)
    }

    pub fn stop(&self) {
        self.waiter.stop();
    }
}

/// FIFO of payload elements behind one receive window.
///
/// `len_wait` packs the queued byte count (high 32 bits) with a consumer-wait
/// bit (low bits): a popper that finds the count at zero sets the bit and
/// parks; the next push clears it and hands the popper a wake token.
pub(crate) struct RecvQueue {
    len_wait: AtomicU64,
    chain: RingChain<Element>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    stopped: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

const LEN_SHIFT: u32 = 32;

impl RecvQueue {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(2);
        Self {
            len_wait: AtomicU64::new(0),
            chain: RingChain::new(64),
            wake_tx,
            wake_rx,
            stop_tx,
            stop_rx,
            stopped: AtomicBool::new(false),
            deadline: Mutex::new(None),
        }
    }

    pub fn push(&self, el: Box<Element>) {
        let waiting = loop {
            let word = self.len_wait.load(Ordering::Acquire);
            let len = (word >> LEN_SHIFT) as u32;
            let next = u64::from(len + u32::from(el.len)) << LEN_SHIFT;
            if self
                .len_wait
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break word & 1 == 1;
            }
        };
        self.chain.push(el);
        if waiting {
            let _ = self.wake_tx.try_send(());
        }
    }

    /// Blocks until an element arrives, the queue stops (EOF), or the read
    /// deadline passes.
    pub fn pop(&self) -> Result<Box<Element>> {
        loop {
            let word = self.len_wait.load(Ordering::Acquire);
            if (word >> LEN_SHIFT) as u32 == 0 {
                if self.stopped.load(Ordering::Acquire) {
                    return Err(Error::StreamClosed);
                }
                if self
                    .len_wait
                    .compare_exchange(word, word | 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                self.wait_push()?;
                continue;
            }
            // Count says data exists; the element may still be in flight
            // behind the pusher, so a miss is just retried.
            if let Some(el) = self.try_pop() {
                return Ok(el);
            }
            thread::yield_now();
        }
    }

    pub fn try_pop(&self) -> Option<Box<Element>> {
        let el = self.chain.pop()?;
        self.len_wait.fetch_sub(u64::from(el.len) << LEN_SHIFT, Ordering::AcqRel);
        Some(el)
    }

    fn wait_push(&self) -> Result<()> {
        let deadline = *self.deadline.lock().unwrap();
        let timer = match deadline {
            Some(t) => {
                let now = Instant::now();
                if t > now { after(t - now) } else { never() }
            }
            None => never(),
        };
        select! {
            recv(self.wake_rx) -> _ => Ok(()),
            recv(self.stop_rx) -> _ => Err(Error::StreamClosed),
            recv(timer) -> _ => Err(Error::ReadTimeout),
        }
    }

    pub fn queued_bytes(&self) -> u32 {
        (self.len_wait.load(Ordering::Acquire) >> LEN_SHIFT) as u32
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap() = deadline;
    }

    /// Unblocks any popper for good; buffered elements still drain.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.stop_tx.try_send(());
            let _ = self.stop_tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::Pools;

    fn data_frame(pools: &Pools, id: i32, byte: u8) -> Box<Frame> {
        Frame::data(Flag::Msg, id, &[byte], pools).unwrap()
    }

    #[test]
    fn ping_overtakes_queued_data() {
        let pools = Pools::new();
        let q = PriorityQueue::new();
        q.push(data_frame(&pools, 1, 0));
        q.push(data_frame(&pools, 1, 1));
        q.push(Frame::control(Flag::Ping, -1, &pools));
        assert_eq!(q.try_pop().unwrap().flag, Flag::Ping);
        assert_eq!(q.try_pop().unwrap().flag, Flag::Msg);
    }

    #[test]
    fn control_overtakes_data() {
        let pools = Pools::new();
        let q = PriorityQueue::new();
        q.push(data_frame(&pools, 1, 0));
        q.push(Frame::control(Flag::NewStream, 2, &pools));
        assert_eq!(q.try_pop().unwrap().flag, Flag::NewStream);
        assert_eq!(q.try_pop().unwrap().flag, Flag::Msg);
    }

    #[test]
    fn data_not_starved_forever() {
        let pools = Pools::new();
        let q = PriorityQueue::new();
        for i in 0..30 {
            q.push(Frame::control(Flag::NewStream, i, &pools));
        }
        q.push(data_frame(&pools, 99, 0));
        let mut seen_data_at = None;
        for n in 0..31 {
            let f = q.try_pop().unwrap();
            if f.flag == Flag::Msg {
                seen_data_at = Some(n);
                break;
            }
        }
        // Bounded by max starving + 1 dequeues.
        assert!(seen_data_at.is_some_and(|n| n <= 8), "data starved: {seen_data_at:?}");
    }

    #[test]
    fn pop_blocks_until_push() {
        let pools = Pools::new();
        let q = PriorityQueue::new();
        std::thread::scope(|s| {
            let h = s.spawn(|| q.pop());
            std::thread::sleep(Duration::from_millis(50));
            q.push(Frame::control(Flag::Ping, -1, &pools));
            assert_eq!(h.join().unwrap().unwrap().flag, Flag::Ping);
        });
    }

    #[test]
    fn stop_unblocks_pop() {
        let q = PriorityQueue::new();
        std::thread::scope(|s| {
            let h = s.spawn(|| q.pop());
            std::thread::sleep(Duration::from_millis(50));
            q.stop();
            assert!(h.join().unwrap().is_none());
        });
    }

    fn element(bytes: &[u8], part: bool) -> Box<Element> {
        Box::new(Element { buf: bytes.to_vec(), len: bytes.len() as u16, part })
    }

    #[test]
    fn recv_queue_accounts_bytes() {
        let q = RecvQueue::new();
        q.push(element(b"hello", false));
        q.push(element(b"you", true));
        assert_eq!(q.queued_bytes(), 8);
        assert_eq!(q.pop().unwrap().len, 5);
        assert_eq!(q.queued_bytes(), 3);
        assert_eq!(q.pop().unwrap().len, 3);
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn recv_queue_pop_waits_for_push() {
        let q = RecvQueue::new();
        std::thread::scope(|s| {
            let h = s.spawn(|| q.pop());
            std::thread::sleep(Duration::from_millis(50));
            q.push(element(b"x", false));
            assert_eq!(h.join().unwrap().unwrap().len, 1);
        });
    }

    #[test]
    fn recv_queue_stop_is_eof() {
        let q = RecvQueue::new();
        std::thread::scope(|s| {
            let h = s.spawn(|| q.pop());
            std::thread::sleep(Duration::from_millis(50));
            q.stop();
            assert!(matches!(h.join().unwrap(), Err(Error::StreamClosed)));
        });
        assert!(matches!(q.pop(), Err(Error::StreamClosed)));
    }

    #[test]
    fn recv_queue_deadline_fires() {
        let q = RecvQueue::new();
        q.set_deadline(Some(Instant::now() + Duration::from_millis(50)));
        assert!(matches!(q.pop(), Err(Error::ReadTimeout)));
    }

    #[test]
    fn recv_queue_drains_after_stop() {
        let q = RecvQueue::new();
        q.push(element(b"tail", false));
        q.stop();
        assert_eq!(q.pop().unwrap().len, 4);
        assert!(matches!(q.pop(), Err(Error::StreamClosed)));
    }
}
