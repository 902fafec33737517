use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI8, AtomicU64, Ordering},
    },
    thread,
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender, after, bounded, never, select};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    frame::{MAX_SEGMENT_SIZE, MAX_WINDOW_SIZE},
    mux::MuxShared,
    pool::{Element, Pools},
    queue::RecvQueue,
    rate::{DrainState, WriteBandwidth},
};

/// Both windows start here and the receive side never advertises less.
pub(crate) const INITIAL_WINDOW: u32 = 30 * MAX_SEGMENT_SIZE as u32;

const WINDOW_MASK: u32 = (1 << 31) - 1;
const MAX_SHIFT: u32 = 32;
const WAIT_SHIFT: u32 = 63;

/// Window state word: `[1 bit wait][31 bits maxSize][1 unused][31 bits done]`.
///
/// `done` counts bytes read since the last update on the receive side and
/// bytes sent since the last update on the send side. Every compound update
/// goes through a CAS on the whole word; the wait bit and the counters are
/// never split into separate atomics.
#[inline]
pub(crate) fn pack(max: u32, done: u32, wait: bool) -> u64 {
    (u64::from(wait) << WAIT_SHIFT)
        | (u64::from(max & WINDOW_MASK) << MAX_SHIFT)
        | u64::from(done & WINDOW_MASK)
}

#[inline]
pub(crate) fn unpack(word: u64) -> (u32, u32, bool) {
    (
        ((word >> MAX_SHIFT) as u32) & WINDOW_MASK,
        (word as u32) & WINDOW_MASK,
        (word >> WAIT_SHIFT) & 1 == 1,
    )
}

/// Credit-controlled segmenter for one direction of a stream.
///
/// `done` in the word is the byte count sent since the peer's last window
/// update; each update subtracts what the peer has read and replaces the
/// advertised maximum, and the difference is the credit left to send into.
pub(crate) struct SendWindow {
    word: AtomicU64,
    closed: AtomicBool,
    credit_tx: Sender<()>,
    credit_rx: Receiver<()>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    deadline: Mutex<Option<Instant>>,
    /// One mounted buffer at a time; concurrent writers queue here.
    writer: Mutex<()>,
}

impl SendWindow {
    pub fn new() -> Self {
        let (credit_tx, credit_rx) = bounded(1);
        let (close_tx, close_rx) = bounded(1);
        Self {
            word: AtomicU64::new(pack(INITIAL_WINDOW, 0, false)),
            closed: AtomicBool::new(false),
            credit_tx,
            credit_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            deadline: Mutex::new(None),
            writer: Mutex::new(()),
        }
    }

    fn remaining(max: u32, sent: u32) -> u32 {
        (i64::from(max & WINDOW_MASK) - i64::from(sent & WINDOW_MASK)).max(0) as u32
    }

    /// Segments `buf` into frames of at most the segment size, never beyond
    /// the remote credit, blocking when credit runs out.
    pub fn write_all(&self, mux: &MuxShared, id: i32, buf: &[u8]) -> Result<usize> {
        let _mounted = self.writer.lock().unwrap();
        let mut off = 0;
        while off < buf.len() {
            let (seg, part) = self.next_segment(buf.len() - off)?;
            mux.send_segment(id, &buf[off..off + seg], part)?;
            off += seg;
        }
        Ok(off)
    }

    fn next_segment(&self, rest: usize) -> Result<(usize, bool)> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::StreamClosed);
            }
            let word = self.word.load(Ordering::Acquire);
            let (max, sent, _) = unpack(word);
            let remain = Self::remaining(max, sent);
            if remain == 0 {
                if self
                    .word
                    .compare_exchange(word, pack(max, sent, true), Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                self.wait_credit()?;
                continue;
            }
            let seg = rest.min(MAX_SEGMENT_SIZE).min(remain as usize);
            let part = seg < rest;
            self.add_sent(seg as u32);
            return Ok((seg, part));
        }
    }

    fn add_sent(&self, n: u32) {
        loop {
            let word = self.word.load(Ordering::Acquire);
            let (max, sent, wait) = unpack(word);
            if (sent + n) & WINDOW_MASK < sent {
                // Counter would wrap its 31 bits; wait for an update to
                // subtract what the peer has read.
                thread::yield_now();
                continue;
            }
            if self
                .word
                .compare_exchange(word, pack(max, sent + n, wait), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn wait_credit(&self) -> Result<()> {
        let deadline = *self.deadline.lock().unwrap();
        let timer = match deadline {
            Some(t) => {
                let now = Instant::now();
                if t > now { after(t - now) } else { never() }
            }
            None => never(),
        };
        select! {
            recv(self.credit_rx) -> _ => Ok(()),
            recv(self.close_rx) -> _ => Err(Error::StreamClosed),
            recv(timer) -> _ => Err(Error::WriteTimeout),
        }
    }

    /// Applies a window update from the peer: `max` replaces the advertised
    /// size, `read` is subtracted from the sent count. An update that
    /// acknowledges more than was sent is a protocol violation; it is logged
    /// and dropped and the mux carries on.
    pub fn set_size(&self, update: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (remote_max, read, _) = unpack(update);
        let (prev_wait, new_wait) = loop {
            let word = self.word.load(Ordering::Acquire);
            let (max, sent, wait) = unpack(word);
            if read > sent {
                warn!(read, sent, "dropping window update: {}", Error::WindowOverflow);
                return;
            }
            if read == 0 && remote_max == max {
                return;
            }
            let new_sent = sent - read;
            let new_wait = wait && Self::remaining(remote_max, new_sent) == 0;
            if self
                .word
                .compare_exchange(
                    word,
                    pack(remote_max, new_sent, new_wait),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break (wait, new_wait);
            }
        };
        if prev_wait && !new_wait {
            let _ = self.credit_tx.try_send(());
        }
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock().unwrap() = deadline;
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            *self.close_tx.lock().unwrap() = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> (u32, u32, bool) {
        unpack(self.word.load(Ordering::Acquire))
    }
}

struct Cursor {
    element: Option<Box<Element>>,
    off: usize,
    bw: DrainState,
}

/// Reorder-free receive buffer with a dynamically sized window.
///
/// The reader loop pushes payload elements; the stream owner drains them.
/// `done` in the word counts bytes handed to the caller since the last
/// update frame, and the wait bit records that the peer was seen blocked on
/// a full window.
pub(crate) struct RecvWindow {
    word: AtomicU64,
    closed: AtomicBool,
    queue: RecvQueue,
    calc_count: AtomicI8,
    bw: WriteBandwidth,
    cursor: Mutex<Cursor>,
}

impl RecvWindow {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(INITIAL_WINDOW, 0, false)),
            closed: AtomicBool::new(false),
            queue: RecvQueue::new(),
            calc_count: AtomicI8::new(0),
            bw: WriteBandwidth::new(),
            cursor: Mutex::new(Cursor { element: None, off: 0, bw: DrainState::default() }),
        }
    }

    fn remaining(&self, max: u32, delta: u16) -> u32 {
        (i64::from(max) - i64::from(self.queue.queued_bytes()) - i64::from(delta)).max(0) as u32
    }

    /// Accepts one segment from the reader loop.
    ///
    /// When space remains and the peer is not blocked, the accumulated read
    /// count is folded into an immediate window update so a resize reaches
    /// the sender without waiting for a drain. When the push fills the
    /// window, only the wait bit is raised; the update happens once the
    /// caller frees space.
    pub fn push_segment(
        &self,
        mux: &MuxShared,
        id: i32,
        buf: Vec<u8>,
        len: u16,
        part: bool,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            mux.pools.buf.put(buf);
            return Err(Error::StreamClosed);
        }
        let el = mux.pools.element.get(buf, len, part);
        self.calc_size(mux);
        let announce = loop {
            let word = self.word.load(Ordering::Acquire);
            let (max, read, wait) = unpack(word);
            let remain = self.remaining(max, len);
            if remain == 0 && !wait {
                if self
                    .word
                    .compare_exchange(word, pack(max, read, true), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break None;
                }
            } else if !wait {
                if self
                    .word
                    .compare_exchange(word, pack(max, 0, false), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break Some(pack(max, read, false));
                }
            } else {
                // Window already full with the peer marked waiting; buffer
                // the segment anyway, the ack comes when space frees up.
                break None;
            }
        };
        self.queue.push(el);
        if let Some(update) = announce {
            mux.send_window_update(id, update);
        }
        Ok(())
    }

    /// Recomputes the advertised window every tenth push from the current
    /// bandwidth-delay estimate.
    fn calc_size(&self, mux: &MuxShared) {
        if self.calc_count.load(Ordering::Relaxed) == 0 {
            let mux_bw = mux.read_bandwidth();
            let mut conn_bw = self.bw.get();
            if conn_bw > 0.0 && mux_bw > 0.0 && conn_bw > mux_bw {
                conn_bw = mux_bw;
                self.bw.grow_ratio();
            }
            let latency = mux.latency_secs();
            let n = raw_target(mux_bw, conn_bw, latency);
            loop {
                let word = self.word.load(Ordering::Acquire);
                let (size, read, wait) = unpack(word);
                let remain = self.remaining(size, 0);
                let target = bounded_target(n, size, remain, mux_bw, conn_bw);
                if self
                    .word
                    .compare_exchange(word, pack(target, read, wait), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
            self.calc_count.store(-10, Ordering::Relaxed);
        }
        self.calc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drains buffered segments into `p`, blocking for the first one.
    pub fn read(&self, mux: &MuxShared, id: i32, p: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }
        let mut cur = self.cursor.lock().unwrap();
        self.bw.start_read(&mut cur.bw);
        let n = self.read_from_queue(&mut cur, mux, id, p)?;
        self.bw.add(&mut cur.bw, n.min(usize::from(u16::MAX)) as u16);
        Ok(n)
    }

    fn read_from_queue(
        &self,
        cur: &mut Cursor,
        mux: &MuxShared,
        id: i32,
        p: &mut [u8],
    ) -> Result<usize> {
        let mut p_off = 0;
        loop {
            let drained = cur.element.as_ref().is_none_or(|el| cur.off == usize::from(el.len));
            if drained {
                if let Some(el) = cur.element.take() {
                    mux.pools.element.put(el);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::StreamClosed);
                }
                match self.queue.pop() {
                    Ok(el) => {
                        cur.element = Some(el);
                        cur.off = 0;
                    }
                    Err(e) => {
                        // Stopped or timed out: this side of the stream is
                        // done, release what is still buffered. Bytes
                        // already copied still belong to the caller.
                        self.close(&mux.pools);
                        if p_off > 0 {
                            return Ok(p_off);
                        }
                        return Err(e);
                    }
                }
            }
            let el = cur.element.as_mut().unwrap();
            let len = usize::from(el.len);
            let l = (len - cur.off).min(p.len() - p_off);
            p[p_off..p_off + l].copy_from_slice(&el.buf[cur.off..cur.off + l]);
            p_off += l;
            cur.off += l;
            let part = el.part;
            if cur.off == len {
                mux.pools.buf.put(std::mem::take(&mut el.buf));
                self.send_status(mux, id, el.len);
            }
            if p_off < p.len() && part {
                continue;
            }
            return Ok(p_off);
        }
    }

    /// Accounts `l` delivered bytes and decides whether to ack.
    ///
    /// An update goes out when the peer was seen waiting and a slot is free
    /// again, when half the window has been consumed, or when the window is
    /// completely empty; the counter resets with each update. If the count
    /// would wrap its 31 bits, the update is forced and the counter restarts
    /// at `l`.
    fn send_status(&self, mux: &MuxShared, id: i32, l: u16) {
        let l32 = u32::from(l);
        loop {
            let word = self.word.load(Ordering::Acquire);
            let (max, read, wait) = unpack(word);
            if read <= (read + l32) & WINDOW_MASK {
                let new_read = read + l32;
                let remain = self.remaining(max, 0);
                if (wait && remain > 0) || new_read >= max / 2 || remain == max {
                    if self
                        .word
                        .compare_exchange(word, pack(max, 0, false), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        mux.send_window_update(id, pack(max, new_read, false));
                        return;
                    }
                } else if self
                    .word
                    .compare_exchange(word, pack(max, new_read, wait), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else if self
                .word
                .compare_exchange(word, pack(max, l32, wait), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                mux.send_window_update(id, pack(max, read, false));
                return;
            }
            thread::yield_now();
        }
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.queue.set_deadline(deadline);
    }

    /// Unblocks readers once buffered data drains; used when the peer closes.
    pub fn stop(&self) {
        self.queue.stop();
    }

    pub fn close(&self, pools: &Pools) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.stop();
            while let Some(mut el) = self.queue.try_pop() {
                let buf = std::mem::take(&mut el.buf);
                if !buf.is_empty() {
                    pools.buf.put(buf);
                }
                pools.element.put(el);
            }
        }
    }
}

/// Bandwidth-delay candidate with the floors applied: never below the
/// initial window, and never below the pipeline-fill gain that keeps enough
/// bytes in flight to measure bandwidth once latency passes ~10 ms.
fn raw_target(mux_bw: f64, conn_bw: f64, latency: f64) -> u32 {
    let mut n = if conn_bw > 0.0 && mux_bw > 0.0 {
        (latency * (mux_bw + conn_bw)) as u32
    } else {
        0
    };
    n = n.max(INITIAL_WINDOW);
    n.max((f64::from(3000 * MAX_SEGMENT_SIZE as u32) * latency) as u32)
}

/// Applies the fill-dependent gain and the growth/shrink caps against the
/// current window state.
fn bounded_target(n: u32, size: u32, remain: u32, mux_bw: f64, conn_bw: f64) -> u32 {
    let mut n = n;
    let ra = f64::from(remain) / f64::from(size);
    if ra > 0.8 {
        // A mostly empty window may just mean the pipeline is not yet
        // filled; boost quadratically with the free fraction.
        n = (f64::from(n) * 1.5625 * ra * ra) as u32;
    }
    if n < size / 2 {
        n = size / 2;
    }
    if n > 2 * size {
        if size == INITIAL_WINDOW {
            n = n.min(size * 6);
        } else {
            n = 2 * size;
        }
    }
    if conn_bw > 0.0 && mux_bw > 0.0 {
        let limit = (f64::from(MAX_WINDOW_SIZE) * (conn_bw / (mux_bw + conn_bw))) as u32;
        if n > limit {
            debug!(n, limit, conn_bw, mux_bw, "receive window hit the share cap");
            n = limit;
        }
    }
    n.max(INITIAL_WINDOW)
}
