use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use tracing::{debug, warn};

use crate::{
    carrier::{Carrier, CarrierIo, DEFAULT_RECV_BUFFER},
    error::{Error, Result},
    frame::{Flag, Frame, PING_ID},
    pool::Pools,
    queue::{AcceptQueue, PriorityQueue},
    rate::{F64Bits, LatencyRing, ReadBandwidth},
    stream::Stream,
    table::StreamTable,
};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const OPEN_TIMEOUT: Duration = Duration::from_secs(120);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Ids approaching `i32::MAX` by this margin wrap the counter back to zero.
const ID_WRAP_MARGIN: i32 = 10_000;

/// What the carrier runs over; picks the default ping-miss threshold (a KCP
/// link tolerates fewer silent probes than TCP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Tcp,
    Kcp,
}

impl LinkKind {
    fn default_ping_threshold(self) -> u32 {
        match self {
            Self::Tcp => 60,
            Self::Kcp => 20,
        }
    }
}

/// Stream multiplexer over a single reliable carrier.
///
/// Both peers run one instance over the same link. [`Mux::open`] starts an
/// outbound stream, [`Mux::accept`] takes the next inbound one; everything
/// else (flow control, window sizing, health probing) happens on background
/// threads. Dropping the mux closes it.
pub struct Mux {
    shared: Arc<MuxShared>,
}

pub(crate) struct MuxShared {
    carrier: Box<dyn Carrier>,
    pub(crate) pools: Pools,
    table: StreamTable,
    write_queue: PriorityQueue,
    accept_queue: AcceptQueue,
    accept_rx: Receiver<Stream>,
    close_tx: Mutex<Option<Sender<()>>>,
    pub(crate) close_rx: Receiver<()>,
    id_counter: AtomicI32,
    is_closed: AtomicBool,
    latency: F64Bits,
    read_bw: F64Bits,
    ping_misses: AtomicU32,
    ping_threshold: u32,
}

impl Mux {
    /// Wraps `carrier` and starts the mux tasks. `ping_threshold` overrides
    /// the per-kind default number of 5-second probe misses tolerated before
    /// the link is declared dead.
    pub fn new<C: Carrier>(carrier: C, kind: LinkKind, ping_threshold: Option<u32>) -> Self {
        let threshold = match ping_threshold {
            Some(t) if t > 0 => t,
            _ => kind.default_ping_threshold(),
        };
        let (accept_tx, accept_rx) = bounded(0);
        let (ping_tx, ping_rx) = bounded(1);
        let (close_tx, close_rx) = bounded::<()>(1);

        let shared = Arc::new(MuxShared {
            carrier: Box::new(carrier),
            pools: Pools::new(),
            table: StreamTable::new(),
            write_queue: PriorityQueue::new(),
            accept_queue: AcceptQueue::new(),
            accept_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            id_counter: AtomicI32::new(0),
            is_closed: AtomicBool::new(false),
            latency: F64Bits::default(),
            read_bw: F64Bits::default(),
            ping_misses: AtomicU32::new(0),
            ping_threshold: threshold,
        });

        spawn_task("braid-read", {
            let shared = shared.clone();
            move || reader_loop(&shared, &ping_tx)
        });
        spawn_task("braid-write", {
            let shared = shared.clone();
            move || writer_loop(&shared)
        });
        spawn_task("braid-accept", {
            let shared = shared.clone();
            move || accept_dispatcher(&shared, &accept_tx)
        });
        spawn_task("braid-ping-send", {
            let shared = shared.clone();
            move || ping_prober(&shared)
        });
        spawn_task("braid-ping-recv", {
            let shared = shared.clone();
            move || ping_receiver(&shared, &ping_rx)
        });

        Self { shared }
    }

    /// Opens a new outbound stream and waits for the peer to take it.
    pub fn open(&self) -> Result<Stream> {
        let sh = &self.shared;
        if sh.is_closed() {
            return Err(Error::MuxClosed);
        }
        let id = sh.next_stream_id();
        let stream = Stream::new(id, sh.clone());
        // Registered before the frame goes out so the ack finds it.
        sh.table.insert(id, stream.clone());
        sh.send_control(Flag::NewStream, id);
        match stream.wait_open(OPEN_TIMEOUT) {
            Ok(()) => Ok(stream),
            Err(e) => {
                stream.close();
                Err(e)
            }
        }
    }

    /// Takes the next inbound stream, blocking until one arrives or the mux
    /// closes. Safe to call from several threads at once.
    pub fn accept(&self) -> Result<Stream> {
        if self.shared.is_closed() {
            return Err(Error::MuxClosed);
        }
        self.shared.accept_rx.recv().map_err(|_| Error::MuxClosed)
    }

    /// The carrier's local address.
    pub fn addr(&self) -> io::Result<SocketAddr> {
        self.shared.carrier.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes every stream, stops the tasks, and shuts the carrier down.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        let _ = self.shared.close();
    }
}

impl MuxShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(crate) fn read_bandwidth(&self) -> f64 {
        self.read_bw.get()
    }

    pub(crate) fn latency_secs(&self) -> f64 {
        self.latency.get()
    }

    pub(crate) fn table_remove(&self, id: i32) {
        self.table.remove(id);
    }

    pub(crate) fn carrier_local_addr(&self) -> io::Result<SocketAddr> {
        self.carrier.local_addr()
    }

    pub(crate) fn carrier_peer_addr(&self) -> io::Result<SocketAddr> {
        self.carrier.peer_addr()
    }

    pub(crate) fn send_control(&self, flag: Flag, id: i32) {
        if self.is_closed() {
            return;
        }
        self.write_queue.push(Frame::control(flag, id, &self.pools));
    }

    pub(crate) fn send_window_update(&self, id: i32, window: u64) {
        if self.is_closed() {
            return;
        }
        self.write_queue.push(Frame::window_update(id, window, &self.pools));
    }

    /// Queues one data segment. The segmenter guarantees the length cap; a
    /// violation here means the stream is unrecoverable, so the mux goes
    /// down with it.
    pub(crate) fn send_segment(&self, id: i32, content: &[u8], part: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::MuxClosed);
        }
        let flag = if part { Flag::MsgPart } else { Flag::Msg };
        match Frame::data(flag, id, content, &self.pools) {
            Ok(frame) => {
                self.write_queue.push(frame);
                Ok(())
            }
            Err(e) => {
                warn!(%e, "failed to build data frame");
                let _ = self.close();
                Err(e)
            }
        }
    }

    fn send_payload(&self, flag: Flag, id: i32, content: &[u8]) {
        if self.is_closed() {
            return;
        }
        match Frame::data(flag, id, content, &self.pools) {
            Ok(frame) => self.write_queue.push(frame),
            Err(e) => {
                warn!(%e, "failed to build frame");
                let _ = self.close();
            }
        }
    }

    fn next_stream_id(&self) -> i32 {
        loop {
            if i32::MAX - self.id_counter.load(Ordering::Relaxed) < ID_WRAP_MARGIN {
                self.id_counter.store(0, Ordering::Relaxed);
            }
            let id = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
            if id > 0 && self.table.get(id).is_none() {
                return id;
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return Err(Error::MuxClosed);
        }
        debug!("closing mux");
        self.table.close_all();
        // Broadcast: every suspension selecting on close_rx wakes for good.
        *self.close_tx.lock().unwrap() = None;
        let _ = self.carrier.set_io_timeout(CLOSE_GRACE);
        self.release();
        let _ = self.carrier.shutdown();
        Ok(())
    }

    /// Hands queued frames and pending accepts back to the pools, then stops
    /// the queues so the writer and dispatcher exit.
    fn release(&self) {
        while let Some(frame) = self.write_queue.try_pop() {
            self.pools.retire_frame(frame);
        }
        while self.accept_queue.try_pop().is_some() {}
        self.write_queue.stop();
        self.accept_queue.stop();
    }
}

fn spawn_task(name: &str, f: impl FnOnce() + Send + 'static) {
    thread::Builder::new().name(name.to_string()).spawn(f).expect("failed to spawn mux task");
}

/// Parses carrier frames and dispatches them to streams and control paths.
/// Any decode or carrier error here is fatal to the mux.
fn reader_loop(shared: &Arc<MuxShared>, ping_tx: &Sender<(Vec<u8>, u16)>) {
    let recv_buffer = shared.carrier.recv_buffer_size().unwrap_or(DEFAULT_RECV_BUFFER);
    let mut bw = ReadBandwidth::new(recv_buffer);
    let mut io = CarrierIo(shared.carrier.as_ref());
    loop {
        if shared.is_closed() {
            break;
        }
        bw.start_read(&shared.read_bw);
        let (mut frame, wire_len) = match Frame::decode(&mut io, &shared.pools) {
            Ok(v) => v,
            Err(e) => {
                if !shared.is_closed() {
                    warn!(%e, "carrier read failed");
                }
                let _ = shared.close();
                break;
            }
        };
        bw.add(wire_len);

        match frame.flag {
            Flag::NewStream => {
                shared.accept_queue.push(Stream::new(frame.id, shared.clone()));
            }
            Flag::Ping => {
                let len = usize::from(frame.len);
                let payload = frame.payload.take().unwrap_or_default();
                shared.send_payload(Flag::PingReturn, PING_ID, &payload[..len]);
                shared.pools.buf.put(payload);
            }
            Flag::PingReturn => {
                let len = frame.len;
                if let Some(payload) = frame.payload.take() {
                    if let Err(returned) = ping_tx.send((payload, len)) {
                        shared.pools.buf.put(returned.into_inner().0);
                    }
                }
            }
            _ => dispatch_to_stream(shared, &mut frame),
        }
        shared.pools.retire_frame(frame);
    }
}

fn dispatch_to_stream(shared: &Arc<MuxShared>, frame: &mut Frame) {
    let Some(stream) = shared.table.get(frame.id) else {
        // Data for an unknown id is dropped; a close for one is already
        // moot.
        return;
    };
    if stream.is_stream_closed() {
        return;
    }
    match frame.flag {
        Flag::Msg | Flag::MsgPart => {
            let part = frame.flag == Flag::MsgPart;
            let len = frame.len;
            let payload = frame.payload.take().unwrap_or_default();
            if let Err(e) = stream.shared().recv.push_segment(shared, frame.id, payload, len, part)
            {
                debug!(id = frame.id, %e, "segment rejected");
                stream.close();
            }
        }
        Flag::NewStreamAck => {
            let _ = stream.shared().open_ok_tx.try_send(());
        }
        Flag::NewStreamNak => {
            let _ = stream.shared().open_fail_tx.try_send(());
        }
        Flag::WindowUpdate => stream.shared().send.set_size(frame.window),
        Flag::StreamClose => stream.mark_closing(),
        Flag::Ping | Flag::PingReturn | Flag::NewStream => {}
    }
}

/// Single consumer of the priority queue; the only thread that writes the
/// carrier.
fn writer_loop(shared: &Arc<MuxShared>) {
    let mut io = CarrierIo(shared.carrier.as_ref());
    loop {
        if shared.is_closed() {
            break;
        }
        let Some(frame) = shared.write_queue.pop() else {
            break;
        };
        if shared.is_closed() {
            shared.pools.retire_frame(frame);
            break;
        }
        let result = frame.encode(&mut io);
        shared.pools.retire_frame(frame);
        if let Err(e) = result {
            if !shared.is_closed() {
                warn!(%e, "carrier write failed");
            }
            let _ = shared.close();
            break;
        }
    }
}

/// Registers inbound streams, hands them to `accept`, and acknowledges the
/// opener.
fn accept_dispatcher(shared: &Arc<MuxShared>, accept_tx: &Sender<Stream>) {
    loop {
        if shared.is_closed() {
            break;
        }
        let Some(stream) = shared.accept_queue.pop() else {
            break;
        };
        if shared.is_closed() {
            break;
        }
        let id = stream.id();
        shared.table.insert(id, stream.clone());
        select! {
            send(accept_tx, stream) -> res => {
                if res.is_err() {
                    break;
                }
            }
            recv(shared.close_rx) -> _ => break,
        }
        shared.send_control(Flag::NewStreamAck, id);
    }
}

fn ping_payload() -> Vec<u8> {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes()
}

/// Sends a probe every five seconds and closes the mux when too many go
/// unanswered.
fn ping_prober(shared: &Arc<MuxShared>) {
    shared.send_payload(Flag::Ping, PING_ID, &ping_payload());
    let ticker = tick(PING_INTERVAL);
    loop {
        select! {
            recv(ticker) -> _ => {}
            recv(shared.close_rx) -> _ => break,
        }
        if shared.is_closed() {
            break;
        }
        let misses = shared.ping_misses.load(Ordering::Relaxed);
        if misses > shared.ping_threshold {
            warn!(misses, threshold = shared.ping_threshold, "ping timed out, closing");
            let _ = shared.close();
            break;
        }
        shared.send_payload(Flag::Ping, PING_ID, &ping_payload());
        shared.ping_misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consumes probe echoes: resets the miss counter and feeds the latency
/// ring with the round trip derived from the echoed timestamp.
fn ping_receiver(shared: &Arc<MuxShared>, ping_rx: &Receiver<(Vec<u8>, u16)>) {
    let mut ring = LatencyRing::new();
    loop {
        let (payload, len) = select! {
            recv(ping_rx) -> msg => match msg {
                Ok(v) => v,
                Err(_) => break,
            },
            recv(shared.close_rx) -> _ => break,
        };
        shared.ping_misses.store(0, Ordering::Relaxed);
        if let Some(rtt) = decode_rtt(&payload[..usize::from(len)]) {
            shared.latency.set(ring.record(rtt));
        }
        shared.pools.buf.put(payload);
    }
}

/// Seconds since the echoed timestamp; `None` for garbage or clock skew.
fn decode_rtt(payload: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(payload).ok()?;
    let sent: DateTime<chrono::FixedOffset> = DateTime::parse_from_rfc3339(text).ok()?;
    let micros = Utc::now().signed_duration_since(sent).num_microseconds()?;
    (micros > 0).then(|| micros as f64 / 1e6)
}
