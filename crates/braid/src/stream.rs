use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, after, bounded, select};

use crate::{
    error::{Error, Result},
    frame::Flag,
    mux::MuxShared,
    window::{RecvWindow, SendWindow},
};

/// One multiplexed virtual connection.
///
/// Behaves like an ordinary blocking socket: reads block until data or EOF,
/// writes block on flow-control credit, both honor per-direction deadlines,
/// and the reported addresses are the carrier's. Handles are cheap clones
/// over shared state; closing any of them closes the stream.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

pub(crate) struct StreamShared {
    id: i32,
    mux: Arc<MuxShared>,
    pub(crate) recv: RecvWindow,
    pub(crate) send: SendWindow,
    is_closed: AtomicBool,
    /// Set when the peer announced close; reads drain, writes fail.
    closing: AtomicBool,
    close_once: Once,
    pub(crate) open_ok_tx: Sender<()>,
    open_ok_rx: Receiver<()>,
    pub(crate) open_fail_tx: Sender<()>,
    open_fail_rx: Receiver<()>,
}

impl Stream {
    pub(crate) fn new(id: i32, mux: Arc<MuxShared>) -> Self {
        let (open_ok_tx, open_ok_rx) = bounded(1);
        let (open_fail_tx, open_fail_rx) = bounded(1);
        Self {
            shared: Arc::new(StreamShared {
                id,
                mux,
                recv: RecvWindow::new(),
                send: SendWindow::new(),
                is_closed: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                close_once: Once::new(),
                open_ok_tx,
                open_ok_rx,
                open_fail_tx,
                open_fail_rx,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &StreamShared {
        &self.shared
    }

    /// Stream id, unique within its mux.
    pub fn id(&self) -> i32 {
        self.shared.id
    }

    /// Reads buffered bytes, blocking for the first one. Returns `Ok(0)` at
    /// EOF, once the stream has closed and the buffer has drained.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let sh = &self.shared;
        if sh.mux.is_closed() {
            return Err(Error::MuxClosed.into());
        }
        if sh.is_closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match sh.recv.read(&sh.mux, sh.id, buf) {
            Ok(n) => Ok(n),
            Err(Error::StreamClosed) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the whole buffer through the send window, blocking on credit.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let sh = &self.shared;
        if sh.mux.is_closed() {
            return Err(Error::MuxClosed.into());
        }
        if sh.is_closed.load(Ordering::Acquire) || sh.closing.load(Ordering::Acquire) {
            return Err(Error::StreamClosed.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        sh.send.write_all(&sh.mux, sh.id, buf).map_err(Into::into)
    }

    /// Closes both directions and tells the peer. Safe to call repeatedly;
    /// only the first call does anything.
    pub fn close(&self) {
        let sh = &self.shared;
        sh.close_once.call_once(|| {
            sh.is_closed.store(true, Ordering::Release);
            sh.mux.table_remove(sh.id);
            if !sh.mux.is_closed() {
                sh.mux.send_control(Flag::StreamClose, sh.id);
            }
            sh.send.close();
            sh.recv.close(&sh.mux.pools);
        });
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.mux.carrier_local_addr()
    }

    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.shared.mux.carrier_peer_addr()
    }

    /// Applies to both directions. `None` waits indefinitely.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.recv.set_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.send.set_deadline(deadline);
    }

    /// Peer announced close: let reads drain to EOF, fail new writes.
    pub(crate) fn mark_closing(&self) {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.recv.stop();
    }

    pub(crate) fn is_stream_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::Acquire)
    }

    /// Blocks the opener until the peer acknowledges, refuses, the mux
    /// closes, or the timer runs out.
    pub(crate) fn wait_open(&self, timeout: Duration) -> Result<()> {
        select! {
            recv(self.shared.open_ok_rx) -> _ => Ok(()),
            recv(self.shared.open_fail_rx) -> _ => Err(Error::OpenRefused),
            recv(self.shared.mux.close_rx) -> _ => Err(Error::MuxClosed),
            recv(after(timeout)) -> _ => Err(Error::OpenTimeout),
        }
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf)
    }
}

impl io::Read for &Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(*self, buf)
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("closed", &self.is_stream_closed())
            .finish()
    }
}
