use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

/// Fallback when the carrier has no queryable socket.
pub(crate) const DEFAULT_RECV_BUFFER: usize = 5 * 1024 * 1024;

/// The single reliable, ordered byte link a mux rides.
///
/// Reads and writes take `&self` because the mux drives the two directions
/// from separate threads over one shared handle, the way a socket allows
/// concurrent read and write halves.
pub trait Carrier: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Kernel receive-buffer size, used to calibrate bandwidth samples.
    /// `None` means unknown; the estimator assumes [`DEFAULT_RECV_BUFFER`].
    fn recv_buffer_size(&self) -> Option<usize> {
        None
    }

    /// Bounds how long pending io may linger once the mux is closing.
    fn set_io_timeout(&self, timeout: Duration) -> io::Result<()>;

    fn shutdown(&self) -> io::Result<()>;
}

impl Carrier for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = self;
        Read::read(&mut s, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut s = self;
        Write::write_all(&mut s, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn recv_buffer_size(&self) -> Option<usize> {
        socket_recv_buffer(self)
    }

    fn set_io_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Kernel SO_RCVBUF for the stream's socket.
#[cfg(unix)]
fn socket_recv_buffer(stream: &TcpStream) -> Option<usize> {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let mut size: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::from_mut(&mut size).cast::<libc::c_void>(),
            &mut len,
        )
    };
    (rc == 0 && size > 0).then_some(size as usize)
}

/// Windows cannot query SO_RCVBUF through the std socket here; assume a
/// large buffer so the calibration threshold is a constant.
#[cfg(not(unix))]
fn socket_recv_buffer(_stream: &TcpStream) -> Option<usize> {
    Some(15 * 1024 * 1024)
}

/// `io::Read`/`io::Write` adapters over a shared carrier handle, for the
/// frame codec.
pub(crate) struct CarrierIo<'a>(pub &'a dyn Carrier);

impl Read for CarrierIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for CarrierIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
