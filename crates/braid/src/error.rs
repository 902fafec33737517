use std::io;

use thiserror::Error;

use crate::frame::MAX_SEGMENT_SIZE;

#[derive(Error, Debug)]
pub enum Error {
    #[error("mux closed")]
    MuxClosed,
    #[error("stream closed")]
    StreamClosed,
    #[error("open timed out")]
    OpenTimeout,
    #[error("peer refused the stream")]
    OpenRefused,
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("window update acknowledges more than was sent")]
    WindowOverflow,
    #[error("frame payload exceeds {MAX_SEGMENT_SIZE} bytes")]
    FrameTooLarge,
    #[error("truncated frame")]
    FrameTruncated,
    #[error("unknown frame flag {0}")]
    UnknownFlag(u8),
    #[error("carrier io: {0}")]
    Carrier(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::MuxClosed => io::ErrorKind::NotConnected,
            Error::StreamClosed => io::ErrorKind::BrokenPipe,
            Error::ReadTimeout | Error::WriteTimeout | Error::OpenTimeout => {
                io::ErrorKind::TimedOut
            }
            Error::OpenRefused => io::ErrorKind::ConnectionRefused,
            Error::Carrier(io) => return io,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
