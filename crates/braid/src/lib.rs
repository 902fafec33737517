//! Stream multiplexer for reverse tunnels.
//!
//! braid turns one reliable byte link (the *carrier*, typically a TCP or KCP
//! connection) into a large dynamic population of independent bidirectional
//! streams, each of which behaves like an ordinary blocking socket. Per
//! stream, a sliding window with bandwidth-delay-driven sizing provides
//! backpressure; per mux, a three-class priority queue keeps health probes
//! and stream control ahead of bulk data on the shared link.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use braid::{LinkKind, Mux};
//!
//! let carrier = TcpStream::connect("203.0.113.9:8024")?;
//! let mux = Mux::new(carrier, LinkKind::Tcp, None);
//! let stream = mux.open()?;
//! std::io::Write::write_all(&mut &stream, b"hello")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod carrier;
mod error;
mod frame;
mod mux;
mod pool;
mod queue;
mod rate;
mod stream;
mod table;
mod window;

pub use carrier::Carrier;
pub use error::{Error, Result};
pub use frame::{Flag, MAX_SEGMENT_SIZE};
pub use mux::{LinkKind, Mux};
pub use stream::Stream;
