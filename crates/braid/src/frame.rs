use std::io::{self, Read, Write};

use crate::{
    error::{Error, Result},
    pool::Pools,
};

/// Payload cap per frame: a 4 KiB pooled buffer minus the largest header.
pub const MAX_SEGMENT_SIZE: usize = 4085;

/// Stream id reserved for PING / PING_RETURN frames.
pub const PING_ID: i32 = -1;

/// Largest receive window ever advertised; TCP-scale windows waste memory
/// here, so 128 MiB is the ceiling.
pub const MAX_WINDOW_SIZE: u32 = 1 << 27;

const HEADER_LEN: usize = 13;

/// Wire flag byte. The values are the protocol; do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Ping = 0,
    NewStreamAck = 1,
    NewStreamNak = 2,
    Msg = 3,
    MsgPart = 4,
    WindowUpdate = 5,
    NewStream = 6,
    StreamClose = 7,
    PingReturn = 8,
}

impl Flag {
    fn from_wire(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Ping,
            1 => Self::NewStreamAck,
            2 => Self::NewStreamNak,
            3 => Self::Msg,
            4 => Self::MsgPart,
            5 => Self::WindowUpdate,
            6 => Self::NewStream,
            7 => Self::StreamClose,
            8 => Self::PingReturn,
            other => return Err(Error::UnknownFlag(other)),
        })
    }

    /// Flags whose frames carry a `u16` length and that many payload bytes.
    #[inline]
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Ping | Self::PingReturn | Self::Msg | Self::MsgPart)
    }
}

/// One frame on the carrier: `flag (u8)`, `stream id (i32 LE)`, then per
/// flag either a length-prefixed payload, a 64-bit window word, or nothing.
#[derive(Debug)]
pub struct Frame {
    pub flag: Flag,
    pub id: i32,
    pub window: u64,
    pub len: u16,
    /// Pooled buffer; the first `len` bytes are the payload.
    pub payload: Option<Vec<u8>>,
}

impl Default for Frame {
    fn default() -> Self {
        Self { flag: Flag::Ping, id: PING_ID, window: 0, len: 0, payload: None }
    }
}

impl Frame {
    pub(crate) fn control(flag: Flag, id: i32, pools: &Pools) -> Box<Self> {
        let mut f = pools.frame.get();
        f.flag = flag;
        f.id = id;
        f
    }

    pub(crate) fn window_update(id: i32, window: u64, pools: &Pools) -> Box<Self> {
        let mut f = pools.frame.get();
        f.flag = Flag::WindowUpdate;
        f.id = id;
        f.window = window;
        f
    }

    /// Copies `content` into a pooled buffer. Fails if it exceeds the
    /// segment cap, which means the caller segmented wrongly.
    pub(crate) fn data(flag: Flag, id: i32, content: &[u8], pools: &Pools) -> Result<Box<Self>> {
        if content.len() > MAX_SEGMENT_SIZE {
            return Err(Error::FrameTooLarge);
        }
        let mut buf = pools.buf.get();
        buf[..content.len()].copy_from_slice(content);
        let mut f = pools.frame.get();
        f.flag = flag;
        f.id = id;
        f.len = content.len() as u16;
        f.payload = Some(buf);
        Ok(f)
    }

    pub(crate) fn reset(&mut self) {
        debug_assert!(self.payload.is_none(), "payload must go back to its own pool");
        *self = Self::default();
    }

    pub(crate) fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.flag as u8;
        header[1..5].copy_from_slice(&self.id.to_le_bytes());
        if self.flag.carries_payload() {
            header[5..7].copy_from_slice(&self.len.to_le_bytes());
            w.write_all(&header[..7])?;
            let payload = self.payload.as_deref().unwrap_or(&[]);
            w.write_all(&payload[..self.len as usize])
        } else if self.flag == Flag::WindowUpdate {
            header[5..13].copy_from_slice(&self.window.to_le_bytes());
            w.write_all(&header[..13])
        } else {
            w.write_all(&header[..5])
        }
    }

    /// Reads one frame. Any failure here means the carrier byte stream is
    /// out of sync and the whole mux must come down. Returns the frame and
    /// the number of wire bytes consumed.
    pub(crate) fn decode<R: Read>(r: &mut R, pools: &Pools) -> Result<(Box<Self>, u16)> {
        let mut header = [0u8; HEADER_LEN];
        read_wire(r, &mut header[..5])?;
        let mut n = 5u16;

        let mut f = pools.frame.get();
        f.flag = Flag::from_wire(header[0])?;
        f.id = i32::from_le_bytes(header[1..5].try_into().unwrap());

        if f.flag.carries_payload() {
            read_wire(r, &mut header[5..7])?;
            let len = u16::from_le_bytes(header[5..7].try_into().unwrap());
            if len as usize > MAX_SEGMENT_SIZE {
                pools.frame.put(f);
                return Err(Error::FrameTooLarge);
            }
            let mut buf = pools.buf.get();
            read_wire(r, &mut buf[..len as usize]).inspect_err(|_| {
                pools.buf.put(std::mem::take(&mut buf));
            })?;
            f.len = len;
            f.payload = Some(buf);
            n += 2 + len;
        } else if f.flag == Flag::WindowUpdate {
            read_wire(r, &mut header[5..13])?;
            f.window = u64::from_le_bytes(header[5..13].try_into().unwrap());
            n += 8;
        }
        Ok((f, n))
    }
}

fn read_wire<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof { Error::FrameTruncated } else { e.into() }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn pools() -> Pools {
        Pools::new()
    }

    #[test]
    fn data_frame_wire_layout() {
        let p = pools();
        let f = Frame::data(Flag::Msg, 7, b"hello", &p).unwrap();
        let mut wire = Vec::new();
        f.encode(&mut wire).unwrap();
        assert_eq!(&wire[..7], &[3, 7, 0, 0, 0, 5, 0]);
        assert_eq!(&wire[7..], b"hello");

        let (g, n) = Frame::decode(&mut Cursor::new(&wire), &p).unwrap();
        assert_eq!(n as usize, wire.len());
        assert_eq!(g.flag, Flag::Msg);
        assert_eq!(g.id, 7);
        assert_eq!(&g.payload.as_ref().unwrap()[..g.len as usize], b"hello");
    }

    #[test]
    fn window_update_wire_layout() {
        let p = pools();
        let word = (1u64 << 63) | (122_550u64 << 32) | 17;
        let f = Frame::window_update(9, word, &p);
        let mut wire = Vec::new();
        f.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), 13);
        assert_eq!(wire[0], 5);

        let (g, n) = Frame::decode(&mut Cursor::new(&wire), &p).unwrap();
        assert_eq!(n, 13);
        assert_eq!(g.window, word);
    }

    #[test]
    fn bare_control_frame() {
        let p = pools();
        let f = Frame::control(Flag::StreamClose, -3, &p);
        let mut wire = Vec::new();
        f.encode(&mut wire).unwrap();
        assert_eq!(wire, vec![7, 0xfd, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn truncated_frame_is_fatal() {
        let p = pools();
        let err = Frame::decode(&mut Cursor::new(&[3u8, 0, 0, 0]), &p).unwrap_err();
        assert!(matches!(err, Error::FrameTruncated));

        // Header promises more payload than follows.
        let err = Frame::decode(&mut Cursor::new(&[3u8, 1, 0, 0, 0, 10, 0, b'x']), &p).unwrap_err();
        assert!(matches!(err, Error::FrameTruncated));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let p = pools();
        let mut wire = vec![3u8, 1, 0, 0, 0];
        wire.extend_from_slice(&4086u16.to_le_bytes());
        let err = Frame::decode(&mut Cursor::new(&wire), &p).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge));
    }

    #[test]
    fn unknown_flag_is_fatal() {
        let p = pools();
        let err = Frame::decode(&mut Cursor::new(&[42u8, 0, 0, 0, 0]), &p).unwrap_err();
        assert!(matches!(err, Error::UnknownFlag(42)));
    }

    #[test]
    fn oversized_content_rejected_on_build() {
        let p = pools();
        let big = vec![0u8; MAX_SEGMENT_SIZE + 1];
        assert!(matches!(Frame::data(Flag::Msg, 1, &big, &p), Err(Error::FrameTooLarge)));
    }
}
