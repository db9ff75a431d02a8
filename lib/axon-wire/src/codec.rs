//! Length-prefixed framing and the little-endian put/get helpers the
//! message types build on.

use std::io::{Read, Write};

use crate::{Result, Status};

/// Hard cap on a single frame body. A peer announcing more is violating
/// the protocol and gets dropped.
pub const MAX_FRAME: usize = (1 << 20) + 64;

/// Write one frame: u32 length prefix, then the body.
///
/// Short writes are absorbed by `write_all`; any I/O error means the
/// channel is gone and the connection is finished.
pub fn write_frame(stream: &mut impl Write, body: &[u8]) -> std::io::Result<()> {
    debug_assert!(body.len() <= MAX_FRAME);
    let len = (body.len() as u32).to_le_bytes();
    stream.write_all(&len)?;
    stream.write_all(body)?;
    stream.flush()
}

/// Read one frame body. Short reads are absorbed by `read_exact`.
pub fn read_frame(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut len = [0_u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized frame",
        ));
    }

    let mut body = vec![0_u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

pub(crate) fn put_u8(buf: &mut Vec<u8>, val: u8) {
    buf.push(val);
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, val: u64) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub(crate) fn put_bool(buf: &mut Vec<u8>, val: bool) {
    buf.push(val as u8);
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, val: &[u8]) {
    put_u32(buf, val.len() as u32);
    buf.extend_from_slice(val);
}

/// Bounds-checked reader over a decoded frame body. Every getter fails
/// with `Status::ProtocolError` instead of panicking on short input.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Status::ProtocolError);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Status::ProtocolError),
        }
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// A well-formed message leaves nothing behind.
    pub fn finish(self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Status::ProtocolError)
        }
    }
}
