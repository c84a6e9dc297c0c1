//! Length-prefixed framing.
//!
//! A frame is a big-endian `u64` payload length followed by exactly that many
//! payload bytes. The receiver learns the full size up front, so a block is
//! always read completely or rejected before any of it is handed on.

use std::io::{self, Read, Write};

use crate::{Error, Result};

/// Write `payload` as a single frame. The caller flushes.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    w.write_all(&(payload.len() as u64).to_be_bytes())?;
    w.write_all(payload)
}

/// Read one frame into `buf`, replacing its contents.
///
/// A length prefix above `max` is rejected before any payload is read; the
/// stream is then out of sync and must be closed.
pub fn read_frame<R: Read>(r: &mut R, max: u64, buf: &mut Vec<u8>) -> Result<()> {
    let size = read_frame_len(r)?;
    read_frame_body(r, size, max, buf)
}

/// Read one frame like [`read_frame`], returning `Ok(false)` instead of an
/// error when the stream ends cleanly before the length prefix.
pub fn read_frame_opt<R: Read>(r: &mut R, max: u64, buf: &mut Vec<u8>) -> Result<bool> {
    let mut size = [0; 8];
    let mut filled = 0;
    while filled < size.len() {
        match r.read(&mut size[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    read_frame_body(r, u64::from_be_bytes(size), max, buf)?;
    Ok(true)
}

fn read_frame_len<R: Read>(r: &mut R) -> Result<u64> {
    let mut size = [0; 8];
    r.read_exact(&mut size)?;
    Ok(u64::from_be_bytes(size))
}

fn read_frame_body<R: Read>(r: &mut R, size: u64, max: u64, buf: &mut Vec<u8>) -> Result<()> {
    if size > max {
        return Err(Error::FrameTooLarge { size, max });
    }
    buf.clear();
    buf.resize(size as usize, 0);
    r.read_exact(buf)?;
    Ok(())
}
