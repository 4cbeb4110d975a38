//! Length-prefixed message framing
//!
//! Wire format: [4 bytes: payload length as u32 big-endian][payload bytes].
//! The payload is UTF-8 JSON; framing itself is payload-agnostic.
//!
//! A fixed-width length prefix keeps message boundaries unambiguous for any
//! payload, unlike delimiter framing which breaks on payloads containing
//! the delimiter. Short reads are normal socket behavior and are absorbed
//! by `read_exact`.

use std::io::{Read, Write};

use crate::error::{BridgeError, Result};

/// Size of the length prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Read one frame and return its payload.
///
/// Returns `Ok(None)` on clean EOF before the first prefix byte (peer
/// disconnected between messages). A stream that ends inside the prefix or
/// inside the payload yields `IncompleteFrame`. A declared length above
/// `max_bytes` yields `FrameTooLarge` before any payload allocation.
pub fn read_frame<R: Read>(stream: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; PREFIX_LEN];

    // First prefix byte decides between clean disconnect and truncation.
    loop {
        match stream.read(&mut len_buf[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    if let Err(e) = stream.read_exact(&mut len_buf[1..]) {
        return Err(eof_as_incomplete(e));
    }

    let declared = u32::from_be_bytes(len_buf) as usize;
    if declared > max_bytes {
        return Err(BridgeError::FrameTooLarge {
            declared,
            max: max_bytes,
        });
    }

    let mut payload = vec![0u8; declared];
    if let Err(e) = stream.read_exact(&mut payload) {
        return Err(eof_as_incomplete(e));
    }

    Ok(Some(payload))
}

/// Write one frame: length prefix, payload, flush.
pub fn write_frame<W: Write>(stream: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

fn eof_as_incomplete(e: std::io::Error) -> BridgeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BridgeError::IncompleteFrame
    } else {
        BridgeError::Io(e)
    }
}
