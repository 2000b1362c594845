//! Length-prefixed JSON framing used on every pipe that crosses a process boundary: the
//! per-worker input/output queues, the supervisor's ProcessInfo status channel, and the
//! `SingleShotInvoker` result pipe.
//!
//! Grounded on the framing used by worker-host processes elsewhere in the ecosystem (see
//! `framed_send`/`framed_recv` in Polkadot's PVF worker interface): a `u32` little-endian length
//! followed by the body. JSON keeps the payload human-inspectable in logs, which the tracing
//! setup in `logging.rs` relies on.

use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Serialize};

pub fn send_frame<W: Write, T: Serialize>(w: &mut W, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()
}

/// Returns `Ok(None)` on a clean EOF (the writer end was closed), which callers use to detect
/// that the peer process is gone.
pub fn recv_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    let value = serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
