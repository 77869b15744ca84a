#![forbid(unsafe_code)]

//! Native-messaging framing: each unit on the wire is a `u32` little-endian
//! length prefix followed by that many bytes of UTF-8 JSON.
//!
//! Pipes deliver data in arbitrary chunks, so reads loop until the exact byte
//! count arrives. Zero bytes at a frame boundary is the browser closing the
//! pipe cleanly; zero bytes anywhere else is a protocol error.

use std::io::{ErrorKind, Read, Write};

use anyhow::{Context, Result, bail};
use serde_json::Value;

/// Upper bound on a declared frame length, checked before any allocation.
/// Chrome itself caps native-messaging payloads well below this.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Reads one framed JSON message. Returns `Ok(None)` on a clean end of
/// stream, an error on a truncated frame, an oversized declared length, or a
/// body that is not valid JSON.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Value>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => bail!(
                "stream closed mid-frame ({filled} of {} header bytes read)",
                header.len()
            ),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("reading frame header"),
        }
    }

    let length = u32::from_le_bytes(header) as usize;
    if length > MAX_FRAME_LEN {
        bail!("declared frame length {length} exceeds the {MAX_FRAME_LEN} byte limit");
    }

    let mut body = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        match reader.read(&mut body[filled..]) {
            Ok(0) => bail!("stream closed mid-frame ({filled} of {length} body bytes read)"),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("reading frame body"),
        }
    }

    let message = serde_json::from_slice(&body).context("frame body is not valid JSON")?;
    Ok(Some(message))
}

/// Writes one framed JSON message and flushes, so a waiting client never
/// stalls on a buffered response.
pub fn write_frame<W: Write>(writer: &mut W, message: &Value) -> Result<()> {
    let body = serde_json::to_vec(message).context("encoding frame body")?;
    if body.len() > MAX_FRAME_LEN {
        bail!("encoded frame length {} exceeds the {MAX_FRAME_LEN} byte limit", body.len());
    }
    writer
        .write_all(&(body.len() as u32).to_le_bytes())
        .context("writing frame header")?;
    writer.write_all(&body).context("writing frame body")?;
    writer.flush().context("flushing frame")?;
    Ok(())
}
