//! Length-prefixed JSON framing shared by the Broker's `IpcClient` and the
//! Agent's connection handler: 4-byte big-endian length + UTF-8 JSON body.

use crate::error::TypedError;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame's JSON body, per §4.1/§6. Chosen at 16 MiB —
/// generous for any tool payload this system exchanges, small enough that a
/// corrupted length prefix fails fast instead of trying to allocate gigabytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Writes one frame: a 4-byte big-endian length prefix followed by the
/// UTF-8 JSON encoding of `value`. Over-cap payloads are rejected before
/// anything touches the wire.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TypedError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| TypedError::internal(format!("failed to serialize frame: {e}")))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(TypedError::protocol_error(format!(
            "frame of {} bytes exceeds MAX_MESSAGE_SIZE ({} bytes)",
            body.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let len = (body.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| TypedError::unavailable(format!("frame write failed: {e}")))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| TypedError::unavailable(format!("frame write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| TypedError::unavailable(format!("frame flush failed: {e}")))?;
    Ok(())
}

/// Reads one frame and parses it as JSON. Returns `Ok(None)` on an orderly
/// EOF at a frame boundary (peer closed cleanly); any other failure —
/// including a partial read mid-frame or an over-cap length — is a
/// `protocol_error`/`unavailable` `TypedError`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Value>, TypedError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TypedError::unavailable(format!("frame read failed: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TypedError::protocol_error(format!(
            "incoming frame of {len} bytes exceeds MAX_MESSAGE_SIZE ({MAX_MESSAGE_SIZE} bytes)"
        )));
    }
    if len == 0 {
        return Err(TypedError::protocol_error("empty frame"));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TypedError::protocol_error(format!("truncated frame: {e}")))?;
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| TypedError::protocol_error(format!("invalid JSON frame: {e}")))?;
    Ok(Some(value))
}
