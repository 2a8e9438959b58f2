//! Length-delimited frames.
//!
//! Frame format: `len:u64 BE | body`, where `len` counts the 8 prefix bytes
//! too. The body is opaque here; its first byte is the message type tag.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, Result};

/// Size of the length prefix.
pub const LENGTH_PREFIX: u64 = 8;

/// Maximum total frame size (1 MiB of data plus header slack).
pub const MAX_FRAME_SIZE: u64 = (1 << 20) + (1 << 10);

/// Prepend the length prefix to `body`.
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX as usize + body.len());
    buf.put_u64(body.len() as u64 + LENGTH_PREFIX);
    buf.put_slice(body);
    buf.freeze()
}

/// Check a received length prefix before allocating for the body.
pub fn validate_length(len: u64) -> Result<usize> {
    if len <= LENGTH_PREFIX {
        return Err(GatewayError::protocol(format!(
            "frame length {len} leaves an empty body"
        )));
    }
    if len > MAX_FRAME_SIZE {
        return Err(GatewayError::protocol(format!(
            "frame size {len} exceeds maximum allowed size {MAX_FRAME_SIZE}"
        )));
    }
    Ok((len - LENGTH_PREFIX) as usize)
}

/// Read one complete frame body. Blocks until every byte arrives or the
/// stream fails; a peer that closes mid-frame yields an I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = r.read_u64().await?;
    let body_len = validate_length(len)?;

    let mut body = vec![0u8; body_len];
    r.read_exact(&mut body).await?;

    Ok(Bytes::from(body))
}

/// Write a pre-encoded frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}
