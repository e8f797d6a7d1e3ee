//! Length-prefixed JSON framing.
//!
//! Both RPC bodies and the per-stream proxy header travel as one JSON
//! object prefixed by a little-endian i64 byte length.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame.  Control messages are tiny; anything
/// bigger than this is a corrupt or hostile peer.
pub const MAX_FRAME_LEN: i64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid frame length {0}")]
    InvalidLength(i64),
}

/// Write one JSON object with its length prefix.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    w.write_i64_le(body.len() as i64).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON object.
pub async fn read_frame<R, T>(r: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = r.read_i64_le().await?;
    if len < 0 || len > MAX_FRAME_LEN {
        return Err(FrameError::InvalidLength(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
