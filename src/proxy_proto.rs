//! PROXY protocol preamble reading.
//!
//! The edge emits the preamble in cleartext at the head of a proxy stream.
//! Before an upstream TLS handshake the forwarder must peel off exactly
//! the preamble bytes and replay them on the plain socket -- wrapping the
//! whole stream in TLS first would encrypt the header and the upstream
//! could never read it.
//!
//! The reader consumes exactly the header bytes and nothing more, so the
//! payload that follows stays intact.

use tokio::io::{AsyncRead, AsyncReadExt};

/// v1 text headers are capped at 107 bytes plus the signature byte.
const V1_MAX_LEN: usize = 108;
/// v2 fixed header: 12 signature bytes, version/command, family, 2 length bytes.
const V2_FIXED_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ProxyHeaderError {
    #[error("unrecognized signature byte 0x{0:02x}")]
    UnrecognizedSignature(u8),
    #[error("v1 header missing CRLF within {V1_MAX_LEN} bytes")]
    MissingCrlf,
    #[error("truncated header: {0}")]
    Truncated(std::io::Error),
    #[error("I/O: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProxyHeaderError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProxyHeaderError::Truncated(e)
        } else {
            ProxyHeaderError::Io(e)
        }
    }
}

/// Read one complete PROXY preamble (v1 or v2) and return its exact bytes.
pub async fn read_proxy_header<R>(r: &mut R) -> Result<Vec<u8>, ProxyHeaderError>
where
    R: AsyncRead + Unpin,
{
    let first = r.read_u8().await?;
    match first {
        b'P' => read_v1(r, first).await,
        0x0D => read_v2(r, first).await,
        other => Err(ProxyHeaderError::UnrecognizedSignature(other)),
    }
}

/// v1: `PROXY <proto> <src> <dst> <sport> <dport>\r\n`, ASCII, CRLF-terminated.
async fn read_v1<R>(r: &mut R, first: u8) -> Result<Vec<u8>, ProxyHeaderError>
where
    R: AsyncRead + Unpin,
{
    let mut header = Vec::with_capacity(V1_MAX_LEN);
    header.push(first);
    // One byte at a time: reading past the CRLF would eat payload.
    while header.len() < V1_MAX_LEN {
        let b = r.read_u8().await?;
        header.push(b);
        if b == b'\n' && header[header.len() - 2] == b'\r' {
            return Ok(header);
        }
    }
    Err(ProxyHeaderError::MissingCrlf)
}

/// v2: 16-byte fixed header, the final two bytes a big-endian address length.
async fn read_v2<R>(r: &mut R, first: u8) -> Result<Vec<u8>, ProxyHeaderError>
where
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; V2_FIXED_LEN];
    header[0] = first;
    r.read_exact(&mut header[1..]).await?;
    let addr_len = u16::from_be_bytes([header[14], header[15]]) as usize;
    let start = header.len();
    header.resize(start + addr_len, 0);
    r.read_exact(&mut header[start..]).await?;
    Ok(header)
}
