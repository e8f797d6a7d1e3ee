//! Transport dialing.
//!
//! The `Dialer` seam lets callers substitute their own socket setup (VPN
//! interfaces, SOCKS wrappers, test transports).  The default dials plain
//! TCP; when the agent is configured with a proxy URL the control
//! connection is tunneled through an HTTP CONNECT handshake first.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::errors::Error;

/// Object-safe byte stream.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Capability to open a byte stream to `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn IoStream>>;
}

/// Default dialer: plain TCP with `TCP_NODELAY`.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> std::io::Result<Box<dyn IoStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Dial with a timeout; timeouts surface as `TimedOut` I/O errors.
pub(crate) async fn dial_with_timeout(
    dialer: &dyn Dialer,
    addr: &str,
    timeout: Duration,
) -> std::io::Result<Box<dyn IoStream>> {
    match tokio::time::timeout(timeout, dialer.dial(addr)).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("dial {addr} timed out after {timeout:?}"),
        )),
    }
}

/// Reach `target` through an egress proxy via HTTP CONNECT.
///
/// Only http proxies are supported; any other scheme is rejected before
/// dialing.
pub(crate) async fn dial_via_proxy(
    dialer: &dyn Dialer,
    proxy: &Url,
    target: &str,
) -> Result<Box<dyn IoStream>, Error> {
    if proxy.scheme() != "http" {
        return Err(Error::InvalidProxyUrl(format!(
            "unsupported proxy scheme `{}`",
            proxy.scheme()
        )));
    }
    let host = proxy
        .host_str()
        .ok_or_else(|| Error::InvalidProxyUrl("missing host".to_owned()))?;
    let port = proxy.port_or_known_default().unwrap_or(80);
    let mut stream = dialer
        .dial(&format!("{host}:{port}"))
        .await
        .map_err(Error::Dial)?;

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(Error::Dial)?;
    read_connect_response(&mut stream).await?;
    Ok(stream)
}

/// Read the proxy's response headers and require a 2xx status.
async fn read_connect_response(stream: &mut Box<dyn IoStream>) -> Result<(), Error> {
    // Header section is tiny; read byte-wise so no tunneled bytes are eaten.
    let mut buf = Vec::with_capacity(256);
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() > 8 * 1024 {
            return Err(Error::InvalidProxyUrl(
                "proxy CONNECT response too large".to_owned(),
            ));
        }
        let b = stream.read_u8().await.map_err(Error::Dial)?;
        buf.push(b);
    }
    let head = String::from_utf8_lossy(&buf);
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status.starts_with('2') {
        Ok(())
    } else {
        Err(Error::Dial(std::io::Error::other(format!(
            "proxy CONNECT rejected: {status_line}"
        ))))
    }
}
