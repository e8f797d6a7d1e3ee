//! Listener endpoints: accepted streams are handed to the caller.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::endpoint::{CLOSE_BUDGET, ConnIo, EndpointInfo, EndpointShared};
use crate::errors::Error;
use crate::session::raw::ProxyConn;
use crate::tls::LazyTls;

/// A remotely-bound endpoint delivering each incoming connection to the
/// caller via [`Listener::accept`].
pub struct Listener {
    pub(crate) shared: EndpointShared,
    /// Behind an async mutex so `accept` works through a shared handle
    /// (e.g. an `Arc`) while another task closes the endpoint.
    pub(crate) conn_rx: tokio::sync::Mutex<mpsc::Receiver<ProxyConn>>,
    pub(crate) agent_tls: Option<Arc<ServerConfig>>,
}

impl Listener {
    /// Snapshot of this endpoint's user-visible state.
    pub fn info(&self) -> EndpointInfo {
        self.shared.info()
    }

    pub fn id(&self) -> String {
        self.shared.info().id
    }

    pub fn url(&self) -> String {
        self.shared.info().url
    }

    /// Next incoming connection.  When an agent TLS config was supplied,
    /// the stream is wrapped in a server-side handshake that runs on first
    /// read/write; end-to-end TLS (passthrough) streams are never touched.
    pub async fn accept(&self) -> Result<Conn, Error> {
        match self.conn_rx.lock().await.recv().await {
            Some(proxy_conn) => Ok(self.wrap(proxy_conn)),
            None => Err(Error::SessionClosed),
        }
    }

    /// Resolves once this endpoint is torn down (close, disconnect, or
    /// remote stop).
    pub async fn done(&self) {
        self.shared.wait_done().await;
    }

    /// Unbind remotely and tear down, with the default 5 s RPC budget.
    pub async fn close(&self) -> Result<(), Error> {
        self.shared.close_with_timeout(CLOSE_BUDGET).await
    }

    /// As `close`, with a caller-supplied budget for the unbind RPC.
    pub async fn close_with_timeout(&self, budget: std::time::Duration) -> Result<(), Error> {
        self.shared.close_with_timeout(budget).await
    }

    fn wrap(&self, proxy_conn: ProxyConn) -> Conn {
        let header = proxy_conn.header;
        let io = match &self.agent_tls {
            Some(config) if !header.passthrough_tls => {
                ConnIo::Tls(Box::new(LazyTls::new(proxy_conn.stream, config.clone())))
            }
            _ => ConnIo::Plain(proxy_conn.stream),
        };
        Conn {
            remote_addr: header.client_addr,
            proto: header.proto,
            passthrough_tls: header.passthrough_tls,
            io,
        }
    }
}

/// One accepted connection.
pub struct Conn {
    remote_addr: String,
    proto: String,
    passthrough_tls: bool,
    io: ConnIo,
}

impl Conn {
    /// Address of the original client, as reported by the edge.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// True when the payload is end-to-end TLS the agent must not
    /// terminate.
    pub fn passthrough_tls(&self) -> bool {
        self.passthrough_tls
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
