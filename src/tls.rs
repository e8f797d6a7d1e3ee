//! TLS configuration and handshakes.
//!
//! The embedded Mozilla root set is the default trust store for the
//! control connection; a caller-supplied store replaces it, and the TLS
//! customizer gets a final chance to mutate the client config before the
//! handshake.  Everything is pinned to the ring provider so the library
//! works regardless of which process-level provider the host application
//! installed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{Accept, TlsAcceptor, TlsConnector};

use crate::errors::Error;

/// Mutates the client config immediately before handshake.
pub type TlsCustomizer = Arc<dyn Fn(&mut ClientConfig) + Send + Sync>;

/// Embedded default roots.
pub(crate) fn default_root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    store
}

/// Build the effective client config: roots, minimum TLS 1.2, optional
/// ALPN, then the caller's customizer.
pub(crate) fn client_config(
    roots: Option<&RootCertStore>,
    alpn: &[&[u8]],
    customizer: Option<&TlsCustomizer>,
) -> Result<ClientConfig, Error> {
    let roots = match roots {
        Some(custom) => custom.clone(),
        None => default_root_store(),
    };
    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(std::io::Error::other(e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    if !alpn.is_empty() {
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    }
    if let Some(customize) = customizer {
        customize(&mut config);
    }
    Ok(config)
}

/// The hostname portion of a `host:port` address.
pub(crate) fn host_of(addr: &str) -> &str {
    // Bracketed IPv6 first, then a trailing `:port`.
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => addr,
    }
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(host.to_owned()).map_err(|e| Error::InvalidUrl {
        url: host.to_owned(),
        reason: e.to_string(),
    })
}

/// Client-side handshake over any established byte stream.
pub(crate) async fn client_handshake<IO>(
    io: IO,
    config: Arc<ClientConfig>,
    name: ServerName<'static>,
) -> std::io::Result<tokio_rustls::client::TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    TlsConnector::from(config).connect(name, io).await
}

/// Server-side TLS whose handshake is deferred until the first read or
/// write, so accepting a connection never blocks on a client that dials
/// and goes silent.
pub(crate) struct LazyTls<IO> {
    state: LazyTlsState<IO>,
}

enum LazyTlsState<IO> {
    Handshaking(Accept<IO>),
    Active(tokio_rustls::server::TlsStream<IO>),
    Failed,
}

impl<IO> LazyTls<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: IO, config: Arc<ServerConfig>) -> Self {
        LazyTls {
            state: LazyTlsState::Handshaking(TlsAcceptor::from(config).accept(io)),
        }
    }

    fn poll_active(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<&mut tokio_rustls::server::TlsStream<IO>>> {
        if let LazyTlsState::Handshaking(accept) = &mut self.state {
            match Pin::new(accept).poll(cx) {
                Poll::Ready(Ok(stream)) => self.state = LazyTlsState::Active(stream),
                Poll::Ready(Err(e)) => {
                    self.state = LazyTlsState::Failed;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        match &mut self.state {
            LazyTlsState::Active(stream) => Poll::Ready(Ok(stream)),
            LazyTlsState::Failed => {
                Poll::Ready(Err(std::io::Error::other("TLS handshake already failed")))
            }
            LazyTlsState::Handshaking(_) => unreachable!("handshake resolved above"),
        }
    }
}

impl<IO> AsyncRead for LazyTls<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.poll_active(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_read(cx, buf),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<IO> AsyncWrite for LazyTls<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.poll_active(cx) {
            Poll::Ready(Ok(stream)) => Pin::new(stream).poll_write(cx, buf),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.state {
            LazyTlsState::Active(stream) => Pin::new(stream).poll_flush(cx),
            // Nothing sent yet.
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.state {
            LazyTlsState::Active(stream) => Pin::new(stream).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}
