//! Forwarder endpoints: an internal accept loop plus one task per
//! connection copying bytes to the configured upstream.
//!
//! Per connection:
//! 1. emit `ConnectionOpened`
//! 2. wrap the stream in byte counters
//! 3. http/https upstream -> HTTP-aware path, anything else -> raw copy
//! 4. raw + PROXY + TLS upstream: peel the cleartext preamble off the
//!    stream, replay it on the plain socket, then handshake
//! 5. emit `ConnectionClosed` with duration and byte counts

use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::agent::AgentInner;
use crate::config::{ProxyProto, Upstream, UpstreamTarget};
use crate::dial::{Dialer, IoStream, TcpDialer, dial_with_timeout};
use crate::endpoint::http;
use crate::endpoint::{CLOSE_BUDGET, EndpointInfo, EndpointShared};
use crate::errors::Error;
use crate::events::Event;
use crate::proxy_proto::read_proxy_header;
use crate::session::BoundEndpoint;
use crate::session::raw::ProxyConn;
use crate::tls;

/// Default budget for reaching the upstream; a custom dialer takes over
/// timeout policy entirely.
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// ALPN offered on upstream TLS when the `http2` protocol hint is set.
const H2_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

/// A remotely-bound endpoint whose traffic is delivered to a local
/// upstream.
pub struct Forwarder {
    pub(crate) shared: EndpointShared,
}

impl Forwarder {
    pub fn info(&self) -> EndpointInfo {
        self.shared.info()
    }

    pub fn id(&self) -> String {
        self.shared.info().id
    }

    pub fn url(&self) -> String {
        self.shared.info().url
    }

    /// Resolves once this endpoint is torn down.
    pub async fn done(&self) {
        self.shared.wait_done().await;
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.shared.close_with_timeout(CLOSE_BUDGET).await
    }

    pub async fn close_with_timeout(&self, budget: Duration) -> Result<(), Error> {
        self.shared.close_with_timeout(budget).await
    }

    /// Spawn the forward loop over a freshly bound endpoint.
    pub(crate) fn start(
        shared: EndpointShared,
        bound: BoundEndpoint,
        ctx: Arc<ConnCtx>,
    ) -> Forwarder {
        let forwarder = Forwarder {
            shared: shared.clone(),
        };
        tokio::spawn(forward_loop(shared, bound.conn_rx, ctx));
        forwarder
    }
}

/// Everything a per-connection task needs, resolved once at `forward`.
pub(crate) struct ConnCtx {
    pub(crate) agent: Weak<AgentInner>,
    pub(crate) info: Arc<Mutex<EndpointInfo>>,
    pub(crate) target: UpstreamTarget,
    pub(crate) server_name: Option<ServerName<'static>>,
    pub(crate) tls: Option<Arc<ClientConfig>>,
    pub(crate) http2: bool,
    pub(crate) proxy_proto: ProxyProto,
    pub(crate) dialer: Option<Arc<dyn Dialer>>,
}

impl ConnCtx {
    /// Resolve the upstream once; scheme and TLS problems surface before
    /// any bind RPC.
    pub(crate) fn build(
        agent: Weak<AgentInner>,
        info: Arc<Mutex<EndpointInfo>>,
        upstream: &Upstream,
        endpoint_proxy_proto: ProxyProto,
    ) -> Result<ConnCtx, Error> {
        let target = upstream.target()?;
        let http2 = upstream.wants_http2();
        let (server_name, tls_config) = if target.use_tls() {
            let name = tls::server_name(&target.host)?;
            let config = match &upstream.tls {
                Some(custom) => custom.clone(),
                None => {
                    let alpn = if http2 { H2_ALPN } else { &[] };
                    Arc::new(tls::client_config(None, alpn, None)?)
                }
            };
            (Some(name), Some(config))
        } else {
            (None, None)
        };
        // The upstream-level setting wins; the endpoint-level one is what
        // the edge was told to emit.
        let proxy_proto = if upstream.proxy_proto.is_enabled() {
            upstream.proxy_proto
        } else {
            endpoint_proxy_proto
        };
        Ok(ConnCtx {
            agent,
            info,
            target,
            server_name,
            tls: tls_config,
            http2,
            proxy_proto,
            dialer: upstream.dialer.clone(),
        })
    }

    pub(crate) fn endpoint_id(&self) -> String {
        self.info.lock().expect("endpoint info lock poisoned").id.clone()
    }

    pub(crate) fn endpoint_url(&self) -> String {
        self.info.lock().expect("endpoint info lock poisoned").url.clone()
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(agent) = self.agent.upgrade() {
            agent.emit(event);
        }
    }

    pub(crate) async fn dial(&self) -> std::io::Result<Box<dyn IoStream>> {
        let addr = self.target.addr();
        match &self.dialer {
            Some(dialer) => dialer.dial(&addr).await,
            None => dial_with_timeout(&TcpDialer, &addr, UPSTREAM_DIAL_TIMEOUT).await,
        }
    }
}

/// Accept until the endpoint closes or the session drops it, then signal
/// done.
async fn forward_loop(
    shared: EndpointShared,
    mut conn_rx: mpsc::Receiver<ProxyConn>,
    ctx: Arc<ConnCtx>,
) {
    loop {
        tokio::select! {
            () = shared.done.cancelled() => break,
            conn = conn_rx.recv() => match conn {
                Some(proxy_conn) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move { handle_conn(proxy_conn, ctx).await });
                }
                None => break,
            }
        }
    }
    shared.done.cancel();
}

async fn handle_conn(proxy_conn: ProxyConn, ctx: Arc<ConnCtx>) {
    let started = Instant::now();
    let remote_addr = proxy_conn.header.client_addr.clone();
    let endpoint_id = ctx.endpoint_id();

    ctx.emit(Event::ConnectionOpened {
        at: Utc::now(),
        endpoint_id: endpoint_id.clone(),
        url: ctx.endpoint_url(),
        remote_addr: remote_addr.clone(),
        proto: proxy_conn.header.proto.clone(),
    });

    let counted = Counted::new(proxy_conn.stream);
    let bytes_in = counted.read_count();
    let bytes_out = counted.write_count();

    let result = if ctx.target.is_http() {
        http::serve(counted, &ctx).await
    } else {
        raw_join(counted, &ctx).await
    };

    let error = match result {
        Ok(()) => None,
        Err(e) => {
            debug!(endpoint_id = %endpoint_id, error = %e, "connection ended with error");
            Some(e.to_string())
        }
    };

    ctx.emit(Event::ConnectionClosed {
        at: Utc::now(),
        endpoint_id,
        remote_addr,
        duration: started.elapsed(),
        bytes_in: bytes_in.load(Ordering::Relaxed),
        bytes_out: bytes_out.load(Ordering::Relaxed),
        error,
    });
}

/// Raw byte pipe to the upstream, with the PROXY-before-TLS dance when
/// both are configured.
async fn raw_join(mut downstream: Counted<na_mux::TypedStream>, ctx: &ConnCtx) -> Result<(), Error> {
    let addr = ctx.target.addr();

    if ctx.proxy_proto.is_enabled() && ctx.target.use_tls() {
        // The preamble must hit the wire before the handshake, or it ends
        // up encrypted where the upstream cannot read it.
        let preamble = read_proxy_header(&mut downstream)
            .await
            .map_err(|e| Error::ProxyHeader(e.to_string()))?;

        let mut upstream = ctx.dial().await.map_err(|e| Error::UpstreamDial {
            addr: addr.clone(),
            source: e,
        })?;
        upstream
            .write_all(&preamble)
            .await
            .map_err(|e| Error::UpstreamDial { addr, source: e })?;

        let mut upstream = tls_wrap(upstream, ctx).await?;
        copy_until_done(&mut downstream, &mut upstream).await;
        return Ok(());
    }

    let upstream = ctx.dial().await.map_err(|e| Error::UpstreamDial {
        addr: addr.clone(),
        source: e,
    })?;

    if ctx.target.use_tls() {
        let mut upstream = tls_wrap(upstream, ctx).await?;
        copy_until_done(&mut downstream, &mut upstream).await;
    } else {
        let mut upstream = upstream;
        copy_until_done(&mut downstream, &mut upstream).await;
    }
    Ok(())
}

pub(crate) async fn tls_wrap(
    upstream: Box<dyn IoStream>,
    ctx: &ConnCtx,
) -> Result<tokio_rustls::client::TlsStream<Box<dyn IoStream>>, Error> {
    let config = ctx
        .tls
        .clone()
        .expect("TLS config resolved for TLS upstream at build time");
    let name = ctx
        .server_name
        .clone()
        .expect("server name resolved for TLS upstream at build time");
    tls::client_handshake(upstream, config, name)
        .await
        .map_err(Error::Tls)
}

/// Copy both directions until either side ends; shutdown propagates to
/// the opposite half so half-closes travel through.
async fn copy_until_done<A, B>(a: &mut A, b: &mut B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = tokio::io::copy_bidirectional(a, b).await {
        debug!(error = %e, "bidirectional copy ended");
    }
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
}

// ---------------------------------------------------------------------------
// Byte counting
// ---------------------------------------------------------------------------

/// Counts bytes moving through a stream: reads are traffic from the
/// client, writes are traffic back to it.
pub(crate) struct Counted<T> {
    inner: T,
    read: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl<T> Counted<T> {
    pub(crate) fn new(inner: T) -> Self {
        Counted {
            inner,
            read: Arc::new(AtomicU64::new(0)),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn read_count(&self) -> Arc<AtomicU64> {
        self.read.clone()
    }

    pub(crate) fn write_count(&self) -> Arc<AtomicU64> {
        self.written.clone()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Counted<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let filled = buf.filled().len() - before;
            self.read.fetch_add(filled as u64, Ordering::Relaxed);
        }
        res
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Counted<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &res {
            self.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
