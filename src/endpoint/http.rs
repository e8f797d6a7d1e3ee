//! HTTP-aware forwarding.
//!
//! The downstream proxy stream is served as an HTTP/1.1 connection;
//! requests are replayed onto one upstream connection (HTTP/1.1, or h2
//! when the upstream protocol hint asks for it).  Because responses flow
//! back the moment their headers arrive, an upstream that rejects an
//! oversized upload early (e.g. 413) reaches the client intact even while
//! the request body is still streaming in.  A 101 response switches both
//! sides to their upgraded byte streams without losing buffered bytes.

use std::sync::Arc;

use chrono::Utc;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use na_mux::TypedStream;
use tokio::time::Instant;
use tracing::debug;

use crate::dial::IoStream;
use crate::endpoint::forwarder::{ConnCtx, Counted, tls_wrap};
use crate::errors::Error;
use crate::events::Event;

enum UpstreamSender {
    H1(hyper::client::conn::http1::SendRequest<Incoming>),
    H2(hyper::client::conn::http2::SendRequest<Incoming>),
}

impl UpstreamSender {
    async fn send(&mut self, req: Request<Incoming>) -> hyper::Result<Response<Incoming>> {
        match self {
            UpstreamSender::H1(sender) => {
                sender.ready().await?;
                sender.send_request(req).await
            }
            UpstreamSender::H2(sender) => {
                sender.ready().await?;
                sender.send_request(req).await
            }
        }
    }
}

/// Serve one downstream connection against one upstream connection.
pub(crate) async fn serve(downstream: Counted<TypedStream>, ctx: &Arc<ConnCtx>) -> Result<(), Error> {
    let addr = ctx.target.addr();
    let upstream = ctx.dial().await.map_err(|e| Error::UpstreamDial {
        addr: addr.clone(),
        source: e,
    })?;
    let upstream: Box<dyn IoStream> = if ctx.target.use_tls() {
        Box::new(tls_wrap(upstream, ctx).await?)
    } else {
        upstream
    };

    let sender = if ctx.http2 {
        let (sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(upstream))
                .await
                .map_err(|e| Error::Http(format!("upstream handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream h2 connection ended");
            }
        });
        UpstreamSender::H2(sender)
    } else {
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream))
            .await
            .map_err(|e| Error::Http(format!("upstream handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "upstream connection ended");
            }
        });
        UpstreamSender::H1(sender)
    };

    let sender = Arc::new(tokio::sync::Mutex::new(sender));
    // Holds the upgraded bridge so ConnectionClosed waits for it.
    let bridge: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>> = Arc::default();

    let svc_ctx = ctx.clone();
    let svc_bridge = bridge.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let sender = sender.clone();
        let ctx = svc_ctx.clone();
        let bridge = svc_bridge.clone();
        async move { proxy_request(req, sender, ctx, bridge).await }
    });

    let result = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(downstream), service)
        .with_upgrades()
        .await;

    let bridge_handle = bridge.lock().expect("bridge slot lock poisoned").take();
    if let Some(handle) = bridge_handle {
        let _ = handle.await;
    }

    result.map_err(|e| Error::Http(e.to_string()))
}

async fn proxy_request(
    mut req: Request<Incoming>,
    sender: Arc<tokio::sync::Mutex<UpstreamSender>>,
    ctx: Arc<ConnCtx>,
    bridge: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
) -> Result<Response<Incoming>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let started = Instant::now();
    let method = req.method().to_string();
    let uri = req.uri().to_string();

    // Capture the downstream upgrade half before the request moves on.
    let down_upgrade = req.extensions_mut().remove::<OnUpgrade>();

    if ctx.http2 {
        // h2 requires an absolute request target.
        let path_and_query = req
            .uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let mut parts = http::uri::Parts::default();
        parts.scheme = Some(if ctx.target.use_tls() {
            Scheme::HTTPS
        } else {
            Scheme::HTTP
        });
        parts.authority = Some(
            Authority::try_from(ctx.target.addr().as_str())
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>)?,
        );
        parts.path_and_query = Some(path_and_query);
        *req.uri_mut() = Uri::from_parts(parts)
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>)?;
    }

    let mut resp = sender.lock().await.send(req).await?;

    ctx.emit(Event::HttpRequestComplete {
        at: Utc::now(),
        endpoint_id: ctx.endpoint_id(),
        method,
        uri,
        status: resp.status().as_u16(),
        elapsed: started.elapsed(),
    });

    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        let up_upgrade = hyper::upgrade::on(&mut resp);
        if let Some(down_upgrade) = down_upgrade {
            let handle = tokio::spawn(bridge_upgraded(down_upgrade, up_upgrade));
            *bridge.lock().expect("bridge slot lock poisoned") = Some(handle);
        }
    }

    Ok(resp)
}

/// After a 101, splice the two upgraded streams.  Bytes either side had
/// already buffered past the response headers live inside the upgraded
/// IOs, so nothing is lost in the switch.
async fn bridge_upgraded(down: OnUpgrade, up: OnUpgrade) {
    match tokio::try_join!(down, up) {
        Ok((down, up)) => {
            let mut down = TokioIo::new(down);
            let mut up = TokioIo::new(up);
            if let Err(e) = tokio::io::copy_bidirectional(&mut down, &mut up).await {
                debug!(error = %e, "upgraded bridge ended");
            }
        }
        Err(e) => debug!(error = %e, "protocol upgrade failed"),
    }
}
