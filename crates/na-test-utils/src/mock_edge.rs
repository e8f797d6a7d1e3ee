//! In-process stand-in for the cloud ingress.
//!
//! Speaks the real wire protocol over TLS + multiplex: answers Auth, Bind,
//! BindLabel, Unbind and SrvInfo RPCs, echoes heartbeats, and lets tests
//! open proxy streams and issue server commands toward the agent.  Each
//! test spins up its own isolated instance on a random port.
//!
//! # Behavior knobs
//! - `set_auth_error` / `set_bind_error`: reject the next matching RPC
//!   with the given error string.
//! - `EdgeSession::kill`: drop the transport abruptly so the client's
//!   reconnect path kicks in.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use na_mux::{MuxSession, Side, TypedStream, heartbeat};
use na_protocol::frame;
use na_protocol::{
    Auth, AuthResp, AuthRespExtra, Bind, BindLabel, BindLabelResp, BindResp, BindRespExtra,
    CommandResp, ProxyHeader, SrvInfo, SrvInfoResp, Unbind, UnbindResp, types,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::tls::TestCert;

/// One endpoint the agent currently has bound on this edge.
#[derive(Debug, Clone, Default)]
pub struct BoundEndpoint {
    pub id: String,
    pub url: String,
    pub proto: String,
    pub token: String,
    pub labeled: bool,
    pub metadata: String,
    pub description: String,
    pub forwards_to: String,
    /// How many times this endpoint has been bound (1 = initial only).
    pub bind_count: u32,
}

#[derive(Default)]
struct EdgeState {
    auth_error: Mutex<Option<String>>,
    bind_error: Mutex<Option<String>>,
    region: Mutex<String>,
    next_id: AtomicU64,
}

impl EdgeState {
    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// The mock ingress server.
pub struct MockEdge {
    addr: SocketAddr,
    cert: TestCert,
    state: Arc<EdgeState>,
    sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<EdgeSession>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockEdge {
    /// Bind to a random port and start accepting TLS connections.
    pub async fn start() -> std::io::Result<MockEdge> {
        let cert = TestCert::generate(&["localhost", "127.0.0.1"]);
        let acceptor = TlsAcceptor::from(cert.server_config());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(EdgeState {
            region: Mutex::new("us".to_owned()),
            ..Default::default()
        });
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((tcp, peer)) = listener.accept().await else {
                    break;
                };
                debug!(?peer, "edge: connection");
                let acceptor = acceptor.clone();
                let state = accept_state.clone();
                let session_tx = session_tx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(tcp).await {
                        Ok(tls) => {
                            let session = EdgeSession::spawn(tls, state);
                            let _ = session_tx.send(session);
                        }
                        Err(e) => warn!(error = %e, "edge: TLS accept failed"),
                    }
                });
            }
        });

        Ok(MockEdge {
            addr,
            cert,
            state,
            sessions: tokio::sync::Mutex::new(session_rx),
            _task: task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address for the agent's `server_addr`, with a hostname the test
    /// certificate covers.
    pub fn server_addr(&self) -> String {
        format!("localhost:{}", self.addr.port())
    }

    /// Trust store containing the edge certificate.
    pub fn ca_roots(&self) -> rustls::RootCertStore {
        self.cert.root_store()
    }

    /// Fail the next (and all later) auth attempts with this error.
    pub fn set_auth_error(&self, error: Option<&str>) {
        *self.state.auth_error.lock().unwrap() = error.map(str::to_owned);
    }

    /// Fail subsequent binds with this error.
    pub fn set_bind_error(&self, error: Option<&str>) {
        *self.state.bind_error.lock().unwrap() = error.map(str::to_owned);
    }

    pub fn set_region(&self, region: &str) {
        *self.state.region.lock().unwrap() = region.to_owned();
    }

    /// Wait for the next agent connection (TLS established).
    pub async fn next_session(&self, timeout: Duration) -> Option<EdgeSession> {
        let mut rx = self.sessions.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

struct SessionState {
    edge: Arc<EdgeState>,
    client_id: Mutex<String>,
    bound: Mutex<HashMap<String, BoundEndpoint>>,
    bound_notify: tokio::sync::Notify,
}

/// Server side of one agent connection.
#[derive(Clone)]
pub struct EdgeSession {
    mux: MuxSession,
    state: Arc<SessionState>,
}

impl EdgeSession {
    fn spawn<I>(io: I, edge: Arc<EdgeState>) -> EdgeSession
    where
        I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (mux, mut acceptor) = MuxSession::new(io, Side::Server);
        let state = Arc::new(SessionState {
            edge,
            client_id: Mutex::new(String::new()),
            bound: Mutex::new(HashMap::new()),
            bound_notify: tokio::sync::Notify::new(),
        });

        let loop_state = state.clone();
        tokio::spawn(async move {
            while let Ok(stream) = acceptor.accept().await {
                let state = loop_state.clone();
                tokio::spawn(handle_stream(stream, state));
            }
            debug!("edge: session ended");
        });

        EdgeSession { mux, state }
    }

    /// Client identifier issued at auth (empty before auth completes).
    pub fn client_id(&self) -> String {
        self.state.client_id.lock().unwrap().clone()
    }

    /// Snapshot of endpoints bound on this session.
    pub fn bound(&self) -> Vec<BoundEndpoint> {
        self.state.bound.lock().unwrap().values().cloned().collect()
    }

    pub fn bound_by_id(&self, id: &str) -> Option<BoundEndpoint> {
        self.state.bound.lock().unwrap().get(id).cloned()
    }

    /// Wait until at least `n` endpoints are bound.
    pub async fn wait_for_binds(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.bound.lock().unwrap().len() >= n {
                return true;
            }
            let notified = self.state.bound_notify.notified();
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.state.bound.lock().unwrap().len() >= n;
            }
        }
    }

    /// Open a proxy stream toward the agent, exactly as the edge would for
    /// an external connection.  The returned stream is the edge half.
    pub async fn open_proxy(&self, header: &ProxyHeader) -> Result<TypedStream, na_mux::MuxError> {
        let mut stream = self.mux.open_typed(types::PROXY).await?;
        frame::write_frame(&mut stream, header)
            .await
            .map_err(|e| match e {
                frame::FrameError::Io(io) => na_mux::MuxError::Io(io),
                other => na_mux::MuxError::Io(std::io::Error::other(other)),
            })?;
        Ok(stream)
    }

    /// Issue a server command and wait for the agent's reply.
    pub async fn send_command<Req: Serialize>(
        &self,
        ty: u8,
        req: &Req,
    ) -> Result<CommandResp, na_mux::MuxError> {
        let mut stream = self.mux.open_typed(ty).await?;
        frame::write_frame(&mut stream, req)
            .await
            .map_err(|e| na_mux::MuxError::Io(std::io::Error::other(e)))?;
        frame::read_frame(&mut stream)
            .await
            .map_err(|e| na_mux::MuxError::Io(std::io::Error::other(e)))
    }

    /// Drop the transport without ceremony; the agent should reconnect.
    pub fn kill(&self) {
        self.mux.close();
    }

    pub async fn closed(&self) {
        self.mux.closed().await;
    }
}

async fn handle_stream(mut stream: TypedStream, state: Arc<SessionState>) {
    match stream.stream_type() {
        na_mux::HEARTBEAT_TYPE => {
            let _ = heartbeat::run_responder(stream).await;
        }
        types::AUTH => {
            let Ok(req) = frame::read_frame::<_, Auth>(&mut stream).await else {
                return;
            };
            let resp = auth_resp(&req, &state);
            let _ = frame::write_frame(&mut stream, &resp).await;
        }
        types::BIND => {
            let Ok(req) = frame::read_frame::<_, Bind>(&mut stream).await else {
                return;
            };
            let resp = bind_resp(&req, &state);
            state.bound_notify.notify_waiters();
            let _ = frame::write_frame(&mut stream, &resp).await;
        }
        types::BIND_LABEL => {
            let Ok(req) = frame::read_frame::<_, BindLabel>(&mut stream).await else {
                return;
            };
            let resp = bind_label_resp(&req, &state);
            state.bound_notify.notify_waiters();
            let _ = frame::write_frame(&mut stream, &resp).await;
        }
        types::UNBIND => {
            let Ok(req) = frame::read_frame::<_, Unbind>(&mut stream).await else {
                return;
            };
            state.bound.lock().unwrap().remove(&req.id);
            state.bound_notify.notify_waiters();
            let _ = frame::write_frame(&mut stream, &UnbindResp::default()).await;
        }
        types::SRV_INFO => {
            let Ok(_req) = frame::read_frame::<_, SrvInfo>(&mut stream).await else {
                return;
            };
            let resp = SrvInfoResp {
                region: state.edge.region.lock().unwrap().clone(),
            };
            let _ = frame::write_frame(&mut stream, &resp).await;
        }
        other => {
            debug!(stream_type = other, "edge: dropping unexpected stream");
        }
    }
}

fn auth_resp(req: &Auth, state: &SessionState) -> AuthResp {
    if let Some(error) = state.edge.auth_error.lock().unwrap().clone() {
        return AuthResp {
            error,
            ..Default::default()
        };
    }
    let client_id = if req.client_id.is_empty() {
        state.edge.fresh_id("cl")
    } else {
        req.client_id.clone()
    };
    *state.client_id.lock().unwrap() = client_id.clone();
    AuthResp {
        version: "1".to_owned(),
        client_id,
        error: String::new(),
        extra: AuthRespExtra {
            region: state.edge.region.lock().unwrap().clone(),
            cookie: state.edge.fresh_id("cookie"),
        },
    }
}

fn bind_resp(req: &Bind, state: &SessionState) -> BindResp {
    if let Some(error) = state.edge.bind_error.lock().unwrap().clone() {
        return BindResp {
            error,
            ..Default::default()
        };
    }
    // Re-registration carries the old ID, which is preserved.
    let (id, bind_count) = if req.id.is_empty() {
        (state.edge.fresh_id("ep"), 1)
    } else {
        (req.id.clone(), 2)
    };
    let requested_url = req
        .opts
        .get("URL")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    // A bare scheme (e.g. `tcp://`) asks the edge to assign an address.
    let has_host = requested_url
        .split_once("://")
        .is_some_and(|(_, rest)| !rest.is_empty());
    let url = if has_host {
        requested_url.to_owned()
    } else {
        match req.proto.as_str() {
            "tcp" => format!("tcp://0.tcp.edge.test:{}", 20000 + bind_count),
            _ => format!("https://{id}.edge.test"),
        }
    };
    let token = state.edge.fresh_id("tok");

    let mut bound = state.bound.lock().unwrap();
    let entry = bound.entry(id.clone()).or_insert_with(|| BoundEndpoint {
        id: id.clone(),
        labeled: false,
        ..Default::default()
    });
    entry.url = url.clone();
    entry.proto = req.proto.clone();
    entry.token = token.clone();
    entry.metadata = req.extra.metadata.clone();
    entry.description = req.extra.description.clone();
    entry.forwards_to = req.extra.forwards_to.clone();
    entry.bind_count += 1;

    BindResp {
        id,
        url,
        proto: req.proto.clone(),
        opts: req.opts.clone(),
        error: String::new(),
        extra: BindRespExtra { token },
    }
}

fn bind_label_resp(req: &BindLabel, state: &SessionState) -> BindLabelResp {
    if let Some(error) = state.edge.bind_error.lock().unwrap().clone() {
        return BindLabelResp {
            error,
            ..Default::default()
        };
    }
    // Labeled endpoints get a fresh ID on every registration; the reconnect
    // path must re-key.
    let id = state.edge.fresh_id("ep");
    let token = state.edge.fresh_id("tok");

    // A re-registration (token present) replaces the old entry.
    let mut bound = state.bound.lock().unwrap();
    if !req.extra.token.is_empty() {
        bound.retain(|_, e| !(e.labeled && e.token == req.extra.token));
    }
    bound.insert(
        id.clone(),
        BoundEndpoint {
            id: id.clone(),
            url: String::new(),
            proto: String::new(),
            token: token.clone(),
            labeled: true,
            metadata: req.extra.metadata.clone(),
            description: req.extra.description.clone(),
            forwards_to: req.extra.forwards_to.clone(),
            bind_count: 1,
        },
    );

    BindLabelResp {
        id,
        error: String::new(),
        extra: BindRespExtra { token },
    }
}
