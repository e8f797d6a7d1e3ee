//! The reconnecting session.
//!
//! Wraps one raw session at a time behind an atomic pointer swap; a
//! background task owns the connect/reconnect loop:
//!
//! 1. dial (optionally through the egress proxy) -> TLS -> multiplex -> auth
//! 2. publish the new raw session on the swap pointer
//! 3. replay every registered bind (URL-bound keep IDs, labeled re-key)
//! 4. emit `Ok(())` on the state-change channel and pump proxy streams
//!
//! Any failure emits the error on the state-change channel and retries
//! after exponential backoff (500 ms doubling to 30 s, no jitter).  An
//! explicit close emits a terminal error and drops the channel sender.

pub(crate) mod raw;
pub(crate) mod registry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use na_mux::heartbeat::OnBeat;
use na_protocol::{Auth, AuthExtra, CLIENT_VERSION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, BindRequest};
use crate::dial::{IoStream, dial_via_proxy, dial_with_timeout};
use crate::endpoint::EndpointInfo;
use crate::errors::Error;
use crate::session::raw::{ProxyConn, RawAcceptor, RawSession};
use crate::session::registry::{RegisteredTunnel, Registry};
use crate::shutdown::Gate;
use crate::tls;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// State-change buffer; the consumer is expected to drain it.
const STATE_CHANGE_BUFFER: usize = 32;
/// Queue of proxy streams awaiting pickup by one endpoint.
const ENDPOINT_CONN_BUFFER: usize = 32;
const LATENCY_BUFFER: usize = 8;

pub(crate) type StateChange = Result<(), Error>;

#[derive(Default)]
struct SessionState {
    client_id: String,
    cookie: String,
    region: String,
}

pub(crate) struct SessionInner {
    cfg: AgentConfig,
    raw: ArcSwapOption<RawSession>,
    pub(crate) registry: Registry,
    state: Mutex<SessionState>,
    on_beat: OnBeat,
    latency_rx: tokio::sync::Mutex<mpsc::Receiver<Duration>>,
    closed: CancellationToken,
}

/// Public handle to the authenticated session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Client identifier assigned at first auth, stable across reconnects.
    pub fn client_id(&self) -> String {
        self.inner.state.lock().expect("session state lock").client_id.clone()
    }

    /// Region the server placed this session in.
    pub fn region(&self) -> String {
        self.inner.state.lock().expect("session state lock").region.clone()
    }

    /// Next measured heartbeat round-trip.  `Duration::ZERO` marks a
    /// timed-out beat; `None` means the session is gone.
    pub async fn next_latency(&self) -> Option<Duration> {
        self.inner.latency_rx.lock().await.recv().await
    }
}

impl SessionInner {
    /// Create the session and spawn its reconnect task.  The returned
    /// receiver carries the state-change sequence; the first value decides
    /// whether `connect` succeeds.
    pub(crate) fn start(
        cfg: AgentConfig,
        on_beat_extern: OnBeat,
    ) -> (Arc<SessionInner>, mpsc::Receiver<StateChange>) {
        let (state_tx, state_rx) = mpsc::channel(STATE_CHANGE_BUFFER);
        let (latency_tx, latency_rx) = mpsc::channel(LATENCY_BUFFER);

        // Publish the latency non-blockingly; drop the beat if the
        // consumer is behind.
        let on_beat: OnBeat = Arc::new(move |rtt| {
            let _ = latency_tx.try_send(rtt);
            on_beat_extern(rtt);
        });

        let inner = Arc::new(SessionInner {
            cfg,
            raw: ArcSwapOption::empty(),
            registry: Registry::default(),
            state: Mutex::new(SessionState::default()),
            on_beat,
            latency_rx: tokio::sync::Mutex::new(latency_rx),
            closed: CancellationToken::new(),
        });

        tokio::spawn(run(inner.clone(), state_tx));
        (inner, state_rx)
    }

    pub(crate) fn current_raw(&self) -> Option<Arc<RawSession>> {
        self.raw.load_full()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Explicit teardown: stop the reconnect loop, close the live raw
    /// session, and signal done on every endpoint.
    pub(crate) async fn shutdown(&self) {
        self.closed.cancel();
        if let Some(raw) = self.raw.swap(None) {
            raw.close();
        }
        for tunnel in self.registry.take_all().await {
            tunnel.gate.shutdown();
            tunnel.done.cancel();
        }
    }

    /// Register a new endpoint on the live raw session.
    pub(crate) async fn bind_endpoint(
        self: &Arc<Self>,
        request: BindRequest,
    ) -> Result<BoundEndpoint, Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let raw = self.current_raw().ok_or(Error::NotConnected)?;

        let (request, id, token, info) = match request {
            BindRequest::Url(bind) => {
                let resp = raw.bind(&bind).await?;
                let proto = if resp.proto.is_empty() {
                    bind.proto.clone()
                } else {
                    resp.proto.clone()
                };
                let info = EndpointInfo {
                    id: resp.id.clone(),
                    url: resp.url.clone(),
                    proto,
                    labels: Default::default(),
                    metadata: bind.extra.metadata.clone(),
                    description: bind.extra.description.clone(),
                    forwards_to: bind.extra.forwards_to.clone(),
                };
                (BindRequest::Url(bind), resp.id, resp.extra.token, info)
            }
            BindRequest::Label(bind) => {
                let resp = raw.bind_label(&bind).await?;
                let info = EndpointInfo {
                    id: resp.id.clone(),
                    url: String::new(),
                    proto: String::new(),
                    labels: bind.labels.clone(),
                    metadata: bind.extra.metadata.clone(),
                    description: bind.extra.description.clone(),
                    forwards_to: bind.extra.forwards_to.clone(),
                };
                (BindRequest::Label(bind), resp.id, resp.extra.token, info)
            }
        };

        let (conn_tx, conn_rx) = mpsc::channel(ENDPOINT_CONN_BUFFER);
        let gate = Arc::new(Gate::default());
        let done = CancellationToken::new();
        let info = Arc::new(Mutex::new(info));

        self.registry
            .insert(
                id.clone(),
                RegisteredTunnel {
                    request,
                    token,
                    conn_tx,
                    gate: gate.clone(),
                    done: done.clone(),
                    info: info.clone(),
                },
            )
            .await;

        info!(endpoint_id = %id, "endpoint registered");
        Ok(BoundEndpoint { info, conn_rx, done })
    }
}

/// Everything an endpoint handle needs from a successful bind.
pub(crate) struct BoundEndpoint {
    pub(crate) info: Arc<Mutex<EndpointInfo>>,
    pub(crate) conn_rx: mpsc::Receiver<ProxyConn>,
    pub(crate) done: CancellationToken,
}

// ---------------------------------------------------------------------------
// Reconnect loop
// ---------------------------------------------------------------------------

async fn run(inner: Arc<SessionInner>, state_tx: mpsc::Sender<StateChange>) {
    let mut backoff = BACKOFF_INITIAL;

    while !inner.closed.is_cancelled() {
        match connect_once(&inner).await {
            Ok((raw, acceptor)) => {
                let raw = Arc::new(raw);
                inner.raw.store(Some(raw.clone()));

                match inner.registry.rebind_all(&raw).await {
                    Ok(()) => {
                        backoff = BACKOFF_INITIAL;
                        let _ = state_tx.send(Ok(())).await;

                        let err = pump(&inner, acceptor).await;
                        inner.raw.store(None);
                        raw.close();
                        match err {
                            Some(e) => {
                                warn!(error = %e, "session disconnected");
                                let _ = state_tx.send(Err(e)).await;
                            }
                            // Explicit close; terminal error emitted below.
                            None => break,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "endpoint re-registration failed");
                        inner.raw.store(None);
                        raw.close();
                        let _ = state_tx.send(Err(e)).await;
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "connect attempt failed");
                let _ = state_tx.send(Err(e)).await;
            }
        }

        if inner.closed.is_cancelled() {
            break;
        }
        tokio::select! {
            () = inner.closed.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }

    let _ = state_tx.send(Err(Error::SessionClosed)).await;
    // Dropping the sender closes the state-change channel exactly once.
}

/// Accept proxy streams until the transport dies or the session closes.
async fn pump(inner: &Arc<SessionInner>, mut acceptor: RawAcceptor) -> Option<Error> {
    loop {
        tokio::select! {
            () = inner.closed.cancelled() => {
                acceptor.close();
                return None;
            }
            res = acceptor.accept(inner.cfg.command_handler.as_ref()) => match res {
                Ok(conn) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        inner.registry.dispatch(conn).await;
                    });
                }
                Err(e) => return Some(e),
            }
        }
    }
}

/// One full connect: dial, TLS, multiplex, auth, heartbeat.
async fn connect_once(inner: &Arc<SessionInner>) -> Result<(RawSession, RawAcceptor), Error> {
    let cfg = &inner.cfg;

    let io: Box<dyn IoStream> = match &cfg.proxy_url {
        Some(proxy) => dial_via_proxy(cfg.dialer.as_ref(), proxy, &cfg.server_addr).await?,
        None => dial_with_timeout(cfg.dialer.as_ref(), &cfg.server_addr, cfg.connect_timeout)
            .await
            .map_err(Error::Dial)?,
    };

    let tls_config = tls::client_config(cfg.ca_roots.as_ref(), &[], cfg.tls_customizer.as_ref())?;
    let name = tls::server_name(tls::host_of(&cfg.server_addr))?;
    let io = tls::client_handshake(io, Arc::new(tls_config), name)
        .await
        .map_err(Error::Tls)?;

    let (raw, acceptor) = RawSession::start(io);

    let (client_id, cookie) = {
        let state = inner.state.lock().expect("session state lock");
        (state.client_id.clone(), state.cookie.clone())
    };
    let auth = Auth {
        client_id,
        version: CLIENT_VERSION.to_owned(),
        authtoken: cfg.authtoken.clone(),
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        heartbeat_interval_ms: cfg.heartbeat_interval.as_millis() as u64,
        heartbeat_tolerance_ms: cfg.heartbeat_tolerance.as_millis() as u64,
        extra: AuthExtra {
            metadata: cfg.metadata.clone(),
            description: cfg.description.clone(),
            cookie,
        },
    };

    let resp = match raw.auth(&auth).await {
        Ok(resp) => resp,
        Err(e) => {
            // Close the partially-built raw session before retrying.
            raw.close();
            return Err(e);
        }
    };

    {
        let mut state = inner.state.lock().expect("session state lock");
        state.client_id = resp.client_id.clone();
        state.region = resp.extra.region.clone();
        if !resp.extra.cookie.is_empty() {
            state.cookie = resp.extra.cookie;
        }
    }
    info!(client_id = %resp.client_id, region = %resp.extra.region, "session authenticated");

    raw.start_heartbeat(
        cfg.heartbeat_interval,
        cfg.heartbeat_tolerance,
        inner.on_beat.clone(),
    );

    Ok((raw, acceptor))
}
