//! The agent: process-scoped owner of configuration, event handlers, and
//! the set of live endpoints.
//!
//! At most one underlying session exists at a time.  `connect` waits for
//! the first state change from the reconnect loop; subsequent changes are
//! pumped into `AgentConnectSucceeded` / `AgentDisconnected` events.

use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use na_mux::heartbeat::OnBeat;
use rustls::RootCertStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::config::{AgentConfig, CommandHandler, EndpointConfig, Upstream};
use crate::dial::Dialer;
use crate::endpoint::forwarder::ConnCtx;
use crate::endpoint::{EndpointInfo, EndpointShared, Forwarder, Listener};
use crate::errors::Error;
use crate::events::{Event, EventHandler, EventSink};
use crate::probe::{self, ProbeResult};
use crate::session::{Session, SessionInner, StateChange};
use crate::tls::TlsCustomizer;

/// Top-level handle.  Clones share one agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

pub(crate) struct AgentInner {
    cfg: AgentConfig,
    events: EventSink,
    state: RwLock<AgentState>,
}

#[derive(Default)]
struct AgentState {
    session: Option<Arc<SessionInner>>,
    endpoints: Vec<Arc<Mutex<EndpointInfo>>>,
}

impl AgentInner {
    pub(crate) fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    pub(crate) fn remove_endpoint(&self, id: &str) {
        let mut state = self.state.write().expect("agent state lock poisoned");
        state
            .endpoints
            .retain(|info| info.lock().expect("endpoint info lock poisoned").id != id);
    }

    fn add_endpoint(&self, info: Arc<Mutex<EndpointInfo>>) {
        let mut state = self.state.write().expect("agent state lock poisoned");
        state.endpoints.push(info);
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Establish the session and wait for the first state change.
    ///
    /// Returns `AlreadyConnected` if a session exists.  On a failed first
    /// attempt the error is returned, but the reconnect loop keeps
    /// retrying with backoff until `disconnect` is called.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.current_session().is_some() {
            return Err(Error::AlreadyConnected);
        }
        let on_beat = self.heartbeat_callback();
        let (session, mut state_rx) = SessionInner::start(self.inner.cfg.clone(), on_beat);

        let raced = {
            let mut state = self.inner.state.write().expect("agent state lock poisoned");
            if state.session.is_some() {
                true
            } else {
                state.session = Some(session.clone());
                false
            }
        };
        if raced {
            session.shutdown().await;
            return Err(Error::AlreadyConnected);
        }

        let first = state_rx.recv().await;
        tokio::spawn(pump_state(Arc::downgrade(&self.inner), state_rx));

        match first {
            Some(Ok(())) => {
                info!("agent connected");
                self.inner.emit(Event::AgentConnectSucceeded { at: Utc::now() });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::SessionClosed),
        }
    }

    /// Close the session, signal done on every endpoint, and clear the
    /// endpoint list.  Safe to call with no session.
    pub async fn disconnect(&self) {
        let session = {
            let mut state = self.inner.state.write().expect("agent state lock poisoned");
            state.endpoints.clear();
            state.session.take()
        };
        if let Some(session) = session {
            session.shutdown().await;
            info!("agent disconnected");
        }
    }

    /// Bind a listener endpoint and hand accepted streams to the caller.
    pub async fn listen(&self, cfg: EndpointConfig) -> Result<Listener, Error> {
        let request = cfg.to_bind_request("")?;
        let session = self.ensure_session().await?;
        let bound = session.bind_endpoint(request).await?;

        let shared = EndpointShared {
            info: bound.info.clone(),
            done: bound.done.clone(),
            session: Arc::downgrade(&session),
            agent: Arc::downgrade(&self.inner),
        };
        self.inner.add_endpoint(bound.info.clone());
        Ok(Listener {
            shared,
            conn_rx: tokio::sync::Mutex::new(bound.conn_rx),
            agent_tls: cfg.agent_tls.clone(),
        })
    }

    /// Bind an endpoint and forward its traffic to `upstream`.
    pub async fn forward(&self, cfg: EndpointConfig, upstream: Upstream) -> Result<Forwarder, Error> {
        // Validate the upstream before anything reaches the server.
        upstream.target()?;
        let request = cfg.to_bind_request(&upstream.addr)?;
        let session = self.ensure_session().await?;
        let bound = session.bind_endpoint(request).await?;

        let ctx = match ConnCtx::build(
            Arc::downgrade(&self.inner),
            bound.info.clone(),
            &upstream,
            cfg.proxy_proto,
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                // Roll the registration back; the bind succeeded but the
                // forwarder can never run.
                let id = bound.info.lock().expect("endpoint info lock poisoned").id.clone();
                if let Some(tunnel) = session.registry.remove(&id).await {
                    tunnel.done.cancel();
                }
                if let Some(raw) = session.current_raw() {
                    let _ = raw.unbind(&id).await;
                }
                return Err(e);
            }
        };

        let shared = EndpointShared {
            info: bound.info.clone(),
            done: bound.done.clone(),
            session: Arc::downgrade(&session),
            agent: Arc::downgrade(&self.inner),
        };
        self.inner.add_endpoint(bound.info.clone());
        Ok(Forwarder::start(shared, bound, Arc::new(ctx)))
    }

    /// Snapshot of live endpoints.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let state = self.inner.state.read().expect("agent state lock poisoned");
        state
            .endpoints
            .iter()
            .map(|info| info.lock().expect("endpoint info lock poisoned").clone())
            .collect()
    }

    /// Current session handle, or `NotConnected`.
    pub fn session(&self) -> Result<Session, Error> {
        self.current_session()
            .map(|inner| Session { inner })
            .ok_or(Error::NotConnected)
    }

    /// Register an event handler.  Handlers run sequentially on the
    /// emitting task and must not block.
    pub fn add_event_handler(&self, handler: EventHandler) {
        self.inner.events.add(handler);
    }

    /// Probe `addr` in stages (tcp, tls, mux) using this agent's dialer,
    /// proxy, and TLS configuration.  Never authenticates; never touches a
    /// live session.
    pub async fn diagnose(&self, addr: &str) -> ProbeResult {
        probe::run(&self.inner.cfg, addr, &CancellationToken::new()).await
    }

    /// As `diagnose`, interruptible through `cancel`.
    pub async fn diagnose_with_cancel(&self, addr: &str, cancel: &CancellationToken) -> ProbeResult {
        probe::run(&self.inner.cfg, addr, cancel).await
    }

    fn current_session(&self) -> Option<Arc<SessionInner>> {
        self.inner
            .state
            .read()
            .expect("agent state lock poisoned")
            .session
            .clone()
    }

    async fn ensure_session(&self) -> Result<Arc<SessionInner>, Error> {
        if let Some(session) = self.current_session() {
            return Ok(session);
        }
        if !self.inner.cfg.auto_connect {
            return Err(Error::NotConnected);
        }
        match self.connect().await {
            Ok(()) | Err(Error::AlreadyConnected) => {}
            Err(e) => return Err(e),
        }
        self.current_session().ok_or(Error::NotConnected)
    }

    fn heartbeat_callback(&self) -> OnBeat {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |latency| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(Event::AgentHeartbeatReceived {
                    at: Utc::now(),
                    latency,
                });
            }
        })
    }
}

/// Convert state changes after the first into agent events.
async fn pump_state(inner: Weak<AgentInner>, mut state_rx: mpsc::Receiver<StateChange>) {
    while let Some(change) = state_rx.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        match change {
            Ok(()) => inner.emit(Event::AgentConnectSucceeded { at: Utc::now() }),
            Err(e) => inner.emit(Event::AgentDisconnected {
                at: Utc::now(),
                error: Some(Arc::new(e)),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AgentBuilder {
    cfg: AgentConfig,
    handlers: Vec<EventHandler>,
}

impl AgentBuilder {
    pub fn authtoken(mut self, token: impl Into<String>) -> Self {
        self.cfg.authtoken = token.into();
        self
    }

    /// Read the authtoken from `NGROK_AUTHTOKEN`.
    pub fn authtoken_from_env(mut self) -> Self {
        if let Some(token) = crate::config::authtoken_from_env() {
            self.cfg.authtoken = token;
        }
        self
    }

    /// Ingress address, `host:port`.  The hostname is also the SNI.
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.cfg.server_addr = addr.into();
        self
    }

    /// Replace the embedded default roots.
    pub fn ca_roots(mut self, roots: RootCertStore) -> Self {
        self.cfg.ca_roots = Some(roots);
        self
    }

    /// Mutate the TLS client config immediately before each handshake.
    pub fn tls_customizer(mut self, customizer: TlsCustomizer) -> Self {
        self.cfg.tls_customizer = Some(customizer);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.cfg.dialer = dialer;
        self
    }

    /// Reach the server through an egress proxy (http CONNECT).
    pub fn proxy_url(mut self, url: Url) -> Self {
        self.cfg.proxy_url = Some(url);
        self
    }

    pub fn heartbeat_interval(mut self, interval: std::time::Duration) -> Self {
        self.cfg.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_tolerance(mut self, tolerance: std::time::Duration) -> Self {
        self.cfg.heartbeat_tolerance = tolerance;
        self
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.cfg.metadata = metadata.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.cfg.description = description.into();
        self
    }

    /// Whether `listen`/`forward` connect automatically when no session
    /// exists yet.  Defaults to true.
    pub fn auto_connect(mut self, auto: bool) -> Self {
        self.cfg.auto_connect = auto;
        self
    }

    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.cfg.connect_timeout = timeout;
        self
    }

    /// Handle server-issued Stop/Restart/Update/StopTunnel commands.
    pub fn command_handler(mut self, handler: CommandHandler) -> Self {
        self.cfg.command_handler = Some(handler);
        self
    }

    pub fn handler(mut self, handler: EventHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Agent {
        let events = EventSink::default();
        for handler in self.handlers {
            events.add(handler);
        }
        Agent {
            inner: Arc::new(AgentInner {
                cfg: self.cfg,
                events,
                state: RwLock::new(AgentState::default()),
            }),
        }
    }
}
