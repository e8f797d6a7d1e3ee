//! Live endpoint registry and proxy-stream dispatch.
//!
//! Keyed by endpoint ID.  The map lock is held only for the lookup; the
//! handoff itself runs under the endpoint's shutdown gate so `close` can
//! drain in-flight handoffs, and anything arriving afterwards is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BindRequest;
use crate::endpoint::EndpointInfo;
use crate::errors::Error;
use crate::session::raw::{ProxyConn, RawSession};
use crate::shutdown::Gate;

pub(crate) struct RegisteredTunnel {
    /// The original bind request, replayed (with the token) on reconnect.
    pub(crate) request: BindRequest,
    /// Reconnect token from the server at first bind.
    pub(crate) token: String,
    /// Stream handoff into the endpoint.
    pub(crate) conn_tx: mpsc::Sender<ProxyConn>,
    /// Gate closed by the endpoint's `close`; post-close handoffs are dropped.
    pub(crate) gate: Arc<Gate>,
    /// Fires exactly once when the endpoint is torn down.
    pub(crate) done: CancellationToken,
    /// User-visible endpoint state, shared with the public handle.
    pub(crate) info: Arc<Mutex<EndpointInfo>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    tunnels: RwLock<HashMap<String, RegisteredTunnel>>,
}

impl Registry {
    pub(crate) async fn insert(&self, id: String, tunnel: RegisteredTunnel) {
        self.tunnels.write().await.insert(id, tunnel);
    }

    /// Route one proxy stream to its endpoint.  Unknown IDs are logged and
    /// the stream is dropped, which closes it.
    ///
    /// The map lock is held only for the lookup; the handoff itself runs
    /// under the endpoint's gate so `close` can drain it, and aborts if
    /// the endpoint's done signal fires mid-send.
    pub(crate) async fn dispatch(&self, conn: ProxyConn) {
        let (conn_tx, gate, done) = {
            let tunnels = self.tunnels.read().await;
            let Some(tunnel) = tunnels.get(&conn.header.id) else {
                warn!(endpoint_id = %conn.header.id, "proxy stream for unknown endpoint");
                return;
            };
            (tunnel.conn_tx.clone(), tunnel.gate.clone(), tunnel.done.clone())
        };
        let Some(_guard) = gate.try_op() else {
            debug!(endpoint_id = %conn.header.id, "endpoint closing, dropping stream");
            return;
        };
        tokio::select! {
            res = conn_tx.send(conn) => {
                if res.is_err() {
                    debug!("endpoint receiver gone, dropping stream");
                }
            }
            () = done.cancelled() => {
                debug!("endpoint closed during handoff, dropping stream");
            }
        }
    }

    pub(crate) async fn remove(&self, id: &str) -> Option<RegisteredTunnel> {
        self.tunnels.write().await.remove(id)
    }

    /// Tear out every tunnel (agent disconnect path).
    pub(crate) async fn take_all(&self) -> Vec<RegisteredTunnel> {
        self.tunnels.write().await.drain().map(|(_, t)| t).collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Replay every bind on a fresh raw session, holding the write lock so
    /// dispatch never observes a half-rebuilt registry.
    ///
    /// URL-bound tunnels keep their IDs; label-bound tunnels may get fresh
    /// ones, in which case the map is re-keyed.  Any rejection fails the
    /// whole reconnect.
    pub(crate) async fn rebind_all(&self, raw: &RawSession) -> Result<(), Error> {
        let mut tunnels = self.tunnels.write().await;
        let old: HashMap<String, RegisteredTunnel> = tunnels.drain().collect();
        let mut rebuilt = HashMap::with_capacity(old.len());

        let mut remaining = old.into_iter();
        while let Some((id, mut tunnel)) = remaining.next() {
            match rebind_one(raw, &id, &mut tunnel).await {
                Ok(new_id) => {
                    tunnel
                        .info
                        .lock()
                        .expect("endpoint info lock poisoned")
                        .id = new_id.clone();
                    rebuilt.insert(new_id, tunnel);
                }
                Err(e) => {
                    // Put everything back so the next reconnect attempt
                    // sees the full set.
                    rebuilt.insert(id, tunnel);
                    rebuilt.extend(remaining);
                    *tunnels = rebuilt;
                    return Err(e);
                }
            }
        }

        *tunnels = rebuilt;
        Ok(())
    }
}

/// Replay one bind and return the (possibly new) endpoint ID.
async fn rebind_one(
    raw: &RawSession,
    id: &str,
    tunnel: &mut RegisteredTunnel,
) -> Result<String, Error> {
    match &mut tunnel.request {
        BindRequest::Url(bind) => {
            bind.id = id.to_owned();
            bind.extra.token = tunnel.token.clone();
            let resp = raw.bind(bind).await?;
            tunnel.token = resp.extra.token;
            debug!(endpoint_id = %resp.id, "endpoint re-registered");
            Ok(resp.id)
        }
        BindRequest::Label(bind) => {
            bind.extra.token = tunnel.token.clone();
            let resp = raw.bind_label(bind).await?;
            tunnel.token = resp.extra.token;
            // An empty ID means the server kept the old association.
            if resp.id.is_empty() {
                Ok(id.to_owned())
            } else {
                debug!(old_id = %id, new_id = %resp.id, "labeled endpoint re-keyed");
                Ok(resp.id)
            }
        }
    }
}
