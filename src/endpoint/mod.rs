//! Remotely-bound endpoints.
//!
//! A listener delivers accepted streams to the caller; a forwarder owns an
//! internal accept loop and copies each stream to a configured upstream.
//! Both share the same teardown path: drain in-flight handoffs, unbind
//! remotely, fire the done signal exactly once, and drop out of the
//! agent's endpoint list.

pub(crate) mod forwarder;
pub(crate) mod http;
pub(crate) mod listener;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use na_mux::TypedStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::AgentInner;
use crate::errors::Error;
use crate::session::SessionInner;
use crate::tls::LazyTls;

pub use forwarder::Forwarder;
pub use listener::{Conn, Listener};

const CLOSE_BUDGET: Duration = Duration::from_secs(5);

/// User-visible endpoint state.  Labeled endpoints may get a fresh ID on
/// re-registration; everything else is stable for the endpoint's lifetime.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    pub id: String,
    pub url: String,
    pub proto: String,
    pub labels: BTreeMap<String, String>,
    pub metadata: String,
    pub description: String,
    pub forwards_to: String,
}

/// State common to both endpoint flavors.
#[derive(Clone)]
pub(crate) struct EndpointShared {
    pub(crate) info: Arc<Mutex<EndpointInfo>>,
    pub(crate) done: CancellationToken,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) agent: Weak<AgentInner>,
}

impl EndpointShared {
    pub(crate) fn info(&self) -> EndpointInfo {
        self.info.lock().expect("endpoint info lock poisoned").clone()
    }

    pub(crate) async fn wait_done(&self) {
        self.done.cancelled().await;
    }

    /// Shared close path.  Only the caller that wins the registry removal
    /// performs the teardown; everyone else returns immediately, so
    /// concurrent closes observe exactly one shutdown.
    pub(crate) async fn close_with_timeout(&self, budget: Duration) -> Result<(), Error> {
        let id = self.info().id;
        let Some(session) = self.session.upgrade() else {
            self.done.cancel();
            return Ok(());
        };
        let Some(tunnel) = session.registry.remove(&id).await else {
            return Ok(());
        };

        // Refuse new handoffs, release any that are mid-send, then block
        // until the in-flight ones drain.
        tunnel.gate.shutdown();
        tunnel.done.cancel();
        tunnel.gate.wait().await;

        let unbind_result = match session.current_raw() {
            Some(raw) => match tokio::time::timeout(budget, raw.unbind(&id)).await {
                Ok(res) => res,
                Err(_) => Err(Error::Rpc(format!("unbind of {id} timed out"))),
            },
            None => Ok(()),
        };

        if let Some(agent) = self.agent.upgrade() {
            agent.remove_endpoint(&id);
        }
        debug!(endpoint_id = %id, "endpoint closed");
        unbind_result
    }
}

/// Byte stream of one accepted connection, optionally TLS-terminated
/// agent-side.  The handshake, if any, is driven by the first read or
/// write.
pub(crate) enum ConnIo {
    Plain(TypedStream),
    Tls(Box<LazyTls<TypedStream>>),
}

impl AsyncRead for ConnIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ConnIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ConnIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ConnIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnIo::Plain(s) => Pin::new(s).poll_flush(cx),
            ConnIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ConnIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
