//! Stepwise connectivity probe.
//!
//! Exercises the same dial path and TLS configuration as a live session
//! -- dialer, egress proxy, CA roots, SNI from the configured connect
//! hostname, TLS customizer -- but never authenticates and never touches
//! an active session.  Stages: `tcp` -> `tls` -> `mux`, where the mux
//! stage opens a fresh multiplex and issues a server-info RPC whose reply
//! supplies region and latency.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AgentConfig;
use crate::dial::{IoStream, dial_via_proxy, dial_with_timeout};
use crate::errors::Error;
use crate::session::raw::RawSession;
use crate::tls;

/// Outcome of a probe: which stages completed, and where it stopped.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// Stages that completed, in order: `tcp`, `tls`, `mux`.
    pub completed_steps: Vec<String>,
    /// First stage that failed, if any.
    pub failed_step: Option<String>,
    pub error: Option<String>,
    /// Region reported by the server; non-empty only on full success.
    pub region: String,
    /// Round-trip of the server-info exchange.
    pub latency: Option<Duration>,
}

impl ProbeResult {
    fn fail(&mut self, step: &str, error: impl ToString) {
        self.failed_step = Some(step.to_owned());
        self.error = Some(error.to_string());
    }
}

pub(crate) async fn run(cfg: &AgentConfig, addr: &str, cancel: &CancellationToken) -> ProbeResult {
    let mut result = ProbeResult::default();

    // tcp
    let io = match race(cancel, dial(cfg, addr)).await {
        Some(Ok(io)) => io,
        Some(Err(e)) => {
            result.fail("tcp", e);
            return result;
        }
        None => {
            result.fail("tcp", "canceled");
            return result;
        }
    };
    result.completed_steps.push("tcp".to_owned());

    // tls: SNI comes from the configured connect hostname, never the
    // dial target, which may be a raw IP.
    let io = match race(cancel, tls_step(cfg, io)).await {
        Some(Ok(io)) => io,
        Some(Err(e)) => {
            result.fail("tls", e);
            return result;
        }
        None => {
            result.fail("tls", "canceled");
            return result;
        }
    };
    result.completed_steps.push("tls".to_owned());

    // mux + server info
    let (raw, _acceptor) = RawSession::start(io);
    let started = Instant::now();
    match race(cancel, raw.srv_info()).await {
        Some(Ok(info)) => {
            result.latency = Some(started.elapsed());
            result.region = info.region;
            result.completed_steps.push("mux".to_owned());
        }
        Some(Err(e)) => result.fail("mux", e),
        None => result.fail("mux", "canceled"),
    }
    raw.close();
    debug!(steps = ?result.completed_steps, failed = ?result.failed_step, "probe finished");
    result
}

async fn dial(cfg: &AgentConfig, addr: &str) -> Result<Box<dyn IoStream>, Error> {
    match &cfg.proxy_url {
        Some(proxy) => dial_via_proxy(cfg.dialer.as_ref(), proxy, addr).await,
        None => dial_with_timeout(cfg.dialer.as_ref(), addr, cfg.connect_timeout)
            .await
            .map_err(Error::Dial),
    }
}

async fn tls_step(cfg: &AgentConfig, io: Box<dyn IoStream>) -> Result<Box<dyn IoStream>, Error> {
    let tls_config = tls::client_config(cfg.ca_roots.as_ref(), &[], cfg.tls_customizer.as_ref())?;
    let name = tls::server_name(tls::host_of(&cfg.server_addr))?;
    let stream = tls::client_handshake(io, Arc::new(tls_config), name)
        .await
        .map_err(Error::Tls)?;
    Ok(Box::new(stream) as Box<dyn IoStream>)
}

async fn race<F: std::future::Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        () = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
