//! Staged diagnostics against dead ports, plain TCP listeners, and a full
//! mock edge.

mod common;

use std::time::Duration;

use common::*;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A port that was bound and immediately released: the probe fails at the
/// first step.
#[tokio::test]
async fn closed_port_fails_at_tcp() {
    let (_edge, agent) = edge_and_agent().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = agent.diagnose(&addr.to_string()).await;
    assert_eq!(result.failed_step.as_deref(), Some("tcp"));
    assert!(result.completed_steps.is_empty());
    assert!(result.error.is_some());
    assert!(result.region.is_empty());
}

/// A listener that accepts and hangs up: TCP completes, TLS fails.
#[tokio::test]
async fn plain_tcp_listener_fails_at_tls() {
    let (_edge, agent) = edge_and_agent().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            // Swallow the ClientHello, then hang up mid-handshake.
            let mut buf = [0u8; 1024];
            let _ = conn.read(&mut buf).await;
            drop(conn);
        }
    });

    let result = agent.diagnose(&addr.to_string()).await;
    assert_eq!(result.completed_steps, vec!["tcp".to_owned()]);
    assert_eq!(result.failed_step.as_deref(), Some("tls"));
}

/// Against the real (mock) server everything completes and the reply
/// carries region and latency.
#[tokio::test]
async fn full_server_completes_all_steps() {
    let (edge, agent) = edge_and_agent().await;
    edge.set_region("eu");

    let result = agent.diagnose(&edge.addr().to_string()).await;
    assert_eq!(
        result.completed_steps,
        vec!["tcp".to_owned(), "tls".to_owned(), "mux".to_owned()]
    );
    assert!(result.failed_step.is_none());
    assert_eq!(result.region, "eu");
    assert!(result.latency.unwrap() > Duration::ZERO);
}

/// The probe never authenticates, so a server that rejects every auth
/// still probes clean.
#[tokio::test]
async fn probe_does_not_authenticate() {
    let (edge, agent) = edge_and_agent().await;
    edge.set_auth_error(Some("rejected\n\nERR_NGROK_105"));

    let result = agent.diagnose(&edge.addr().to_string()).await;
    assert!(result.failed_step.is_none());
    assert_eq!(result.completed_steps.len(), 3);
}

/// Cancellation interrupts the probe immediately.
#[tokio::test]
async fn cancelled_probe_reports_the_interrupted_step() {
    let (_edge, agent) = edge_and_agent().await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    // RFC 5737 TEST-NET address; the dial would otherwise hang until the
    // timeout.
    let result = agent
        .diagnose_with_cancel("192.0.2.1:443", &cancel)
        .await;
    assert_eq!(result.failed_step.as_deref(), Some("tcp"));
    assert_eq!(result.error.as_deref(), Some("canceled"));
}

/// Probes are independent of any live session state.
#[tokio::test]
async fn probe_leaves_live_session_untouched() {
    let (edge, agent) = edge_and_agent().await;
    agent.connect().await.unwrap();
    let client_id = agent.session().unwrap().client_id();

    let result = agent.diagnose(&edge.addr().to_string()).await;
    assert!(result.failed_step.is_none());

    // The original session is still the one the agent holds.
    assert_eq!(agent.session().unwrap().client_id(), client_id);
    agent.disconnect().await;
}
