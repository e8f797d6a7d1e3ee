//! Shared setup for the end-to-end suites: a mock edge plus an agent
//! pointed at it, and small raw-HTTP helpers for driving the edge side of
//! proxy streams.

// Each suite compiles its own copy and uses a subset of the helpers.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use na_test_utils::MockEdge;
use ngrok_agent::{Agent, Event};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Mock edge + agent wired to it (trusting the edge certificate).
pub async fn edge_and_agent() -> (MockEdge, Agent) {
    init_tracing();
    let edge = MockEdge::start().await.expect("start mock edge");
    let agent = Agent::builder()
        .authtoken("test-token")
        .server_addr(edge.server_addr())
        .ca_roots(edge.ca_roots())
        .build();
    (edge, agent)
}

/// Agent with an event recorder attached.
pub async fn edge_agent_events() -> (MockEdge, Agent, Arc<Mutex<Vec<Event>>>) {
    let (edge, agent) = edge_and_agent().await;
    let events: Arc<Mutex<Vec<Event>>> = Arc::default();
    let sink = events.clone();
    agent.add_event_handler(Arc::new(move |event: &Event| {
        sink.lock().unwrap().push(event.clone());
    }));
    (edge, agent, events)
}

pub fn proxy_header(endpoint_id: &str) -> na_protocol::ProxyHeader {
    na_protocol::ProxyHeader {
        id: endpoint_id.to_owned(),
        client_addr: "203.0.113.7:51234".to_owned(),
        proto: "http".to_owned(),
        edge_type: String::new(),
        passthrough_tls: false,
    }
}

/// Read one HTTP header section (through the blank line).
pub async fn read_header_section<S>(stream: &mut S) -> String
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    while !buf.ends_with(b"\r\n\r\n") {
        let b = stream.read_u8().await.expect("header byte");
        buf.push(b);
        assert!(buf.len() < 64 * 1024, "runaway header section");
    }
    String::from_utf8(buf).expect("headers are ASCII")
}

/// Read a full HTTP response with a Content-Length body; returns the
/// status code and body.
pub async fn read_http_response<S>(stream: &mut S) -> (u16, Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let head = read_header_section(stream).await;
    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).await.expect("response body");
    (status, body)
}

/// Serve one plain-HTTP connection: wait for the full request (per
/// Content-Length), then write `response` verbatim.
pub async fn serve_http_once<S>(stream: &mut S, response: &str) -> (String, Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_header_section(stream).await;
    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).await.expect("request body");
    stream
        .write_all(response.as_bytes())
        .await
        .expect("write response");
    stream.flush().await.expect("flush response");
    (head, body)
}
