//! Session lifecycle: connect, bind/unbind symmetry, reconnect with
//! re-registration, remote commands, and close-under-load.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use common::*;
use na_protocol::types;
use ngrok_agent::{
    Agent, EndpointConfig, Error, Event, RemoteCommand, Upstream,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn connect_authenticates_and_emits_event() {
    let (edge, agent, events) = edge_agent_events().await;

    agent.connect().await.unwrap();
    let session = agent.session().unwrap();
    assert!(!session.client_id().is_empty());
    assert_eq!(session.region(), "us");

    let saw_connect = events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Event::AgentConnectSucceeded { .. }));
    assert!(saw_connect);

    // Second connect while connected is a lifecycle error.
    assert!(matches!(
        agent.connect().await,
        Err(Error::AlreadyConnected)
    ));

    let _ = edge;
    agent.disconnect().await;
    assert!(matches!(agent.session(), Err(Error::NotConnected)));
}

#[tokio::test]
async fn auth_rejection_surfaces_with_code() {
    let (edge, agent) = edge_and_agent().await;
    edge.set_auth_error(Some("bad credentials\n\nERR_NGROK_105"));

    let err = agent.connect().await.unwrap_err();
    match &err {
        Error::AuthRemote(remote) => assert_eq!(remote.code(), Some("ERR_NGROK_105")),
        other => panic!("expected AuthRemote, got {other:?}"),
    }
    // Stop the background retry loop.
    agent.disconnect().await;
}

#[tokio::test]
async fn heartbeat_latency_is_observable() {
    let (edge, agent, events) = edge_agent_events().await;
    agent.connect().await.unwrap();

    let session = agent.session().unwrap();
    let latency = tokio::time::timeout(Duration::from_secs(5), session.next_latency())
        .await
        .expect("a heartbeat should arrive promptly")
        .expect("latency channel open");
    assert!(latency > Duration::ZERO);

    let saw_beat = events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Event::AgentHeartbeatReceived { latency, .. } if *latency > Duration::ZERO));
    assert!(saw_beat);

    let _ = edge;
    agent.disconnect().await;
}

#[tokio::test]
async fn bind_unbind_symmetry() {
    let (edge, agent) = edge_and_agent().await;

    let listener = agent
        .listen(
            EndpointConfig::new()
                .with_metadata("m1")
                .with_description("ingress for tests"),
        )
        .await
        .unwrap();
    assert_eq!(agent.endpoints().len(), 1);
    assert!(listener.url().starts_with("https://"));

    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    assert!(session.wait_for_binds(1, SESSION_TIMEOUT).await);
    let bound = session.bound_by_id(&listener.id()).unwrap();
    assert_eq!(bound.metadata, "m1");

    listener.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), listener.done())
        .await
        .expect("done should fire promptly");
    assert!(agent.endpoints().is_empty());
    assert!(session.bound_by_id(&listener.id()).is_none(), "unbound remotely");

    // Accept after close reports the teardown.
    assert!(listener.accept().await.is_err());

    // Closing again is a no-op.
    listener.close().await.unwrap();
    agent.disconnect().await;
}

#[tokio::test]
async fn close_under_load_fires_done_within_a_second() {
    let (edge, agent) = edge_and_agent().await;

    let listener = Arc::new(agent.listen(EndpointConfig::new()).await.unwrap());
    let id = listener.id();
    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();

    // Serve accepted streams while the edge keeps pushing new ones.
    let serve_listener = listener.clone();
    let server = tokio::spawn(async move {
        while let Ok(mut conn) = serve_listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let flood_session = session.clone();
    let flood = tokio::spawn(async move {
        loop {
            match flood_session.open_proxy(&proxy_header(&id)).await {
                Ok(mut s) => {
                    let _ = s.write_all(b"ping").await;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(_) => break,
            }
        }
    });

    // Let some load build up, then close while streams keep arriving.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(agent.endpoints().len(), 1);
    listener.close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), listener.done())
        .await
        .expect("done must fire within a second under load");
    assert!(agent.endpoints().is_empty());

    flood.abort();
    server.abort();
    agent.disconnect().await;
}

#[tokio::test]
async fn reconnect_preserves_registry() {
    let (edge, agent, events) = edge_agent_events().await;

    // One URL-bound forwarder, one labeled listener.
    let forwarder = agent
        .forward(
            EndpointConfig::new().with_metadata("keep-me"),
            Upstream::new("127.0.0.1:1"),
        )
        .await
        .unwrap();
    let labeled = agent
        .listen(
            EndpointConfig::new()
                .with_label("edge", "e1")
                .with_metadata("labeled-meta"),
        )
        .await
        .unwrap();

    let url_id = forwarder.id();
    let label_id_before = labeled.id();

    let first = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    assert!(first.wait_for_binds(2, SESSION_TIMEOUT).await);

    // Kill the transport; the agent must reconnect and replay both binds.
    first.kill();

    let second = edge.next_session(Duration::from_secs(10)).await.unwrap();
    assert!(second.wait_for_binds(2, Duration::from_secs(10)).await);

    // URL-bound endpoint: same ID, re-bound on the new session.
    let rebound = second.bound_by_id(&url_id).expect("URL endpoint kept its ID");
    assert_eq!(rebound.metadata, "keep-me");

    // Labeled endpoint: fresh ID, old one gone, metadata preserved.
    let label_id_after = labeled.id();
    assert_ne!(label_id_after, label_id_before, "labeled endpoint re-keyed");
    let relabeled = second
        .bound_by_id(&label_id_after)
        .expect("labeled endpoint re-registered");
    assert_eq!(relabeled.metadata, "labeled-meta");

    // The agent's snapshot tracks the re-key.
    let ids: Vec<String> = agent.endpoints().into_iter().map(|e| e.id).collect();
    assert!(ids.contains(&url_id));
    assert!(ids.contains(&label_id_after));

    // Events: a disconnect followed by a reconnect.
    let snapshot = events.lock().unwrap().clone();
    let disconnects = snapshot
        .iter()
        .filter(|e| matches!(e, Event::AgentDisconnected { .. }))
        .count();
    let connects = snapshot
        .iter()
        .filter(|e| matches!(e, Event::AgentConnectSucceeded { .. }))
        .count();
    assert!(disconnects >= 1);
    assert!(connects >= 2);

    agent.disconnect().await;
}

#[tokio::test]
async fn remote_commands_reach_the_handler() {
    let edge = na_test_utils::MockEdge::start().await.unwrap();
    let seen: Arc<Mutex<Vec<RemoteCommand>>> = Arc::default();
    let sink = seen.clone();
    let agent = Agent::builder()
        .authtoken("test-token")
        .server_addr(edge.server_addr())
        .ca_roots(edge.ca_roots())
        .command_handler(Arc::new(move |cmd| {
            sink.lock().unwrap().push(cmd);
            Ok(())
        }))
        .build();
    agent.connect().await.unwrap();

    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    let resp = session
        .send_command(types::STOP, &na_protocol::Stop {})
        .await
        .unwrap();
    assert_eq!(resp.error, "");

    let resp = session
        .send_command(
            types::STOP_TUNNEL,
            &na_protocol::StopTunnel {
                id: "ep_1".to_owned(),
                message: "going away".to_owned(),
                error_code: String::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.error, "");

    let commands = seen.lock().unwrap().clone();
    assert!(commands.contains(&RemoteCommand::Stop));
    assert!(commands.iter().any(|c| matches!(
        c,
        RemoteCommand::StopTunnel { endpoint_id, .. } if endpoint_id == "ep_1"
    )));

    agent.disconnect().await;
}

#[tokio::test]
async fn disconnect_signals_done_on_all_endpoints() {
    let (edge, agent) = edge_and_agent().await;

    let listener = agent.listen(EndpointConfig::new()).await.unwrap();
    let _session = edge.next_session(SESSION_TIMEOUT).await.unwrap();

    agent.disconnect().await;
    tokio::time::timeout(Duration::from_secs(1), listener.done())
        .await
        .expect("disconnect fires done");
    assert!(agent.endpoints().is_empty());
}

#[tokio::test]
async fn agent_tls_termination_on_listener() {
    let (edge, agent) = edge_and_agent().await;

    let cert = na_test_utils::TestCert::generate(&["app.edge.test"]);
    let listener = agent
        .listen(EndpointConfig::new().with_agent_tls(cert.server_config()))
        .await
        .unwrap();
    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();

    let serve = tokio::spawn(async move {
        let mut conn = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();
        conn.flush().await.unwrap();
        listener
    });

    let stream = session
        .open_proxy(&proxy_header(&agent.endpoints()[0].id))
        .await
        .unwrap();

    // The edge-side client performs a TLS handshake that the agent
    // terminates with the supplied server config.
    let connector = tokio_rustls::TlsConnector::from(cert.client_config());
    let name = rustls::pki_types::ServerName::try_from("app.edge.test").unwrap();
    let mut tls = connector.connect(name, stream).await.unwrap();
    tls.write_all(b"ping").await.unwrap();
    tls.flush().await.unwrap();
    let mut buf = [0u8; 4];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    let listener = serve.await.unwrap();
    listener.close().await.unwrap();
    agent.disconnect().await;
}
