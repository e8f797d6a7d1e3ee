//! PROXY protocol preamble handling on the forwarder's raw path.

mod common;

use std::time::Duration;

use common::*;
use na_test_utils::TestCert;
use ngrok_agent::{EndpointConfig, ProxyProto, Upstream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const V1_LINE: &[u8] = b"PROXY TCP4 198.51.100.1 203.0.113.9 56324 443\r\n";

/// With a tls:// upstream and PROXY v1 configured, the preamble must reach
/// the upstream in cleartext before the TLS handshake.
#[tokio::test]
async fn proxy_v1_precedes_upstream_tls() {
    let (edge, agent) = edge_and_agent().await;

    let cert = TestCert::generate(&["localhost", "127.0.0.1"]);
    let acceptor = TlsAcceptor::from(cert.server_config());
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();

    let upstream_task = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        // Record the cleartext preamble, byte-exact through the CRLF.
        let mut preamble = Vec::new();
        loop {
            let b = conn.read_u8().await.unwrap();
            preamble.push(b);
            if preamble.ends_with(b"\r\n") {
                break;
            }
            assert!(preamble.len() <= 108, "preamble never terminated");
        }
        // Only now does the TLS handshake start.
        let mut tls = acceptor.accept(conn).await.expect("TLS after preamble");
        let mut buf = [0u8; 17];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-through-tls");
        tls.write_all(b"ack").await.unwrap();
        tls.flush().await.unwrap();
        preamble
    });

    let forwarder = agent
        .forward(
            EndpointConfig::new()
                .with_url("tcp://")
                .with_proxy_proto(ProxyProto::V1),
            Upstream::new(format!("tls://localhost:{upstream_port}"))
                .with_tls_config(cert.client_config()),
        )
        .await
        .unwrap();

    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    let mut header = proxy_header(&forwarder.id());
    header.proto = "tcp".to_owned();
    let mut stream = session.open_proxy(&header).await.unwrap();

    // The edge emits the preamble in cleartext ahead of the payload.
    stream.write_all(V1_LINE).await.unwrap();
    stream.write_all(b"hello-through-tls").await.unwrap();
    stream.flush().await.unwrap();

    let mut ack = [0u8; 3];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut ack))
        .await
        .expect("ack should arrive")
        .unwrap();
    assert_eq!(&ack, b"ack");

    let preamble = upstream_task.await.unwrap();
    assert_eq!(preamble, V1_LINE);
}

/// Without upstream TLS there is nothing to re-order: the preamble just
/// flows through the copy with the payload.
#[tokio::test]
async fn proxy_v2_passes_through_plain_upstream() {
    let (edge, agent) = edge_and_agent().await;

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let upstream_task = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
    });

    let forwarder = agent
        .forward(
            EndpointConfig::new()
                .with_url("tcp://")
                .with_proxy_proto(ProxyProto::V2),
            Upstream::new(format!("tcp://127.0.0.1:{upstream_port}")),
        )
        .await
        .unwrap();

    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    let mut header = proxy_header(&forwarder.id());
    header.proto = "tcp".to_owned();
    let mut stream = session.open_proxy(&header).await.unwrap();

    // Minimal v2 header: signature, v2/PROXY, TCP4, 12 address bytes.
    let mut v2 = vec![
        0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A, 0x21, 0x11,
    ];
    v2.extend_from_slice(&12u16.to_be_bytes());
    v2.extend_from_slice(&[198, 51, 100, 1, 203, 0, 113, 9, 0xDC, 0x04, 0x01, 0xBB]);

    let mut expected = v2.clone();
    expected.extend_from_slice(b"payload");

    stream.write_all(&v2).await.unwrap();
    stream.write_all(b"payload").await.unwrap();
    stream.flush().await.unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    let received = tokio::time::timeout(Duration::from_secs(5), upstream_task)
        .await
        .expect("upstream should see the bytes")
        .unwrap();
    assert_eq!(received, expected);
}
