//! HTTP-aware forwarding, end to end: agent -> mock edge -> proxy stream
//! -> forwarder -> local upstream.

mod common;

use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use ngrok_agent::{EndpointConfig, Upstream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Small upload: POST with a small body is proxied, the response comes
/// back intact.
#[tokio::test]
async fn small_upload_succeeds() {
    let (edge, agent) = edge_and_agent().await;

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        serve_http_once(
            &mut conn,
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK",
        )
        .await
    });

    let forwarder = agent
        .forward(
            EndpointConfig::new(),
            Upstream::new(upstream_addr.to_string()),
        )
        .await
        .unwrap();

    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    let mut stream = session
        .open_proxy(&proxy_header(&forwarder.id()))
        .await
        .unwrap();

    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: app.edge.test\r\nContent-Length: 13\r\n\r\nsmall payload",
        )
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let (status, body) = read_http_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"OK");

    let (request_head, request_body) = upstream_task.await.unwrap();
    assert!(request_head.starts_with("POST /upload HTTP/1.1\r\n"));
    assert_eq!(request_body, b"small payload");
}

/// An upstream that rejects an oversized upload early: the client must see
/// the 413 and its body even though it is still sending the request body.
#[tokio::test]
async fn early_413_is_preserved() {
    let (edge, agent) = edge_and_agent().await;

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        // Read a bit more than 1 KiB of the request, then bail out.
        let mut seen = 0usize;
        let mut buf = [0u8; 512];
        while seen < 1024 + 512 {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => seen += n,
            }
        }
        let _ = conn
            .write_all(
                b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 17\r\nConnection: close\r\n\r\nPayload too large",
            )
            .await;
        let _ = conn.flush().await;
        // Linger briefly so the response drains before the socket dies.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let forwarder = agent
        .forward(
            EndpointConfig::new(),
            Upstream::new(upstream_addr.to_string()),
        )
        .await
        .unwrap();

    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    let stream = session
        .open_proxy(&proxy_header(&forwarder.id()))
        .await
        .unwrap();
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    const BODY_LEN: usize = 5 * 1024 * 1024;
    let writer = tokio::spawn(async move {
        if write_half
            .write_all(
                format!(
                    "POST /upload HTTP/1.1\r\nHost: app.edge.test\r\nContent-Length: {BODY_LEN}\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .is_err()
        {
            return;
        }
        // Push the body until the far side stops caring.
        let chunk = vec![b'x'; 64 * 1024];
        let mut sent = 0usize;
        while sent < BODY_LEN {
            if write_half.write_all(&chunk).await.is_err() {
                break;
            }
            sent += chunk.len();
        }
    });

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(10),
        read_http_response(&mut read_half),
    )
    .await
    .expect("response must arrive while the body is still uploading");
    assert_eq!(status, 413);
    assert_eq!(body, b"Payload too large");

    writer.abort();
}

/// Peek the buffered request head without consuming it, so the upstream
/// can route a connection to the WebSocket handshake or the plain-HTTP
/// handler with the request still unread.
async fn peek_request_head(conn: &tokio::net::TcpStream) -> String {
    let mut buf = vec![0u8; 2048];
    loop {
        let n = conn.peek(&mut buf).await.expect("peek request head");
        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            return String::from_utf8_lossy(&buf[..n]).into_owned();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// WebSocket upgrade: a real tungstenite client handshakes through the
/// tunnel to a tungstenite echo server; a later plain request on the same
/// endpoint still works.
#[tokio::test]
async fn websocket_upgrade_then_plain_get() {
    let (edge, agent) = edge_and_agent().await;

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = upstream.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let head = peek_request_head(&conn).await;
                if head.to_ascii_lowercase().contains("upgrade: websocket") {
                    let mut ws = tokio_tungstenite::accept_async(conn)
                        .await
                        .expect("upstream websocket handshake");
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Text(_) | Message::Binary(_) => {
                                if ws.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                } else {
                    serve_http_once(&mut conn, "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nplain")
                        .await;
                }
            });
        }
    });

    let forwarder = agent
        .forward(
            EndpointConfig::new(),
            Upstream::new(upstream_addr.to_string()),
        )
        .await
        .unwrap();
    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();

    // Real WebSocket handshake over the first proxy stream; tungstenite
    // verifies the Sec-WebSocket-Accept that traveled back through the
    // forwarder's 101 path.
    let stream = session
        .open_proxy(&proxy_header(&forwarder.id()))
        .await
        .unwrap();
    let (mut ws, resp) = tokio_tungstenite::client_async("ws://app.edge.test/ws", stream)
        .await
        .expect("websocket handshake through the tunnel");
    assert_eq!(resp.status().as_u16(), 101);

    ws.send(Message::Text("hello websocket".into()))
        .await
        .unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("echo should arrive")
        .expect("websocket still open")
        .unwrap();
    assert_eq!(echoed.into_text().unwrap().as_str(), "hello websocket");
    let _ = ws.close(None).await;
    drop(ws);

    // A later plain request on the same endpoint must not see a gateway
    // error.
    let mut plain = session
        .open_proxy(&proxy_header(&forwarder.id()))
        .await
        .unwrap();
    plain
        .write_all(b"GET / HTTP/1.1\r\nHost: app.edge.test\r\n\r\n")
        .await
        .unwrap();
    let (status, body) = read_http_response(&mut plain).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"plain");
}

/// Connection events bracket the HTTP request events, in order.
#[tokio::test]
async fn http_events_are_ordered() {
    let (edge, agent, events) = edge_agent_events().await;

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        serve_http_once(
            &mut conn,
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
        )
        .await
    });

    let forwarder = agent
        .forward(
            EndpointConfig::new(),
            Upstream::new(upstream_addr.to_string()),
        )
        .await
        .unwrap();
    let session = edge.next_session(SESSION_TIMEOUT).await.unwrap();
    let mut stream = session
        .open_proxy(&proxy_header(&forwarder.id()))
        .await
        .unwrap();
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_http_response(&mut stream).await;
    assert_eq!(status, 200);
    drop(stream);

    // Wait for the connection task to finish and emit ConnectionClosed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = events.lock().unwrap().clone();
        let per_conn: Vec<&ngrok_agent::Event> = snapshot
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ngrok_agent::Event::ConnectionOpened { .. }
                        | ngrok_agent::Event::HttpRequestComplete { .. }
                        | ngrok_agent::Event::ConnectionClosed { .. }
                )
            })
            .collect();
        if let [
            ngrok_agent::Event::ConnectionOpened { .. },
            ngrok_agent::Event::HttpRequestComplete { method, status, .. },
            ngrok_agent::Event::ConnectionClosed {
                bytes_in, bytes_out, ..
            },
        ] = per_conn.as_slice()
        {
            assert_eq!(method, "GET");
            assert_eq!(*status, 200);
            assert!(*bytes_in > 0);
            assert!(*bytes_out > 0);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected Opened -> HttpRequestComplete -> Closed, got {} events",
            per_conn.len()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
