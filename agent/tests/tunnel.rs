//! Tunnel session and supervisor tests against an in-process relay.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use portgate::config::{SessionConfig, TunnelDescriptor};
use portgate::session::Session;
use portgate::supervisor::{Status, Supervisor};
use portgate_shared::{Frame, FrameKind, RequestId};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

fn request_id(last: u8) -> RequestId {
    let mut bytes = [0u8; 16];
    bytes[15] = last;
    RequestId::from_bytes(bytes)
}

fn config_for(relay_port: u16, local_port: u16) -> SessionConfig {
    SessionConfig {
        tunnels: vec![
            TunnelDescriptor::parse(&format!("app|127.0.0.1:{local_port}")).unwrap(),
        ],
        api_key: "sekrit".into(),
        hostname: format!("127.0.0.1:{relay_port}"),
        secure: false,
        user_agent: "portgate/test".into(),
        client_id: "cid42".into(),
    }
}

/// A local HTTP service that answers one GET with `ok`.
async fn spawn_local_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
    });
    port
}

/// Full round-trip over the channel: registration, one proxied request,
/// then a go-idle handoff.
#[tokio::test]
async fn test_session_round_trip_and_go_idle() {
    let local_port = spawn_local_service().await;

    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    let relay_task = tokio::spawn(async move {
        let (stream, _) = relay.accept().await.unwrap();

        let mut seen_auth = None;
        let mut seen_uri = None;
        let callback = |request: &Request, response: Response| {
            seen_auth = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            seen_uri = Some(request.uri().to_string());
            Ok(response)
        };
        let mut ws = accept_hdr_async(stream, callback).await.unwrap();

        // One GET through the tunnel; the body is empty, so end right away.
        let descriptor = serde_json::json!({
            "url": "/ping",
            "subdomain": "app",
            "method": "GET",
            "headers": {"host": "app.example"}
        });
        let open = Frame::new(
            request_id(1),
            FrameKind::Http,
            Bytes::from(descriptor.to_string()),
        );
        ws.send(Message::Binary(open.encode())).await.unwrap();
        ws.send(Message::Binary(Frame::end(request_id(1)).encode()))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        let mut body = Vec::new();
        while let Some(message) = ws.next().await {
            if let Message::Binary(bytes) = message.unwrap() {
                let frame = Frame::decode(&bytes).unwrap();
                assert_eq!(frame.request_id, request_id(1));
                kinds.push(frame.kind);
                match frame.kind {
                    FrameKind::Data => body.extend_from_slice(&frame.payload),
                    FrameKind::End | FrameKind::BadGateway => break,
                    _ => {}
                }
            }
        }
        assert_eq!(kinds.first(), Some(&FrameKind::Head));
        assert_eq!(kinds.last(), Some(&FrameKind::End));
        assert_eq!(body, b"ok");

        // Park the agent.
        let idle = serde_json::json!({
            "db": "acme.example.app",
            "dbKey": "wake",
            "apiKey": "k",
            "token": "t"
        });
        let park = Frame::new(request_id(0), FrameKind::GoIdle, Bytes::from(idle.to_string()));
        ws.send(Message::Binary(park.encode())).await.unwrap();

        (seen_auth, seen_uri)
    });

    let config = Arc::new(config_for(relay_port, local_port));
    let session = Session::connect(config).await.expect("channel open");
    let descriptor = session.run().await.expect("go-idle handoff");
    assert_eq!(descriptor.db_key, "wake");

    let (auth, uri) = relay_task.await.unwrap();
    assert_eq!(auth.as_deref(), Some("Bearer sekrit"));
    let uri = uri.expect("handshake URI");
    assert!(uri.starts_with("/api/tunnel?"));
    assert!(uri.contains("s=app%7Capp"), "route registration in {uri}");
    assert!(uri.contains("c=cid42"), "client id in {uri}");
}

/// A relay that closes right after accepting looks like a session failure.
#[tokio::test]
async fn test_relay_close_fails_session() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = relay.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.close(None).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let config = Arc::new(config_for(relay_port, 1));
    let session = Session::connect(config).await.expect("channel open");
    assert!(session.run().await.is_err());
}

/// No listener at all: the open itself fails.
#[tokio::test]
async fn test_connect_refused() {
    let config = Arc::new(config_for(1, 1));
    assert!(Session::connect(config).await.is_err());
}

/// A go-idle that lands before the settle delay is still a successful
/// connection: status must pass through connected on the way to idle.
#[tokio::test]
async fn test_early_go_idle_passes_through_connected() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = relay.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let idle = serde_json::json!({
            "db": "acme.example.app",
            "dbKey": "wake",
            "apiKey": "k",
            "token": "t"
        });
        let park = Frame::new(request_id(0), FrameKind::GoIdle, Bytes::from(idle.to_string()));
        ws.send(Message::Binary(park.encode())).await.unwrap();
        // Hold the channel open until the agent tears it down.
        while ws.next().await.is_some() {}
    });

    let (supervisor, mut status) = Supervisor::new(config_for(relay_port, 1));
    let run = tokio::spawn(supervisor.run());

    let mut seen = vec![*status.borrow()];
    while seen.len() < 3 {
        status.changed().await.unwrap();
        seen.push(*status.borrow_and_update());
    }
    run.abort();

    assert_eq!(
        seen,
        vec![Status::Connecting, Status::Connected, Status::Idle]
    );
}

/// The supervisor keeps cycling connecting -> disconnected with backoff.
#[tokio::test(start_paused = true)]
async fn test_supervisor_retries_after_failure() {
    let (supervisor, mut status) = Supervisor::new(config_for(1, 1));
    let run = tokio::spawn(supervisor.run());

    let mut seen = vec![*status.borrow()];
    while seen.len() < 4 {
        status.changed().await.unwrap();
        seen.push(*status.borrow_and_update());
    }
    run.abort();

    assert_eq!(
        seen,
        vec![
            Status::Connecting,
            Status::Disconnected,
            Status::Connecting,
            Status::Disconnected,
        ]
    );
}
