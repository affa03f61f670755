//! End-to-end tests: a real broker on a loopback port with real clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use k8mq_client::{ClientConfig, ClientState, QueClient};
use k8mq_core::{Message, ReadCallback};
use k8mq_server::{BrokerConfig, QueServer};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        shutdown_grace_ms: 50,
        ..BrokerConfig::default()
    }
}

async fn boot(server: QueServer) -> (Arc<QueServer>, SocketAddr) {
    let server = Arc::new(server);
    let addr = server.listen().await.unwrap();
    (server, addr)
}

/// Wait until the registry has admitted `n` connections.
async fn wait_for_connections(server: &QueServer, n: usize) {
    timeout(TIMEOUT, async {
        while server.connection_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {n} connections, have {}",
            server.connection_count()
        )
    });
}

/// Connect a client whose reader forwards everything into a channel.
async fn connect_client(addr: SocketAddr) -> (QueClient, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reader: ReadCallback = Arc::new(move |msg| {
        let _ = tx.send(msg);
    });
    let config = ClientConfig::new("127.0.0.1")
        .with_port(addr.port())
        .with_backoff_base(Duration::from_millis(50));
    let client = QueClient::start(config, Some(reader)).unwrap();
    client
        .wait_for_state(ClientState::Connected, TIMEOUT)
        .await
        .unwrap();
    (client, rx)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("reader channel closed")
}

async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    let _ = timeout(TIMEOUT, stream.read_to_string(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_owned())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn hello_world_reaches_every_client() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, mut a_rx) = connect_client(addr).await;
    let (b, mut b_rx) = connect_client(addr).await;
    wait_for_connections(&server, 2).await;

    let hello = json!({"type": "Hello World"}).to_string();
    a.enqueue(hello.clone()).await.unwrap();

    assert_eq!(next_message(&mut b_rx).await.as_str(), Some(hello.as_str()));
    // The sender is a registry member too.
    assert_eq!(next_message(&mut a_rx).await.as_str(), Some(hello.as_str()));

    a.close(TIMEOUT).await.unwrap();
    b.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, _a_rx) = connect_client(addr).await;
    let (b, mut b_rx) = connect_client(addr).await;
    wait_for_connections(&server, 2).await;

    for i in 0..25 {
        a.enqueue(format!("msg-{i}")).await.unwrap();
    }
    for i in 0..25 {
        let expected = format!("msg-{i}");
        assert_eq!(next_message(&mut b_rx).await.as_str(), Some(expected.as_str()));
    }

    a.close(TIMEOUT).await.unwrap();
    b.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn late_joiner_sees_only_later_messages() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, mut a_rx) = connect_client(addr).await;
    wait_for_connections(&server, 1).await;

    a.enqueue("before").await.unwrap();
    assert_eq!(next_message(&mut a_rx).await.as_str(), Some("before"));

    let (c, mut c_rx) = connect_client(addr).await;
    wait_for_connections(&server, 2).await;
    a.enqueue("after").await.unwrap();
    assert_eq!(next_message(&mut c_rx).await.as_str(), Some("after"));

    a.close(TIMEOUT).await.unwrap();
    c.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn server_side_broadcast_fans_out() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, mut a_rx) = connect_client(addr).await;
    wait_for_connections(&server, 1).await;

    server.broadcast("from the broker").await.unwrap();
    assert_eq!(next_message(&mut a_rx).await.as_str(), Some("from the broker"));

    a.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn request_gets_reply_from_responder() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;

    let (responder, mut responder_rx) = connect_client(addr).await;
    let responder = Arc::new(responder);
    let answering = responder.clone();
    let replies = tokio::spawn(async move {
        while let Some(msg) = responder_rx.recv().await {
            let Some(req) = msg.to_correlated() else {
                continue;
            };
            if req.body["ask"] == "ping" {
                let reply = Message::correlated(req.correlation_id, json!({"answer": "pong"}))
                    .unwrap();
                answering.enqueue(reply).await.unwrap();
            }
        }
    });

    let (requester, _requester_rx) = connect_client(addr).await;
    wait_for_connections(&server, 2).await;

    let id = QueClient::new_correlation_id();
    let reply = requester
        .request(id.clone(), json!({"ask": "ping"}), TIMEOUT)
        .await
        .unwrap();
    let reply = reply.to_correlated().unwrap();
    assert_eq!(reply.correlation_id, id);
    assert_eq!(reply.body, json!({"answer": "pong"}));
    assert_eq!(requester.pending_waiters(), 0);

    requester.close(TIMEOUT).await.unwrap();
    responder.close(TIMEOUT).await.unwrap();
    replies.abort();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn request_without_responder_times_out() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (requester, _rx) = connect_client(addr).await;
    wait_for_connections(&server, 1).await;

    let result = requester
        .request("lonely", json!({"ask": "anyone?"}), Duration::from_millis(300))
        .await;
    assert!(result.is_err());
    assert_eq!(requester.pending_waiters(), 0);

    requester.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn shutdown_sentinel_reaches_clients_and_probes_flip() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, mut a_rx) = connect_client(addr).await;
    wait_for_connections(&server, 1).await;

    let (status, body) = http_get(addr, "/status/ready").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Things look good");

    server.send_shutdown().await;
    assert!(next_message(&mut a_rx).await.is_shutdown());

    let (status, body) = http_get(addr, "/status/live").await;
    assert_eq!(status, 503);
    assert_eq!(body, "Not Running");

    a.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn upgrade_refused_once_shutdown_started() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    server.send_shutdown().await;

    let url = format!("ws://{addr}/que");
    assert!(connect_async(url.as_str()).await.is_err());

    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn root_and_health_routes() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;

    let (status, body) = http_get(addr, "/").await;
    assert_eq!(status, 200);
    let banner: String = serde_json::from_str(&body).unwrap();
    assert!(banner.starts_with("K8MQ Server"));

    let (status, body) = http_get(addr, "/health").await;
    assert_eq!(status, 200);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "ok");

    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn binary_frames_are_relayed_as_binary() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (listener, mut listener_rx) = connect_client(addr).await;

    let url = format!("ws://{addr}/que");
    let (mut raw, _) = connect_async(url.as_str()).await.unwrap();
    wait_for_connections(&server, 2).await;

    raw.send(WsMessage::Binary(vec![0xff, 0x00].into()))
        .await
        .unwrap();
    raw.send(WsMessage::Text("text after binary".into()))
        .await
        .unwrap();

    assert_eq!(next_message(&mut listener_rx).await.as_bytes(), &[0xff, 0x00]);
    assert_eq!(
        next_message(&mut listener_rx).await.as_str(),
        Some("text after binary")
    );

    // The raw socket gets both echoes back with their frame kinds intact.
    let echoed = timeout(TIMEOUT, async {
        let mut frames = Vec::new();
        while frames.len() < 2 {
            match raw.next().await {
                Some(Ok(frame @ (WsMessage::Binary(_) | WsMessage::Text(_)))) => frames.push(frame),
                Some(Ok(_)) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        frames
    })
    .await
    .unwrap();
    assert_eq!(echoed[0], WsMessage::Binary(vec![0xff, 0x00].into()));
    assert_eq!(echoed[1], WsMessage::Text("text after binary".into()));

    let _ = raw.close(None).await;
    listener.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn non_utf8_payload_reaches_other_clients() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, _a_rx) = connect_client(addr).await;
    let (b, mut b_rx) = connect_client(addr).await;
    wait_for_connections(&server, 2).await;

    a.enqueue(vec![0xff, 0xfe, 0x41]).await.unwrap();
    a.enqueue("marker").await.unwrap();

    assert_eq!(next_message(&mut b_rx).await.as_bytes(), &[0xff, 0xfe, 0x41]);
    assert_eq!(next_message(&mut b_rx).await.as_str(), Some("marker"));

    a.close(TIMEOUT).await.unwrap();
    b.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn close_delivers_broadcasts_queued_before_it() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, mut a_rx) = connect_client(addr).await;
    wait_for_connections(&server, 1).await;

    let big = |i: usize| format!("{i:02}{}", "x".repeat(1 << 20));
    for i in 0..12 {
        server.broadcast(big(i)).await.unwrap();
    }
    server.close(TIMEOUT).await.unwrap();

    for i in 0..12 {
        let msg = next_message(&mut a_rx).await;
        assert_eq!(msg.len(), big(i).len());
        assert!(msg.as_str().unwrap().starts_with(&format!("{i:02}")));
    }

    a.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn disconnected_client_is_pruned() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, _a_rx) = connect_client(addr).await;
    let (b, mut b_rx) = connect_client(addr).await;
    wait_for_connections(&server, 2).await;

    a.close(TIMEOUT).await.unwrap();
    // Either the handler's liveness or the next failed write removes it.
    server.broadcast("ping").await.unwrap();
    assert_eq!(next_message(&mut b_rx).await.as_str(), Some("ping"));
    wait_for_connections(&server, 1).await;

    b.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn reader_mode_consumes_instead_of_broadcasting() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let server = QueServer::new(test_config())
        .unwrap()
        .with_reader(move |msg| {
            let _ = seen_tx.send(msg);
        });
    let (server, addr) = boot(server).await;
    let (a, mut a_rx) = connect_client(addr).await;
    let (b, mut b_rx) = connect_client(addr).await;
    wait_for_connections(&server, 2).await;

    a.enqueue("for the server only").await.unwrap();
    assert_eq!(
        next_message(&mut seen_rx).await.as_str(),
        Some("for the server only")
    );
    assert!(
        timeout(Duration::from_millis(200), b_rx.recv())
            .await
            .is_err()
    );
    assert!(a_rx.try_recv().is_err());

    a.close(TIMEOUT).await.unwrap();
    b.close(TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn client_notices_server_close() {
    let (server, addr) = boot(QueServer::new(test_config()).unwrap()).await;
    let (a, _a_rx) = connect_client(addr).await;
    wait_for_connections(&server, 1).await;

    server.close(TIMEOUT).await.unwrap();
    a.wait_for_state(ClientState::Connecting, TIMEOUT)
        .await
        .unwrap();
    assert!(server.broadcast("gone").await.is_err());

    a.close(TIMEOUT).await.unwrap();
    assert_eq!(a.state(), ClientState::Closed);
}
