//! Integration tests for the WebSocket transport.
//!
//! These tests start a real server and connect real clients,
//! verifying the full open / edit / close pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use syncit_collab::broadcast::TopicHub;
use syncit_collab::protocol::{topic_for, ClientCommand, ServerMessage};
use syncit_collab::registry::SessionRegistry;
use syncit_collab::router::Router;
use syncit_collab::server::{ServerConfig, SyncServer};
use syncit_collab::session::FileId;
use syncit_collab::storage::MemoryStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port backed by `store`, return its URL and router.
async fn start_test_server(store: Arc<MemoryStore>) -> (String, Arc<Router>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = Arc::new(Router::new(
        Arc::new(SessionRegistry::new()),
        Arc::new(TopicHub::new(64)),
        store,
    ));
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        ..ServerConfig::default()
    };
    let server = SyncServer::with_router(config, router.clone());
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    (format!("ws://{addr}"), router)
}

async fn connect(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, command: ClientCommand) {
    let text = command.encode().unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn send_to(ws: &mut Client, destination: &str, body: &str) {
    send(
        ws,
        ClientCommand::Send {
            destination: destination.to_string(),
            body: body.to_string(),
        },
    )
    .await;
}

async fn subscribe(ws: &mut Client, id: i64) {
    send(
        ws,
        ClientCommand::Subscribe {
            topic: topic_for(FileId(id)),
        },
    )
    .await;
}

/// Next server message, skipping control frames.
async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("message within timeout")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return ServerMessage::decode(text.as_str()).unwrap();
        }
    }
}

async fn wait_for_subscribers(router: &Router, id: i64, count: usize) {
    for _ in 0..100 {
        let stats = router.topics().stats(FileId(id)).await;
        if stats.is_some_and(|s| s.subscribers >= count) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Expected {count} subscribers on file {id}");
}

fn body_of(msg: ServerMessage) -> String {
    match msg {
        ServerMessage::Message { body, .. } => body,
        other => panic!("Expected topic message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _) = start_test_server(Arc::new(MemoryStore::new())).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_open_broadcasts_persisted_content() {
    let store = Arc::new(MemoryStore::with_files([(FileId(1), "hello")]));
    let (url, _) = start_test_server(store).await;

    let mut alice = connect(&url).await;
    subscribe(&mut alice, 1).await;
    send_to(&mut alice, "/app/file/1/open", "").await;

    match recv(&mut alice).await {
        ServerMessage::Message { topic, body } => {
            assert_eq!(topic, "/topic/file/1");
            assert_eq!(body, r#"{"sender":"server","content":"hello"}"#);
        }
        other => panic!("Expected open response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_two_clients_share_edits() {
    let store = Arc::new(MemoryStore::new());
    let (url, router) = start_test_server(store.clone()).await;

    let mut alice = connect(&url).await;
    let mut bob = connect(&url).await;
    subscribe(&mut alice, 2).await;
    subscribe(&mut bob, 2).await;
    wait_for_subscribers(&router, 2, 2).await;

    send_to(&mut alice, "/app/file/2/open", "").await;
    let open = r#"{"sender":"server","content":""}"#;
    assert_eq!(body_of(recv(&mut alice).await), open);
    assert_eq!(body_of(recv(&mut bob).await), open);

    let edit = r#"{"content":"shared text","cursor":4}"#;
    send_to(&mut alice, "/app/file/2/edit", edit).await;

    assert_eq!(body_of(recv(&mut bob).await), edit);
    assert_eq!(body_of(recv(&mut alice).await), edit);

    send_to(&mut bob, "/app/file/2/close", "").await;
    for _ in 0..50 {
        if router.registry().get(FileId(2)).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.get(FileId(2)).await.as_deref(), Some("shared text"));
    assert!(router.registry().get(FileId(2)).await.is_none());
}

#[tokio::test]
async fn test_unsubscribe_stops_frames() {
    let (url, _) = start_test_server(Arc::new(MemoryStore::new())).await;

    let mut alice = connect(&url).await;
    subscribe(&mut alice, 3).await;
    send_to(&mut alice, "/app/file/3/edit", r#"{"content":"one"}"#).await;
    assert_eq!(body_of(recv(&mut alice).await), r#"{"content":"one"}"#);

    send(
        &mut alice,
        ClientCommand::Unsubscribe {
            topic: topic_for(FileId(3)),
        },
    )
    .await;
    send_to(&mut alice, "/app/file/3/edit", r#"{"content":"two"}"#).await;

    let result = timeout(Duration::from_millis(100), alice.next()).await;
    assert!(result.is_err(), "Unsubscribed client should not receive frames");
}

#[tokio::test]
async fn test_disconnect_closes_opened_files() {
    let store = Arc::new(MemoryStore::new());
    let (url, router) = start_test_server(store.clone()).await;

    let mut alice = connect(&url).await;
    subscribe(&mut alice, 4).await;
    send_to(&mut alice, "/app/file/4/edit", r#"{"content":"draft"}"#).await;
    body_of(recv(&mut alice).await);

    alice.close(None).await.unwrap();
    drop(alice);

    for _ in 0..100 {
        if router.registry().get(FileId(4)).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.get(FileId(4)).await.as_deref(), Some("draft"));
    assert!(router.registry().get(FileId(4)).await.is_none());
}

#[tokio::test]
async fn test_bad_commands_get_error_replies() {
    let (url, router) = start_test_server(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(&url).await;

    alice
        .send(Message::Text("not a command".into()))
        .await
        .unwrap();
    assert!(matches!(recv(&mut alice).await, ServerMessage::Error { .. }));

    send_to(&mut alice, "/app/file/5/rename", "").await;
    match recv(&mut alice).await {
        ServerMessage::Error { message } => assert!(message.contains("/app/file/5/rename")),
        other => panic!("Expected error, got {other:?}"),
    }

    send_to(&mut alice, "/app/file/5/edit", "[1, 2]").await;
    assert!(matches!(recv(&mut alice).await, ServerMessage::Error { .. }));
    assert!(router.registry().is_empty().await);
}

#[tokio::test]
async fn test_run_without_executor_is_rejected() {
    let (url, _) = start_test_server(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(&url).await;

    send(
        &mut alice,
        ClientCommand::Run {
            file_id: FileId(6),
            extension: "py".into(),
        },
    )
    .await;

    match recv(&mut alice).await {
        ServerMessage::RunFailed { file_id, reason, .. } => {
            assert_eq!(file_id, FileId(6));
            assert_eq!(reason, "disabled");
        }
        other => panic!("Expected run failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _) = start_test_server(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(&url).await;

    alice
        .send(Message::Ping(vec![7u8, 7].into()))
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(2), alice.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match msg {
        Message::Pong(data) => assert_eq!(&data[..], &[7u8, 7]),
        other => panic!("Expected pong, got {other:?}"),
    }
}
