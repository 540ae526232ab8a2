//! Integration tests for the collaboration hub over real WebSockets.
//!
//! These tests start a real server and connect real clients, verifying
//! admission, room fan-out and voice presence end to end.

use std::sync::Arc;

use collab_hub::config::ServerConfig;
use collab_hub::protocol::{RoomId, UserId};
use collab_hub::server::HubServer;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return it with its port.
async fn start_test_server() -> (Arc<HubServer>, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = Arc::new(HubServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    }));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, port)
}

/// Connect as `user` in `room` and wait until the hub has registered it.
async fn join(server: &HubServer, port: u16, room: RoomId, user: UserId) -> Client {
    let url = format!("ws://127.0.0.1:{port}/ws?room_id={room}&user_id={user}");
    let (ws, _) = connect_async_ok(&url).await;

    timeout(Duration::from_secs(2), async {
        while !server.router().hub().room_members(room).await.contains(&user) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection should register");
    ws
}

async fn connect_async_ok(
    url: &str,
) -> (
    Client,
    tokio_tungstenite::tungstenite::handshake::client::Response,
) {
    timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

async fn send(ws: &mut Client, message: Value) {
    ws.send(Message::text(message.to_string())).await.unwrap();
}

/// Next JSON frame, skipping keepalive traffic.
async fn recv(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Should receive a frame within timeout")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {other:?}"),
        }
    }
}

/// Assert nothing arrives within a short window.
async fn assert_silent(ws: &mut Client) {
    let result = timeout(Duration::from_millis(150), ws.next()).await;
    assert!(result.is_err(), "Expected no frame, got {result:?}");
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, port) = start_test_server().await;
    let _ws = join(&server, port, 1, 10).await;

    let stats = server.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.rejected_connections, 0);
}

#[tokio::test]
async fn test_rejects_connection_without_identity() {
    let (server, port) = start_test_server().await;

    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws?room_id=1")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("Expected HTTP 401, got {other:?}"),
    }

    timeout(Duration::from_secs(2), async {
        while server.stats().rejected_connections == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("rejection should be counted");
    assert_eq!(server.stats().total_connections, 0);
    assert_eq!(server.router().hub().stats().await.connections, 0);
}

#[tokio::test]
async fn test_failed_handshake_is_not_a_rejection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (server, port) = start_test_server().await;

    // Plain HTTP without upgrade headers
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /ws?room_id=1&user_id=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut drained = Vec::new();
    let _ = timeout(Duration::from_secs(2), stream.read_to_end(&mut drained)).await;

    // Client that disconnects mid-handshake
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"GET /ws HTTP/1.1\r\nUpgr").await.unwrap();
    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = server.stats();
    assert_eq!(stats.rejected_connections, 0);
    assert_eq!(stats.total_connections, 0);
}

#[tokio::test]
async fn test_editor_change_relayed_to_room() {
    let (server, port) = start_test_server().await;
    let mut alice = join(&server, port, 7, 1).await;
    let mut bob = join(&server, port, 7, 2).await;
    let mut carol = join(&server, port, 7, 3).await;

    send(
        &mut alice,
        json!({
            "type": "editor",
            "data": {"content": "let x = 1;", "from": {"line": 0, "column": 0}, "to": {"line": 0, "column": 3}}
        }),
    )
    .await;

    for peer in [&mut bob, &mut carol] {
        let frame = recv(peer).await;
        assert_eq!(frame["type"], "editor");
        assert_eq!(frame["room_id"], 7);
        assert_eq!(frame["user_id"], 1);
        assert_eq!(frame["data"]["content"], "let x = 1;");
        assert_eq!(frame["data"]["to"]["column"], 3);
    }
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_claimed_identity_is_overwritten() {
    let (server, port) = start_test_server().await;
    let mut alice = join(&server, port, 7, 1).await;
    let mut bob = join(&server, port, 7, 2).await;

    send(
        &mut alice,
        json!({"room_id": 99, "user_id": 42, "type": "chat", "data": {"text": "hi"}}),
    )
    .await;

    let frame = recv(&mut bob).await;
    assert_eq!(frame["type"], "chat");
    assert_eq!(frame["room_id"], 7);
    assert_eq!(frame["user_id"], 1);
    assert_eq!(frame["data"], json!({"text": "hi"}));
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (server, port) = start_test_server().await;
    let mut alice = join(&server, port, 1, 1).await;
    let mut bob = join(&server, port, 1, 2).await;
    let mut eve = join(&server, port, 2, 3).await;

    send(&mut alice, json!({"type": "chat", "data": "room one only"})).await;

    assert_eq!(recv(&mut bob).await["data"], "room one only");
    assert_silent(&mut eve).await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (server, port) = start_test_server().await;
    let mut alice = join(&server, port, 7, 1).await;
    let mut bob = join(&server, port, 7, 2).await;

    alice.send(Message::text("{not json".to_string())).await.unwrap();
    send(&mut alice, json!({"type": "cursor-dance", "data": {}})).await;
    send(&mut alice, json!({"type": "chat", "data": "still here"})).await;

    assert_eq!(recv(&mut bob).await["data"], "still here");
}

#[tokio::test]
async fn test_voice_join_update_and_participants() {
    let (server, port) = start_test_server().await;
    let mut alice = join(&server, port, 7, 1).await;
    let mut bob = join(&server, port, 7, 2).await;

    send(&mut alice, json!({"type": "voice-join"})).await;
    let joined = recv(&mut bob).await;
    assert_eq!(joined["type"], "voice-user-joined");
    assert_eq!(joined["data"]["user_id"], 1);
    assert_eq!(joined["data"]["muted"], false);

    send(
        &mut alice,
        json!({"type": "voice-state-update", "data": {"muted": true, "audio_level": 0.5}}),
    )
    .await;
    let updated = recv(&mut bob).await;
    assert_eq!(updated["type"], "voice-state-updated");
    assert_eq!(updated["data"]["user_id"], 1);
    assert_eq!(updated["data"]["muted"], true);

    send(&mut bob, json!({"type": "voice-participants"})).await;
    let list = recv(&mut bob).await;
    assert_eq!(list["type"], "voice-participants-list");
    let participants = list["data"].as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["user_id"], 1);
    assert_eq!(participants[0]["muted"], true);

    // The reply goes only to the requester
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_voice_update_without_join_is_silent() {
    let (server, port) = start_test_server().await;
    let mut alice = join(&server, port, 7, 1).await;
    let mut bob = join(&server, port, 7, 2).await;

    send(&mut alice, json!({"type": "voice-state-update", "data": {"muted": true}})).await;
    send(&mut alice, json!({"type": "voice-leave"})).await;
    assert_silent(&mut bob).await;
    assert!(!server.router().voice().has_voice_chat(7).await);
}

#[tokio::test]
async fn test_disconnect_leaves_voice_and_room() {
    let (server, port) = start_test_server().await;
    let mut alice = join(&server, port, 7, 1).await;
    let mut bob = join(&server, port, 7, 2).await;

    send(&mut alice, json!({"type": "voice-join"})).await;
    assert_eq!(recv(&mut bob).await["type"], "voice-user-joined");

    alice.close(None).await.unwrap();

    let left = recv(&mut bob).await;
    assert_eq!(left["type"], "voice-user-left");
    assert_eq!(left["data"]["user_id"], 1);

    timeout(Duration::from_secs(2), async {
        while server.router().hub().room_members(7).await != vec![2] {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("alice should be unregistered");
    assert!(server.router().voice().participants(7).await.is_empty());
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let (server, port) = start_test_server().await;
    let mut first = join(&server, port, 7, 1).await;
    let mut bob = join(&server, port, 7, 2).await;

    let url = format!("ws://127.0.0.1:{port}/ws?room_id=7&user_id=1");
    let (mut second, _) = connect_async_ok(&url).await;

    // The replaced socket is closed by the server
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "Replaced connection should be closed");

    send(&mut bob, json!({"type": "chat", "data": "to the new socket"})).await;
    assert_eq!(recv(&mut second).await["data"], "to the new socket");
    assert_eq!(server.router().hub().room_members(7).await, vec![1, 2]);
}
