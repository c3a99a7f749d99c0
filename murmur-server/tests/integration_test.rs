//! Integration tests for the Murmur WebSocket server
//!
//! These tests spin up a real server and connect clients to verify
//! history, live delivery and delete propagation work end to end.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use murmur_server::blobs::LocalBlobStore;
use murmur_server::{MessageStore, ServerState};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a test server on a random available port
async fn start_test_server(
    configure: impl FnOnce(ServerState) -> ServerState,
) -> (u16, tokio::task::JoinHandle<()>, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(LocalBlobStore::new(dir.path(), "/blobs").unwrap());
    let store = MessageStore::in_memory(blobs).unwrap();
    let state = Arc::new(configure(ServerState::new(store)));

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();
            let state = state.clone();
            tokio::spawn(async move {
                murmur_server::handle_connection(ws_stream, state).await;
            });
        }
    });

    (port, handle, dir)
}

async fn open(port: u16) -> Client {
    let url = format!("ws://127.0.0.1:{}", port);
    let (ws_stream, _) = connect_async(&url).await.expect("Failed to connect");
    ws_stream
}

async fn send(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Stream closed")
            .expect("Read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Receive frames until one of the given type shows up
async fn recv_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let frame = recv(client).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Connect a client to the server and authenticate
async fn connect_client(port: u16, user_id: &str) -> Client {
    let mut client = open(port).await;
    send(&mut client, json!({"type": "connect", "user_id": user_id})).await;

    let response = recv(&mut client).await;
    assert_eq!(response["type"], "auth_response");
    assert_eq!(response["success"], true);
    client
}

async fn subscribe(client: &mut Client, with: &str) {
    send(
        client,
        json!({"type": "subscribe", "conversation": {"kind": "direct", "user_id": with}}),
    )
    .await;
    let ack = recv_type(client, "subscribed").await;
    assert_eq!(ack["key"]["kind"], "direct");
}

#[tokio::test]
async fn test_client_connects_and_authenticates() {
    let (port, server_handle, _dir) = start_test_server(|s| s).await;

    let _client = connect_client(port, "alice").await;

    server_handle.abort();
}

#[tokio::test]
async fn test_wrong_token_is_refused() {
    let (port, server_handle, _dir) = start_test_server(|s| s.with_access_token("secret")).await;

    let mut client = open(port).await;
    send(
        &mut client,
        json!({"type": "connect", "user_id": "alice", "token": "guess"}),
    )
    .await;
    let response = recv(&mut client).await;
    assert_eq!(response["type"], "auth_response");
    assert_eq!(response["success"], false);

    let mut client = open(port).await;
    send(
        &mut client,
        json!({"type": "connect", "user_id": "alice", "token": "secret"}),
    )
    .await;
    assert_eq!(recv(&mut client).await["success"], true);

    server_handle.abort();
}

#[tokio::test]
async fn test_auth_timeout_closes_connection() {
    let (port, server_handle, _dir) =
        start_test_server(|s| s.with_auth_timeout(Duration::from_millis(100))).await;

    let mut client = open(port).await;
    let response = recv(&mut client).await;
    assert_eq!(response["type"], "auth_response");
    assert_eq!(response["success"], false);

    server_handle.abort();
}

#[tokio::test]
async fn test_send_reaches_subscribed_peer() {
    let (port, server_handle, _dir) = start_test_server(|s| s).await;

    let mut alice = connect_client(port, "alice").await;
    let mut bob = connect_client(port, "bob").await;
    subscribe(&mut bob, "alice").await;

    send(
        &mut alice,
        json!({"type": "send", "message": {"receiver_id": "bob", "text": "hi"}}),
    )
    .await;
    let sent = recv_type(&mut alice, "sent").await;
    assert_eq!(sent["message"]["sender_id"], "alice");

    let event = recv_type(&mut bob, "message_created").await;
    assert_eq!(event["message"]["text"], "hi");
    assert_eq!(event["message"]["id"], sent["message"]["id"]);
    assert_eq!(event["key"]["participants"], json!(["alice", "bob"]));

    // History from either side holds the one message
    send(
        &mut bob,
        json!({"type": "history", "conversation": {"kind": "direct", "user_id": "alice"}}),
    )
    .await;
    let history = recv_type(&mut bob, "history").await;
    assert_eq!(history["messages"].as_array().unwrap().len(), 1);
    assert_eq!(history["messages"][0]["text"], "hi");

    server_handle.abort();
}

#[tokio::test]
async fn test_delete_propagates_and_repeat_fails() {
    let (port, server_handle, _dir) = start_test_server(|s| s).await;

    let mut alice = connect_client(port, "alice").await;
    let mut bob = connect_client(port, "bob").await;
    subscribe(&mut bob, "alice").await;

    send(
        &mut alice,
        json!({"type": "send", "message": {"receiver_id": "bob", "text": "oops"}}),
    )
    .await;
    let id = recv_type(&mut alice, "sent").await["message"]["id"].clone();
    recv_type(&mut bob, "message_created").await;

    // Bob cannot delete Alice's message
    send(&mut bob, json!({"type": "delete", "message_id": id})).await;
    let failed = recv_type(&mut bob, "delete_failed").await;
    assert_eq!(failed["code"], "forbidden");

    send(&mut alice, json!({"type": "delete", "message_id": id})).await;
    assert_eq!(recv_type(&mut alice, "deleted").await["message_id"], id);
    assert_eq!(recv_type(&mut bob, "message_deleted").await["message_id"], id);

    send(&mut alice, json!({"type": "delete", "message_id": id})).await;
    assert_eq!(recv_type(&mut alice, "delete_failed").await["code"], "not_found");

    server_handle.abort();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (port, server_handle, _dir) = start_test_server(|s| s).await;

    let mut alice = connect_client(port, "alice").await;
    let mut bob = connect_client(port, "bob").await;
    subscribe(&mut bob, "alice").await;

    send(
        &mut bob,
        json!({"type": "unsubscribe", "conversation": {"kind": "direct", "user_id": "alice"}}),
    )
    .await;
    recv_type(&mut bob, "unsubscribed").await;

    send(
        &mut alice,
        json!({"type": "send", "message": {"receiver_id": "bob", "text": "anyone?"}}),
    )
    .await;
    recv_type(&mut alice, "sent").await;

    let nothing = timeout(Duration::from_millis(200), bob.next()).await;
    assert!(nothing.is_err(), "Bob should not receive events after unsubscribing");

    server_handle.abort();
}

#[tokio::test]
async fn test_group_conversation_fans_out() {
    let (port, server_handle, _dir) = start_test_server(|s| s).await;

    let mut alice = connect_client(port, "alice").await;
    let mut bob = connect_client(port, "bob").await;
    let mut carol = connect_client(port, "carol").await;
    for client in [&mut bob, &mut carol] {
        send(
            client,
            json!({"type": "subscribe", "conversation": {"kind": "group", "group_id": "g1"}}),
        )
        .await;
        recv_type(client, "subscribed").await;
    }

    send(
        &mut alice,
        json!({"type": "send", "message": {"group_id": "g1", "text": "hello all"}}),
    )
    .await;

    for client in [&mut bob, &mut carol] {
        let event = recv_type(client, "message_created").await;
        assert_eq!(event["key"]["group_id"], "g1");
        assert_eq!(event["message"]["text"], "hello all");
    }

    server_handle.abort();
}

#[tokio::test]
async fn test_invalid_send_reports_validation_error() {
    let (port, server_handle, _dir) = start_test_server(|s| s).await;

    let mut alice = connect_client(port, "alice").await;
    send(
        &mut alice,
        json!({"type": "send", "message": {"text": "nowhere to go"}}),
    )
    .await;
    let error = recv_type(&mut alice, "error").await;
    assert_eq!(error["code"], "validation");

    send(&mut alice, json!({"type": "bogus"})).await;
    assert_eq!(recv_type(&mut alice, "error").await["code"], "protocol");

    server_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attachment_send_on_multi_thread_runtime() {
    let (port, server_handle, dir) = start_test_server(|s| s).await;

    let mut alice = connect_client(port, "alice").await;
    let mut bob = connect_client(port, "bob").await;
    subscribe(&mut bob, "alice").await;

    send(
        &mut alice,
        json!({"type": "send", "message": {"receiver_id": "bob", "image": {"data": "aGVsbG8="}}}),
    )
    .await;
    let sent = recv_type(&mut alice, "sent").await;
    let url = sent["message"]["image"].as_str().unwrap().to_string();
    assert!(url.starts_with("/blobs/"));

    let event = recv_type(&mut bob, "message_created").await;
    assert_eq!(event["message"]["image"], url.as_str());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

    // Frames on one connection are still handled in arrival order
    send(
        &mut bob,
        json!({"type": "history", "conversation": {"kind": "direct", "user_id": "alice"}}),
    )
    .await;
    send(
        &mut bob,
        json!({"type": "unsubscribe", "conversation": {"kind": "direct", "user_id": "alice"}}),
    )
    .await;
    let first = recv(&mut bob).await;
    assert_eq!(first["type"], "history");
    assert_eq!(recv(&mut bob).await["type"], "unsubscribed");

    server_handle.abort();
}
