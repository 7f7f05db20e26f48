//! Integration tests for the session lifecycle: in-band authentication,
//! conversation join/replay, message fan-out, notifications, presence edges,
//! and typing relay.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use courier_server::presence::typing::TypingRegistry;
use courier_server::presence::PresenceTable;
use courier_server::state::AppState;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Start the server on a random port and return (base_url, addr).
async fn start_test_server() -> (String, SocketAddr) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = courier_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = courier_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = AppState {
        db,
        jwt_secret,
        presence: Arc::new(PresenceTable::new()),
        typing: Arc::new(TypingRegistry::new()),
        history_cap: 1000,
        auth_timeout: Duration::from_secs(2),
    };

    let app = courier_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    (format!("http://{}", addr), addr)
}

/// Register an identity and return its access token.
async fn register_identity(base_url: &str, id: &str, display_name: &str) -> String {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/register", base_url))
        .json(&json!({ "id": id, "display_name": display_name }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 201, "registration failed for {}", id);
    let body: Value = resp.json().await.unwrap();
    body["access_token"].as_str().unwrap().to_string()
}

async fn connect(addr: &SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to WebSocket");
    ws
}

async fn send_frame(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Next JSON event from the stream, skipping control frames.
/// None on timeout or stream end.
async fn next_event(ws: &mut WsStream) -> Option<Value> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(text.as_str()).expect("valid event JSON"))
            }
            Ok(Some(Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => return None,
        }
    }
}

/// Read events until one of the wanted type arrives; unrelated event types
/// (e.g. presence updates racing a welcome) are skipped.
async fn wait_for_event(ws: &mut WsStream, event_type: &str) -> Value {
    for _ in 0..16 {
        match next_event(ws).await {
            Some(event) => {
                if event["type"] == event_type {
                    return event;
                }
            }
            None => break,
        }
    }
    panic!("did not receive {event_type} event");
}

/// Assert that no event of the given type arrives within a short window.
async fn assert_no_event(ws: &mut WsStream, forbidden: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let event: Value = serde_json::from_str(text.as_str()).unwrap();
                assert_ne!(
                    event["type"], forbidden,
                    "unexpected {forbidden} event: {event}"
                );
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return,
            Err(_) => return,
        }
    }
}

/// Connect and authenticate, returning the stream after its welcome event.
async fn connected_session(addr: &SocketAddr, token: &str) -> WsStream {
    let mut ws = connect(addr).await;
    send_frame(&mut ws, json!({ "type": "authenticate", "token": token })).await;
    wait_for_event(&mut ws, "welcome").await;
    ws
}

#[tokio::test]
async fn authenticate_receives_welcome_with_directory() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;
    register_identity(&base_url, "bob", "Bob").await;

    let mut ws = connect(&addr).await;
    send_frame(&mut ws, json!({ "type": "authenticate", "token": alice_token })).await;

    let welcome = wait_for_event(&mut ws, "welcome").await;
    assert_eq!(welcome["identity"]["id"], "alice");

    let directory = welcome["directory"].as_array().unwrap();
    assert_eq!(directory.len(), 1);
    assert_eq!(directory[0]["id"], "bob");
    assert_eq!(directory[0]["display_name"], "Bob");
    assert_eq!(directory[0]["online"], false);
}

#[tokio::test]
async fn invalid_token_is_reported_and_retry_succeeds() {
    let (base_url, addr) = start_test_server().await;
    let token = register_identity(&base_url, "alice", "Alice").await;

    let mut ws = connect(&addr).await;
    send_frame(&mut ws, json!({ "type": "authenticate", "token": "garbage" })).await;

    let err = wait_for_event(&mut ws, "error").await;
    assert_eq!(err["code"], "invalid_token");

    // The connection did not transition; a second attempt may succeed.
    send_frame(&mut ws, json!({ "type": "authenticate", "token": token })).await;
    let welcome = wait_for_event(&mut ws, "welcome").await;
    assert_eq!(welcome["identity"]["id"], "alice");
}

#[tokio::test]
async fn frames_before_authentication_are_rejected() {
    let (base_url, addr) = start_test_server().await;
    let token = register_identity(&base_url, "alice", "Alice").await;

    let mut ws = connect(&addr).await;
    send_frame(&mut ws, json!({ "type": "join", "peer_id": "bob" })).await;

    let err = wait_for_event(&mut ws, "error").await;
    assert_eq!(err["code"], "not_authenticated");

    send_frame(&mut ws, json!({ "type": "authenticate", "token": token })).await;
    wait_for_event(&mut ws, "welcome").await;
}

#[tokio::test]
async fn unauthenticated_connection_is_closed_after_the_window() {
    let (_base_url, addr) = start_test_server().await;
    let mut ws = connect(&addr).await;

    // Auth window in the test server is 2 seconds.
    match tokio::time::timeout(Duration::from_secs(4), ws.next()).await {
        Ok(Some(Ok(Message::Close(Some(frame))))) => {
            assert_eq!(u16::from(frame.code), 4001);
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn message_reaches_unjoined_recipient_as_notification_then_history() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;
    let bob_token = register_identity(&base_url, "bob", "Bob").await;

    let mut alice = connected_session(&addr, &alice_token).await;
    let mut bob = connected_session(&addr, &bob_token).await;

    // Alice joins the conversation with Bob and sees empty history.
    send_frame(&mut alice, json!({ "type": "join", "peer_id": "bob" })).await;
    let history = wait_for_event(&mut alice, "history").await;
    assert_eq!(history["conversation_id"], "dm:alice:bob");
    assert!(history["messages"].as_array().unwrap().is_empty());

    send_frame(
        &mut alice,
        json!({ "type": "send", "recipient_id": "bob", "body": "hi" }),
    )
    .await;

    // Alice's own session sees the committed message.
    let echoed = wait_for_event(&mut alice, "message").await;
    assert_eq!(echoed["message"]["body"], "hi");
    assert_eq!(echoed["message"]["sender_id"], "alice");

    // Bob has not joined the conversation: he gets the message event for
    // multi-tab consistency plus an out-of-band notification.
    let delivered = wait_for_event(&mut bob, "message").await;
    assert_eq!(delivered["message"]["body"], "hi");

    let notification = wait_for_event(&mut bob, "notification").await;
    assert_eq!(notification["sender_id"], "alice");
    assert_eq!(notification["sender_name"], "Alice");
    assert_eq!(notification["preview"], "hi");

    // On joining later, the history replays the committed message.
    send_frame(&mut bob, json!({ "type": "join", "peer_id": "alice" })).await;
    let history = wait_for_event(&mut bob, "history").await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["sender_id"], "alice");
    assert_eq!(messages[0]["body"], "hi");
}

#[tokio::test]
async fn joined_recipient_gets_no_notification() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;
    let bob_token = register_identity(&base_url, "bob", "Bob").await;

    let mut alice = connected_session(&addr, &alice_token).await;
    let mut bob = connected_session(&addr, &bob_token).await;

    send_frame(&mut bob, json!({ "type": "join", "peer_id": "alice" })).await;
    wait_for_event(&mut bob, "history").await;

    send_frame(
        &mut alice,
        json!({ "type": "send", "recipient_id": "bob", "body": "you there?" }),
    )
    .await;

    let delivered = wait_for_event(&mut bob, "message").await;
    assert_eq!(delivered["message"]["body"], "you there?");
    assert_no_event(&mut bob, "notification").await;
}

#[tokio::test]
async fn both_tabs_of_the_recipient_get_the_message_once() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;
    let bob_token = register_identity(&base_url, "bob", "Bob").await;

    let mut tab1 = connected_session(&addr, &alice_token).await;
    let mut tab2 = connected_session(&addr, &alice_token).await;
    let mut bob = connected_session(&addr, &bob_token).await;

    send_frame(
        &mut bob,
        json!({ "type": "send", "recipient_id": "alice", "body": "ping" }),
    )
    .await;

    for tab in [&mut tab1, &mut tab2] {
        let delivered = wait_for_event(tab, "message").await;
        assert_eq!(delivered["message"]["body"], "ping");
        // Exactly once per session.
        assert_no_event(tab, "message").await;
    }
}

#[tokio::test]
async fn presence_events_fire_only_on_edges() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;
    let bob_token = register_identity(&base_url, "bob", "Bob").await;

    let mut alice = connected_session(&addr, &alice_token).await;

    // First session: online edge.
    let mut bob_tab1 = connected_session(&addr, &bob_token).await;
    let online = wait_for_event(&mut alice, "presence").await;
    assert_eq!(online["identity_id"], "bob");
    assert_eq!(online["online"], true);

    // Second session: no new edge.
    let mut bob_tab2 = connected_session(&addr, &bob_token).await;
    assert_no_event(&mut alice, "presence").await;

    // Closing one of two sessions: still online, no edge.
    bob_tab2.close(None).await.unwrap();
    assert_no_event(&mut alice, "presence").await;

    // Closing the last session: offline edge, exactly once.
    bob_tab1.close(None).await.unwrap();
    let offline = wait_for_event(&mut alice, "presence").await;
    assert_eq!(offline["identity_id"], "bob");
    assert_eq!(offline["online"], false);
    assert_no_event(&mut alice, "presence").await;
}

#[tokio::test]
async fn empty_message_is_rejected_and_not_delivered() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;
    let bob_token = register_identity(&base_url, "bob", "Bob").await;

    let mut alice = connected_session(&addr, &alice_token).await;
    let mut bob = connected_session(&addr, &bob_token).await;

    send_frame(
        &mut alice,
        json!({ "type": "send", "recipient_id": "bob", "body": "   " }),
    )
    .await;

    let err = wait_for_event(&mut alice, "error").await;
    assert_eq!(err["code"], "empty_message");

    assert_no_event(&mut bob, "message").await;
    assert_no_event(&mut bob, "notification").await;
}

#[tokio::test]
async fn unknown_recipient_is_reported_to_the_sender_only() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;

    let mut alice = connected_session(&addr, &alice_token).await;

    send_frame(
        &mut alice,
        json!({ "type": "send", "recipient_id": "ghost", "body": "anyone home?" }),
    )
    .await;
    let err = wait_for_event(&mut alice, "error").await;
    assert_eq!(err["code"], "unknown_recipient");

    send_frame(&mut alice, json!({ "type": "join", "peer_id": "ghost" })).await;
    let err = wait_for_event(&mut alice, "error").await;
    assert_eq!(err["code"], "unknown_recipient");
}

#[tokio::test]
async fn typing_flag_reaches_the_peer_but_not_the_sender() {
    let (base_url, addr) = start_test_server().await;
    let alice_token = register_identity(&base_url, "alice", "Alice").await;
    let bob_token = register_identity(&base_url, "bob", "Bob").await;

    let mut alice = connected_session(&addr, &alice_token).await;
    let mut bob = connected_session(&addr, &bob_token).await;

    send_frame(
        &mut alice,
        json!({ "type": "typing", "recipient_id": "bob", "is_typing": true }),
    )
    .await;

    let typing = wait_for_event(&mut bob, "typing").await;
    assert_eq!(typing["conversation_id"], "dm:alice:bob");
    assert_eq!(typing["identity_id"], "alice");
    assert_eq!(typing["is_typing"], true);

    assert_no_event(&mut alice, "typing").await;

    send_frame(
        &mut alice,
        json!({ "type": "typing", "recipient_id": "bob", "is_typing": false }),
    )
    .await;
    let stopped = wait_for_event(&mut bob, "typing").await;
    assert_eq!(stopped["is_typing"], false);
}
