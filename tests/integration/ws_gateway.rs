//! WebSocket gateway tests over a live server.
//!
//! Covers: authentication gating, transfer-scoped event delivery to
//! subscribers, and the invisibility of those events to an
//! unauthenticated bystander.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use firma_sign_server::app;
use firma_sign_server::config::ServerConfig;
use firma_sign_server::events::Event;
use firma_sign_server::http::{self, AppState};
use firma_sign_server::ws::auth::issue_token;

const SECRET: &str = "integration-test-secret";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestApp {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    ws_url: String,
    _server: tokio::task::JoinHandle<()>,
}

async fn start_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        storage_path: dir.path().to_path_buf(),
        db_path: dir.path().join("firma-sign.db"),
        jwt_secret: SECRET.to_string(),
        ..ServerConfig::default()
    };
    let state = app::bootstrap_default(&config).unwrap();
    let (addr, server) = http::start_server("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    TestApp {
        _dir: dir,
        state,
        ws_url: format!("ws://{addr}/ws"),
        _server: server,
    }
}

async fn connect(app: &TestApp) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(&app.ws_url).await.unwrap();
    ws
}

async fn ws_send(ws: &mut WsStream, frame: &serde_json::Value) {
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn ws_recv(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("websocket receive timed out")
            .unwrap()
            .unwrap();
        if let tungstenite::Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            // Keep-alive pings may interleave with real frames.
            if value["type"] != "ping" {
                return value;
            }
        }
    }
}

async fn authenticate(ws: &mut WsStream, user: &str) {
    let token = issue_token(SECRET, user, None, 60).unwrap();
    ws_send(ws, &serde_json::json!({ "type": "auth", "token": token })).await;
    let reply = ws_recv(ws).await;
    assert_eq!(reply["type"], "auth_result");
    assert_eq!(reply["success"], true);
}

/// Pre-auth subscriptions are refused.
#[tokio::test]
async fn subscribe_requires_authentication() {
    let app = start_app().await;
    let mut ws = connect(&app).await;

    ws_send(
        &mut ws,
        &serde_json::json!({ "type": "subscribe", "transferId": "t1" }),
    )
    .await;
    let reply = ws_recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"], "Not authenticated");
}

/// A bad token fails authentication and leaves the client gated.
#[tokio::test]
async fn invalid_token_is_rejected() {
    let app = start_app().await;
    let mut ws = connect(&app).await;

    ws_send(
        &mut ws,
        &serde_json::json!({ "type": "auth", "token": "garbage" }),
    )
    .await;
    let reply = ws_recv(&mut ws).await;
    assert_eq!(reply["type"], "auth_result");
    assert_eq!(reply["success"], false);

    ws_send(
        &mut ws,
        &serde_json::json!({ "type": "subscribe", "transferId": "t1" }),
    )
    .await;
    let reply = ws_recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
}

/// Scenario: a subscriber receives transfer events with the full frame
/// shape; an unauthenticated bystander receives nothing.
#[tokio::test]
async fn transfer_subscription_delivers_scoped_events() {
    let app = start_app().await;

    let mut subscriber = connect(&app).await;
    authenticate(&mut subscriber, "user-1").await;
    ws_send(
        &mut subscriber,
        &serde_json::json!({ "type": "subscribe", "transferId": "transfer-42-aa" }),
    )
    .await;
    let reply = ws_recv(&mut subscriber).await;
    assert_eq!(reply["type"], "subscribed");
    assert_eq!(reply["transferId"], "transfer-42-aa");

    let mut bystander = connect(&app).await;

    app.state.bus.publish(&Event::TransferUpdated {
        transfer_id: "transfer-42-aa".into(),
        status: "ready".into(),
    });

    let event = ws_recv(&mut subscriber).await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "transfer:update");
    assert_eq!(event["transferId"], "transfer-42-aa");
    assert_eq!(event["data"]["status"], "ready");
    assert!(event["timestamp"].as_u64().is_some());

    // The bystander never authenticated and gets nothing.
    let nothing = tokio::time::timeout(Duration::from_millis(300), bystander.next()).await;
    assert!(nothing.is_err(), "unauthenticated client received a frame");
}

/// Events for other transfers do not leak into the subscription.
#[tokio::test]
async fn unrelated_transfers_are_filtered() {
    let app = start_app().await;

    let mut subscriber = connect(&app).await;
    authenticate(&mut subscriber, "user-1").await;
    ws_send(
        &mut subscriber,
        &serde_json::json!({ "type": "subscribe", "transferId": "transfer-1-aa" }),
    )
    .await;
    let _ = ws_recv(&mut subscriber).await;

    app.state.bus.publish(&Event::TransferUpdated {
        transfer_id: "transfer-2-bb".into(),
        status: "ready".into(),
    });
    app.state.bus.publish(&Event::TransferUpdated {
        transfer_id: "transfer-1-aa".into(),
        status: "ready".into(),
    });

    // Only the subscribed transfer's event arrives.
    let event = ws_recv(&mut subscriber).await;
    assert_eq!(event["transferId"], "transfer-1-aa");
}

/// After unsubscribing, events stop.
#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let app = start_app().await;

    let mut ws = connect(&app).await;
    authenticate(&mut ws, "user-1").await;
    ws_send(
        &mut ws,
        &serde_json::json!({ "type": "subscribe", "transferId": "t1" }),
    )
    .await;
    let _ = ws_recv(&mut ws).await;
    ws_send(
        &mut ws,
        &serde_json::json!({ "type": "unsubscribe", "transferId": "t1" }),
    )
    .await;
    let reply = ws_recv(&mut ws).await;
    assert_eq!(reply["type"], "unsubscribed");

    app.state.bus.publish(&Event::TransferUpdated {
        transfer_id: "t1".into(),
        status: "ready".into(),
    });
    let nothing = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(nothing.is_err(), "unsubscribed client received a frame");
}

/// The `message` frame persists through the message service and echoes
/// an acknowledgment.
#[tokio::test]
async fn message_frame_round_trips() {
    let app = start_app().await;

    let mut ws = connect(&app).await;
    authenticate(&mut ws, "user-1").await;
    ws_send(
        &mut ws,
        &serde_json::json!({ "type": "message", "peerId": "bob", "content": "hello" }),
    )
    .await;
    let reply = ws_recv(&mut ws).await;
    assert_eq!(reply["type"], "message_sent");
    assert_eq!(reply["peerId"], "bob");
    assert_eq!(reply["status"], "sent");

    use firma_sign_proto::ids::PeerId;
    assert_eq!(
        app.state.messages.unread_count(&PeerId::new("bob")).unwrap(),
        1
    );
}
