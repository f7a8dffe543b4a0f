//! Message journal tests over the HTTP API.
//!
//! Covers the delivery state machine (sent, then delivered on the
//! transport ack tick), read-marking idempotence, history pagination,
//! and unread counts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use firma_sign_proto::ids::PeerId;
use firma_sign_server::app;
use firma_sign_server::config::ServerConfig;
use firma_sign_server::http::{self, AppState};
use firma_sign_server::services::messages::SendMessageOptions;

struct TestApp {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    base_url: String,
    _server: tokio::task::JoinHandle<()>,
}

async fn start_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        storage_path: dir.path().to_path_buf(),
        db_path: dir.path().join("firma-sign.db"),
        jwt_secret: "integration-test-secret".to_string(),
        ..ServerConfig::default()
    };
    let state = app::bootstrap_default(&config).unwrap();
    let (addr, server) = http::start_server("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    TestApp {
        _dir: dir,
        state,
        base_url: format!("http://{addr}"),
        _server: server,
    }
}

/// Scenario: send, observe the delivery tick, mark read once
/// effectively and once as a no-op, then see a zero unread count.
#[tokio::test]
async fn message_read_idempotence() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    // Bob writes to us so the message is addressed to the local peer.
    let receipt = app
        .state
        .messages
        .send_from(
            &PeerId::new("bob"),
            &PeerId::new("self"),
            SendMessageOptions::text("hi"),
        )
        .unwrap();
    assert_eq!(receipt.status, "sent");

    // The synthetic transport ack flips it to delivered.
    let mut status = String::new();
    for _ in 0..50 {
        let history: serde_json::Value = client
            .get(format!("{}/api/peers/bob/messages", app.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        status = history["messages"][0]["status"].as_str().unwrap().to_string();
        if status == "delivered" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "delivered");

    // First read marks one message.
    let first: serde_json::Value = client
        .post(format!("{}/api/peers/bob/messages/read", app.base_url))
        .json(&json!({ "messageIds": [receipt.message_id] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["updated"], 1);

    // Repeating has zero effect.
    let second: serde_json::Value = client
        .post(format!("{}/api/peers/bob/messages/read", app.base_url))
        .json(&json!({ "messageIds": [receipt.message_id] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["updated"], 0);

    assert_eq!(
        app.state
            .messages
            .unread_count(&PeerId::new("self"))
            .unwrap(),
        0
    );
}

/// History pages newest-first with `hasMore` computed past the limit.
#[tokio::test]
async fn history_pagination() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    for i in 0..5 {
        let response = client
            .post(format!("{}/api/peers/bob/messages", app.base_url))
            .json(&json!({ "content": format!("message {i}") }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let page: serde_json::Value = client
        .get(format!("{}/api/peers/bob/messages?limit=3", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(page["hasMore"], true);
    // Newest first.
    assert_eq!(messages[0]["content"], "message 4");

    // readAll marks everything Bob sent us; here all traffic is ours,
    // so nothing updates.
    let read: serde_json::Value = client
        .post(format!("{}/api/peers/bob/messages/read", app.base_url))
        .json(&json!({ "readAll": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["updated"], 0);
}

/// Empty message bodies are rejected with the error envelope.
#[tokio::test]
async fn empty_message_is_invalid() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/peers/bob/messages", app.base_url))
        .json(&json!({ "content": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

/// `readAll` marks the full unread backlog from one peer only.
#[tokio::test]
async fn read_all_scopes_to_one_peer() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    for peer in ["bob", "bob", "carol"] {
        app.state
            .messages
            .send_from(
                &PeerId::new(peer),
                &PeerId::new("self"),
                SendMessageOptions::text("ping"),
            )
            .unwrap();
    }

    let read: serde_json::Value = client
        .post(format!("{}/api/peers/bob/messages/read", app.base_url))
        .json(&json!({ "readAll": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["updated"], 2);

    // Carol's message stays unread.
    assert_eq!(
        app.state
            .messages
            .unread_count(&PeerId::new("self"))
            .unwrap(),
        1
    );
}
