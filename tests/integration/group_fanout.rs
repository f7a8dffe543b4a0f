//! Group fan-out tests over the HTTP API.
//!
//! Covers: group creation with roles, message fan-out excluding the
//! sender, membership management with the owner-safety invariant, and
//! document fan-out producing one transfer per member.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use firma_sign_proto::ids::PeerId;
use firma_sign_server::app;
use firma_sign_server::config::ServerConfig;
use firma_sign_server::http::{self, AppState};

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
    state
        .registry
        .initialize(&["web".to_string()], &HashMap::new())
        .await;
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

async fn create_group(app: &TestApp, client: &reqwest::Client) -> String {
    let response = client
        .post(format!("{}/api/groups", app.base_url))
        .json(&json!({
            "name": "Signing Team",
            "ownerId": "peerA",
            "members": [
                { "peerId": "peerB", "role": "member" },
                { "peerId": "peerC", "role": "member" },
            ],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    body["groupId"].as_str().unwrap().to_string()
}

/// Scenario: a three-member group fans a message out to exactly the
/// two non-sender members; nothing lands addressed to the sender.
#[tokio::test]
async fn message_fanout_excludes_sender() {
    let app = start_app().await;
    let client = reqwest::Client::new();
    let group_id = create_group(&app, &client).await;

    let response = client
        .post(format!("{}/api/groups/{group_id}/send", app.base_url))
        .json(&json!({
            "type": "message",
            "message": "hello",
            "senderId": "peerA",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();

    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    for result in results {
        assert_eq!(result["status"], "sent");
        assert_ne!(result["peerId"], "peerA");
    }

    // No message is recorded with the sender as recipient.
    assert_eq!(
        app.state
            .messages
            .unread_count(&PeerId::new("peerA"))
            .unwrap(),
        0
    );
    assert_eq!(
        app.state
            .messages
            .unread_count(&PeerId::new("peerB"))
            .unwrap(),
        1
    );
    assert_eq!(
        app.state
            .messages
            .unread_count(&PeerId::new("peerC"))
            .unwrap(),
        1
    );
}

/// Exclusions shrink the fan-out further.
#[tokio::test]
async fn fanout_honors_exclusions() {
    let app = start_app().await;
    let client = reqwest::Client::new();
    let group_id = create_group(&app, &client).await;

    let body: serde_json::Value = client
        .post(format!("{}/api/groups/{group_id}/send", app.base_url))
        .json(&json!({
            "type": "message",
            "message": "partial",
            "senderId": "peerA",
            "excludeMembers": ["peerC"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["peerId"], "peerB");
}

/// The owner lands as an admin member and cannot be removed.
#[tokio::test]
async fn owner_is_admin_and_protected() {
    let app = start_app().await;
    let client = reqwest::Client::new();
    let group_id = create_group(&app, &client).await;

    let members: serde_json::Value = client
        .get(format!("{}/api/groups/{group_id}/members", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let owner = members["members"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["peerId"] == "peerA")
        .unwrap();
    assert_eq!(owner["role"], "admin");

    let response = client
        .delete(format!(
            "{}/api/groups/{group_id}/members/peerA",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "CONFLICT");
}

/// Membership changes flow through add and remove.
#[tokio::test]
async fn membership_management() {
    let app = start_app().await;
    let client = reqwest::Client::new();
    let group_id = create_group(&app, &client).await;

    let response = client
        .post(format!("{}/api/groups/{group_id}/members", app.base_url))
        .json(&json!({ "peerId": "peerD", "role": "member" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .delete(format!(
            "{}/api/groups/{group_id}/members/peerD",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let members: serde_json::Value = client
        .get(format!("{}/api/groups/{group_id}/members", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(members["members"].as_array().unwrap().len(), 3);
}

/// Document fan-out creates one transfer per non-sender member.
#[tokio::test]
async fn document_fanout_creates_transfers() {
    let app = start_app().await;
    let client = reqwest::Client::new();
    let group_id = create_group(&app, &client).await;

    let body: serde_json::Value = client
        .post(format!("{}/api/groups/{group_id}/send", app.base_url))
        .json(&json!({
            "type": "documents",
            "documents": [{ "fileName": "contract.pdf", "data": BASE64.encode(b"bytes") }],
            "transport": "web",
            "senderId": "peerA",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r["status"] == "sent"));

    let transfers: serde_json::Value = client
        .get(format!("{}/api/transfers?type=outgoing", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let transfers = transfers["transfers"].as_array().unwrap();
    assert_eq!(transfers.len(), 2);

    // Each transfer was dispatched: the recipient is notified and the
    // transfer advanced to ready.
    for transfer in transfers {
        let id = transfer["transferId"].as_str().unwrap();
        let detail: serde_json::Value = client
            .get(format!("{}/api/transfers/{id}", app.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detail["status"], "ready");
        assert_eq!(detail["recipients"][0]["status"], "notified");
    }
}

/// Unknown groups return the error envelope with a 404.
#[tokio::test]
async fn missing_group_returns_not_found() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{}/api/groups/00000000-0000-7000-8000-000000000000",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "GROUP_NOT_FOUND");
}
