//! End-to-end transfer lifecycle tests over the HTTP API.
//!
//! Covers: create-and-list with a code from the transfer alphabet,
//! dispatch to a recipient over a registered transport, document
//! download round-trip, and the sign-and-return flow that produces a
//! reciprocal outgoing transfer back to the original sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tokio::sync::mpsc;

use firma_sign_proto::code::ALPHABET;
use firma_sign_proto::ids::{DocumentId, TransferId};
use firma_sign_proto::transfer::{Envelope, EnvelopeDocument, SenderInfo, TransferMetadata};
use firma_sign_server::app;
use firma_sign_server::config::ServerConfig;
use firma_sign_server::http::{self, AppState};
use firma_sign_server::transport::channel::ChannelTransport;

const SECRET: &str = "integration-test-secret";

struct TestApp {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    base_url: String,
    email_outbox: mpsc::UnboundedReceiver<Envelope>,
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

    let (email, email_outbox) = ChannelTransport::create("email");
    state
        .registry
        .register(email as Arc<dyn firma_sign_server::transport::Transport>);
    state
        .registry
        .initialize(
            &["email".to_string(), "web".to_string()],
            &HashMap::new(),
        )
        .await;

    let (addr, server) = http::start_server("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    TestApp {
        _dir: dir,
        state,
        base_url: format!("http://{addr}"),
        email_outbox,
        _server: server,
    }
}

fn create_body() -> serde_json::Value {
    json!({
        "documents": [{
            "fileName": "a.pdf",
            "data": BASE64.encode(b"0123456789abcdef0123456789abcdef"),
        }],
        "recipients": [{
            "identifier": "bob@x",
            "transport": "email",
        }],
    })
}

/// Scenario: create one transfer, get a 6-char code, find it in the
/// list.
#[tokio::test]
async fn create_and_list() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/transfers/create", app.base_url))
        .json(&create_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();

    let transfer_id = body["transferId"].as_str().unwrap();
    assert!(transfer_id.starts_with("transfer-"));
    assert_eq!(body["status"], "created");

    let code = body["code"].as_str().unwrap();
    assert_eq!(code.len(), 6);
    for c in code.chars() {
        assert!(ALPHABET.contains(&(c as u8)), "code char {c:?} outside alphabet");
    }

    let list: serde_json::Value = client
        .get(format!("{}/api/transfers", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = list["transfers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["transferId"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&transfer_id));
}

/// Dispatch delivers the envelope to the recipient's transport and the
/// transfer advances to ready.
#[tokio::test]
async fn dispatch_reaches_transport_and_marks_ready() {
    let mut app = start_app().await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(format!("{}/api/transfers/create", app.base_url))
        .json(&create_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let transfer_id = body["transferId"].as_str().unwrap().to_string();

    let envelope = tokio::time::timeout(Duration::from_secs(5), app.email_outbox.recv())
        .await
        .expect("dispatch timed out")
        .unwrap();
    assert_eq!(envelope.to, "bob@x");
    assert_eq!(envelope.transfer_id.to_string(), transfer_id);
    assert_eq!(envelope.documents.len(), 1);

    // The status flip follows the envelope hand-off; poll briefly.
    let mut status = String::new();
    for _ in 0..50 {
        let detail: serde_json::Value = client
            .get(format!("{}/api/transfers/{transfer_id}", app.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        status = detail["status"].as_str().unwrap().to_string();
        if status == "ready" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "ready");
}

/// The stored document downloads byte-identical.
#[tokio::test]
async fn document_download_round_trips() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(format!("{}/api/transfers/create", app.base_url))
        .json(&create_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let transfer_id = body["transferId"].as_str().unwrap();
    let doc_id = body["documentIds"][0].as_str().unwrap();

    let response = client
        .get(format!(
            "{}/api/transfers/{transfer_id}/documents/{doc_id}",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let bytes = response.bytes().await.unwrap();
    assert_eq!(&bytes[..], b"0123456789abcdef0123456789abcdef");
}

/// Unknown transfers return the error envelope with a 404.
#[tokio::test]
async fn missing_transfer_returns_error_envelope() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/transfers/transfer-0-missing", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "TRANSFER_NOT_FOUND");
}

/// Invalid create bodies list the offending fields.
#[tokio::test]
async fn invalid_create_lists_field_details() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/transfers/create", app.base_url))
        .json(&json!({ "documents": [], "recipients": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    let fields: Vec<&str> = body["error"]["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"documents"));
    assert!(fields.contains(&"recipients"));
}

/// Scenario: sign an incoming transfer and return it. A reciprocal
/// outgoing transfer exists whose sole recipient is the original
/// sender, carrying the return metadata.
#[tokio::test]
async fn sign_and_return() {
    let app = start_app().await;
    let client = reqwest::Client::new();

    // An incoming transfer from peerA arrives over the transport layer.
    let data = b"please sign this".to_vec();
    let envelope = Envelope {
        transfer_id: TransferId::new("transfer-9000-incoming"),
        to: "self".into(),
        documents: vec![EnvelopeDocument {
            id: DocumentId::generate(),
            file_name: "contract.pdf".into(),
            size: data.len() as u64,
            hash: firma_sign_server::blob::sha256_hex(&data),
            data: Some(BASE64.encode(&data)),
        }],
        sender: SenderInfo {
            sender_id: "peerA".into(),
            name: Some("Peer A".into()),
            transport: Some("email".into()),
        },
        metadata: TransferMetadata::default(),
    };
    let incoming_id = app.state.transfer_router.receive_envelope(&envelope).unwrap();

    let detail: serde_json::Value = client
        .get(format!("{}/api/transfers/{incoming_id}", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let doc_id = detail["documents"][0]["documentId"].as_str().unwrap();

    let response = client
        .post(format!("{}/api/transfers/{incoming_id}/sign", app.base_url))
        .json(&json!({
            "signatures": [{
                "documentId": doc_id,
                "signature": BASE64.encode(b"opaque signature blob"),
                "components": [],
                "status": "signed",
            }],
            "returnTransport": "email",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");

    let return_id = body["returnTransferId"].as_str().unwrap();
    let return_detail: serde_json::Value = client
        .get(format!("{}/api/transfers/{return_id}", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(return_detail["type"], "outgoing");
    let recipients = return_detail["recipients"].as_array().unwrap();
    assert_eq!(recipients.len(), 1);
    assert_eq!(recipients[0]["identifier"], "peerA");
    assert_eq!(return_detail["metadata"]["originalTransferId"], incoming_id.to_string());
    assert_eq!(return_detail["metadata"]["returnTransport"], true);

    // The incoming transfer completed.
    let signed: serde_json::Value = client
        .get(format!("{}/api/transfers/{incoming_id}", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(signed["status"], "completed");
    assert_eq!(signed["documents"][0]["status"], "signed");
}
