//! Document service tests: sanitization, content addressing, category
//! moves, and version chains against a real blob tree.

use std::sync::Arc;

use firma_sign_proto::transfer::{DocumentCategory, DocumentStatus};
use firma_sign_server::blob::{BlobStore, BlobStoreOptions, sha256_hex};
use firma_sign_server::db::Database;
use firma_sign_server::services::documents::{DocumentService, StoreDocumentOptions};

fn service() -> (tempfile::TempDir, DocumentService) {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let blob = Arc::new(
        BlobStore::new(dir.path().join("docs"), BlobStoreOptions::default()).unwrap(),
    );
    (dir, DocumentService::new(db, blob))
}

/// Scenario: a traversal-shaped file name stores under a sanitized
/// name matching `^[A-Za-z0-9._/-]+$` with no separators or dot-dots.
#[test]
fn hostile_file_name_sanitization() {
    let (_dir, service) = service();
    let stored = service
        .store_document(
            b"payload",
            "../../../etc/passwd",
            DocumentCategory::Uploaded,
            StoreDocumentOptions::default(),
        )
        .unwrap();

    assert!(!stored.stored_name.contains('/'));
    assert!(!stored.stored_name.contains(".."));
    assert!(
        stored
            .stored_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
        "unexpected character in {:?}",
        stored.stored_name
    );

    // The bytes are still retrievable and verified.
    assert_eq!(service.get_document(&stored.id).unwrap().data, b"payload");
}

/// Property: stored bytes always hash to the recorded content hash.
#[test]
fn content_hash_matches_stored_bytes() {
    let (_dir, service) = service();
    let payloads: [&[u8]; 3] = [b"alpha", b"beta beta", &[0u8; 1024]];
    for payload in payloads {
        let stored = service
            .store_document(
                payload,
                "doc.bin",
                DocumentCategory::Uploaded,
                StoreDocumentOptions::default(),
            )
            .unwrap();
        let loaded = service.get_document(&stored.id).unwrap();
        assert_eq!(sha256_hex(&loaded.data), stored.hash);
        assert_eq!(loaded.data, payload);
    }
}

/// Round-trip: `get_document(store_document(bytes)).data == bytes`.
#[test]
fn store_then_get_round_trip() {
    let (_dir, service) = service();
    let bytes = b"the quick brown fox";
    let stored = service
        .store_document(
            bytes,
            "fox.txt",
            DocumentCategory::Uploaded,
            StoreDocumentOptions::default(),
        )
        .unwrap();
    assert_eq!(service.get_document(&stored.id).unwrap().data, bytes);
}

/// Signing physically moves bytes to the signed tree and the document
/// stays retrievable through the category probe.
#[test]
fn status_move_keeps_bytes_reachable() {
    let (dir, service) = service();
    let stored = service
        .store_document(
            b"contract body",
            "contract.pdf",
            DocumentCategory::Uploaded,
            StoreDocumentOptions::default(),
        )
        .unwrap();

    let updated = service
        .update_status(&stored.id, DocumentStatus::Signed, Some("bob"))
        .unwrap();
    assert_eq!(updated.category, DocumentCategory::Signed);

    // Exactly one copy exists, under the signed tree.
    let signed_root = dir.path().join("docs/signed");
    assert!(signed_root.is_dir());
    let uploaded_tree: Vec<_> = walk(&dir.path().join("docs/uploaded"));
    assert!(uploaded_tree.is_empty(), "stale copy left behind: {uploaded_tree:?}");

    assert_eq!(service.get_document(&stored.id).unwrap().data, b"contract body");
}

fn walk(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

/// Versioning links back to the original and both versions keep their
/// own bytes.
#[test]
fn version_chain_preserves_all_content() {
    let (_dir, service) = service();
    let v1 = service
        .store_document(
            b"first draft",
            "draft.pdf",
            DocumentCategory::Uploaded,
            StoreDocumentOptions::default(),
        )
        .unwrap();
    let v2 = service.create_version(&v1.id, b"second draft", None).unwrap();
    let v3 = service.create_version(&v2.id, b"final", None).unwrap();

    let chain = service.get_versions(&v3.id).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0].version, 3);
    assert_eq!(chain[2].version, 1);

    assert_eq!(service.get_document(&v1.id).unwrap().data, b"first draft");
    assert_eq!(service.get_document(&v3.id).unwrap().data, b"final");
}

/// Hard delete removes bytes; a tampered blob fails verification.
#[test]
fn deletion_and_tamper_detection() {
    let (dir, service) = service();
    let stored = service
        .store_document(
            b"sensitive",
            "secret.pdf",
            DocumentCategory::Uploaded,
            StoreDocumentOptions::default(),
        )
        .unwrap();

    // Tamper with the stored bytes directly.
    let files = walk(&dir.path().join("docs/uploaded"));
    assert_eq!(files.len(), 1);
    std::fs::write(&files[0], b"tampered!").unwrap();
    assert!(service.get_document(&stored.id).is_err());

    // Hard delete removes the row; lookups miss afterwards.
    service.delete(&stored.id, true).unwrap();
    assert!(service.get_document(&stored.id).is_err());
}
