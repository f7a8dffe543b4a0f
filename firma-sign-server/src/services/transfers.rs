//! Transfer router: outgoing/incoming lifecycle, recipient expansion,
//! dispatch with retry, and the sign-and-return flow.
//!
//! State changes for a single transfer serialize under a per-transfer
//! async mutex; recipient notifications may complete in any order.
//! Dispatch is at-least-once: transfers left `pending` at shutdown are
//! re-dispatched from persistence on restart.
//!
//! Cancellation: every dispatch runs under a [`CancellationToken`]
//! that is a child of the router's shutdown token. Request-scoped
//! callers cancel theirs (or simply drop the dispatch future, as the
//! HTTP timeout layer does) to stop the retry loop mid-backoff;
//! [`TransferRouter::begin_shutdown`] cancels every outstanding scope
//! at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use firma_sign_proto::code;
use firma_sign_proto::ids::{DocumentId, PeerId, Timestamp, TransferId};
use firma_sign_proto::transfer::{
    DocumentCategory, DocumentStatus, Envelope, EnvelopeDocument, RecipientStatus, SenderInfo,
    TransferMetadata, TransferStatus, TransferType,
};

use crate::blob::BlobStore;
use crate::db::documents::{DocumentRow, NewDocument};
use crate::db::recipients::{NewRecipient, RecipientPreferences, RecipientRow};
use crate::db::transfers::{NewTransfer, TransferFilter, TransferRow};
use crate::db::{Database, documents, recipients, transfers};
use crate::error::ApiError;
use crate::events::{Event, EventBus};
use crate::services::documents::DocumentService;
use crate::transport::TransportError;
use crate::transport::registry::TransportRegistry;

/// Retry policy for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First backoff delay.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Attempts per recipient, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1600),
            max_attempts: 5,
        }
    }
}

/// A document supplied to [`TransferRouter::create_transfer`].
#[derive(Debug, Clone, Default)]
pub struct TransferDocument {
    /// Original file name.
    pub file_name: String,
    /// Raw bytes.
    pub data: Vec<u8>,
}

/// A recipient supplied to [`TransferRouter::create_transfer`].
#[derive(Debug, Clone)]
pub struct TransferRecipient {
    /// Transport-specific address.
    pub identifier: String,
    /// Transport name, or `auto` for registry selection.
    pub transport: String,
    /// Delivery preferences.
    pub preferences: RecipientPreferences,
}

/// Request for [`TransferRouter::create_transfer`].
#[derive(Debug, Clone, Default)]
pub struct CreateTransferRequest {
    /// Documents to send.
    pub documents: Vec<TransferDocument>,
    /// Recipients to notify.
    pub recipients: Vec<TransferRecipient>,
    /// Free-form metadata.
    pub metadata: TransferMetadata,
    /// Default transport hint recorded on the transfer.
    pub transport: Option<String>,
}

/// Result of creating a transfer.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTransfer {
    /// The new transfer.
    pub transfer_id: String,
    /// Its human code.
    pub code: String,
    /// Always `created`.
    pub status: String,
    /// Ids of the stored documents, in request order.
    pub document_ids: Vec<String>,
}

/// One signature in a [`SignRequest`].
#[derive(Debug, Clone)]
pub struct DocumentSignature {
    /// The document being signed or rejected.
    pub document_id: DocumentId,
    /// Signature bytes, base64. Opaque to the core.
    pub signature: String,
    /// Annotation components, passed through.
    pub components: serde_json::Value,
    /// `signed` or `rejected`.
    pub status: SignatureStatus,
}

/// Outcome of signing a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The document was signed.
    Signed,
    /// The document was rejected.
    Rejected,
}

/// Request for [`TransferRouter::sign_documents`].
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// Per-document signatures.
    pub signatures: Vec<DocumentSignature>,
    /// When set on an incoming transfer, a reciprocal outgoing transfer
    /// carries the signed documents back to the sender.
    pub return_transport: Option<String>,
}

/// Outcome of [`TransferRouter::sign_documents`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOutcome {
    /// Always `success`.
    pub status: String,
    /// The reciprocal transfer, when one was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_transfer_id: Option<String>,
}

/// A transfer with its children.
#[derive(Debug)]
pub struct TransferDetail {
    /// The transfer row.
    pub transfer: TransferRow,
    /// Its documents.
    pub documents: Vec<DocumentRow>,
    /// Its recipients.
    pub recipients: Vec<RecipientRow>,
}

/// Routes transfers across transports.
pub struct TransferRouter {
    db: Arc<Database>,
    documents: Arc<DocumentService>,
    registry: Arc<TransportRegistry>,
    bus: Arc<EventBus>,
    local_peer: PeerId,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl TransferRouter {
    /// Creates the router.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        documents: Arc<DocumentService>,
        registry: Arc<TransportRegistry>,
        bus: Arc<EventBus>,
        local_peer: PeerId,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            documents,
            registry,
            bus,
            local_peer,
            retry,
            locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Signals in-flight dispatch loops to stop retrying. Cancels every
    /// scope handed out by [`Self::cancellation_scope`].
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// A cancellation token parented to the router's shutdown signal.
    /// Request handlers cancel it to abort an in-flight dispatch when
    /// the originating request is dropped or deadlined.
    #[must_use]
    pub fn cancellation_scope(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    fn lock_for(&self, id: &TransferId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id.as_str().to_string())
            .or_default()
            .clone()
    }

    /// Creates an outgoing transfer: one unit of work covering the
    /// transfer row, its documents (bytes stored first), and its
    /// recipients, plus a fresh 6-character code.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an empty document or
    /// recipient list, [`ApiError::Storage`] when persistence fails.
    pub fn create_transfer(&self, request: &CreateTransferRequest) -> Result<CreatedTransfer, ApiError> {
        if request.documents.is_empty() {
            return Err(ApiError::invalid("documents", "must not be empty"));
        }
        if request.recipients.is_empty() {
            return Err(ApiError::invalid("recipients", "must not be empty"));
        }

        let transfer_id = TransferId::generate();
        let transfer_code = code::generate();
        let created_at = Timestamp::now();
        let blob = self.documents.blob();

        // Bytes land first; a failed commit removes them again.
        let mut stored: Vec<(DocumentId, String, String, String)> = Vec::new();
        for doc in &request.documents {
            let id = DocumentId::generate();
            let relpath =
                BlobStore::document_path(DocumentCategory::Sent, created_at, id.as_str(), &doc.file_name);
            let hash = match blob.save(&relpath, &doc.data) {
                Ok(hash) => hash,
                Err(e) => {
                    self.cleanup_blobs(&stored);
                    return Err(e.into());
                }
            };
            stored.push((
                id,
                crate::blob::sanitize_name(&doc.file_name),
                hash,
                relpath,
            ));
        }

        let result = self.db.with_tx(|tx| {
            transfers::insert(
                tx,
                &NewTransfer {
                    id: transfer_id.clone(),
                    transfer_type: TransferType::Outgoing,
                    status: TransferStatus::Pending,
                    code: Some(transfer_code.clone()),
                    sender: None,
                    transport: request.transport.clone(),
                    metadata: request.metadata.clone(),
                },
            )?;
            for (doc, (id, stored_name, hash, _)) in request.documents.iter().zip(&stored) {
                documents::insert(
                    tx,
                    &NewDocument {
                        id: id.clone(),
                        transfer_id: transfer_id.clone(),
                        file_name: doc.file_name.clone(),
                        stored_name: stored_name.clone(),
                        size: doc.data.len() as u64,
                        hash: hash.clone(),
                        status: DocumentStatus::Pending,
                        category: DocumentCategory::Sent,
                        uploaded_by: Some(self.local_peer.to_string()),
                        tags: Vec::new(),
                        version: 1,
                        previous_version_id: None,
                    },
                )?;
            }
            for recipient in &request.recipients {
                recipients::insert(
                    tx,
                    &NewRecipient {
                        id: format!("recipient-{}", uuid::Uuid::now_v7()),
                        transfer_id: transfer_id.clone(),
                        identifier: recipient.identifier.clone(),
                        transport: recipient.transport.clone(),
                        preferences: recipient.preferences.clone(),
                    },
                )?;
            }
            Ok(())
        });

        if let Err(e) = result {
            self.cleanup_blobs(&stored);
            return Err(e.into());
        }

        tracing::info!(transfer = %transfer_id, code = %transfer_code, documents = stored.len(), "transfer created");
        self.bus.publish(&Event::TransferCreated {
            transfer_id: transfer_id.to_string(),
            code: Some(transfer_code.clone()),
        });

        Ok(CreatedTransfer {
            transfer_id: transfer_id.to_string(),
            code: transfer_code,
            status: "created".to_string(),
            document_ids: stored.iter().map(|(id, ..)| id.to_string()).collect(),
        })
    }

    fn cleanup_blobs(&self, stored: &[(DocumentId, String, String, String)]) {
        for (_, _, _, relpath) in stored {
            if let Err(e) = self.documents.blob().delete(relpath) {
                tracing::warn!(path = %relpath, error = %e, "blob cleanup failed");
            }
        }
    }

    /// Dispatches envelopes to every pending recipient under a fresh
    /// cancellation scope. See [`Self::dispatch_with_cancel`].
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown transfer.
    pub async fn dispatch_transfer(&self, transfer_id: &TransferId) -> Result<(), ApiError> {
        let cancel = self.cancellation_scope();
        self.dispatch_with_cancel(transfer_id, &cancel).await
    }

    /// Dispatches envelopes to every pending recipient, retrying
    /// transient failures with exponential backoff. Notified recipients
    /// advance the transfer to `ready` once the last one lands.
    ///
    /// Cancelling `cancel` stops the loop between recipients and
    /// interrupts an in-flight retry; untouched recipients stay
    /// `pending` and resume on the next dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown transfer.
    pub async fn dispatch_with_cancel(
        &self,
        transfer_id: &TransferId,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let detail = self.get_transfer(transfer_id)?;
        let envelope_docs = self.envelope_documents(&detail.documents)?;

        for recipient in &detail.recipients {
            if recipient.status != RecipientStatus::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                tracing::info!(transfer = %transfer_id, "dispatch cancelled");
                break;
            }
            let envelope = Envelope {
                transfer_id: transfer_id.clone(),
                to: recipient.identifier.clone(),
                documents: envelope_docs.clone(),
                sender: SenderInfo {
                    sender_id: self.local_peer.to_string(),
                    name: None,
                    transport: Some(recipient.transport.clone()),
                },
                metadata: detail.transfer.metadata.clone(),
            };
            match self.deliver_to_recipient(recipient, &envelope, cancel).await {
                Ok(transport) => {
                    tracing::info!(
                        transfer = %transfer_id,
                        recipient = %recipient.identifier,
                        transport = %transport,
                        "recipient notified"
                    );
                    self.db.with_conn(|conn| {
                        recipients::set_status(conn, &recipient.id, RecipientStatus::Notified, None)
                    })?;
                }
                Err(e) => {
                    tracing::warn!(
                        transfer = %transfer_id,
                        recipient = %recipient.identifier,
                        error = %e,
                        "recipient left pending"
                    );
                    self.db.with_conn(|conn| {
                        recipients::set_status(
                            conn,
                            &recipient.id,
                            RecipientStatus::Pending,
                            Some(&e.to_string()),
                        )
                    })?;
                }
            }
        }

        // Serialize the state change for this transfer.
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        let pending = self.db.with_conn(|conn| {
            recipients::count_by_status(conn, transfer_id, RecipientStatus::Pending)
        })?;
        if pending == 0 {
            let current = self.db.with_conn(|conn| transfers::find(conn, transfer_id))?;
            if let Some(current) = current
                && current.status.can_transition_to(TransferStatus::Ready)
            {
                self.db
                    .with_conn(|conn| transfers::set_status(conn, transfer_id, TransferStatus::Ready))?;
                self.bus.publish(&Event::TransferUpdated {
                    transfer_id: transfer_id.to_string(),
                    status: TransferStatus::Ready.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    fn envelope_documents(
        &self,
        docs: &[DocumentRow],
    ) -> Result<Vec<EnvelopeDocument>, ApiError> {
        docs.iter()
            .map(|doc| {
                let with_data = self.documents.get_document(&doc.id)?;
                Ok(EnvelopeDocument {
                    id: doc.id.clone(),
                    file_name: doc.file_name.clone(),
                    size: doc.size,
                    hash: doc.hash.clone(),
                    data: Some(BASE64.encode(&with_data.data)),
                })
            })
            .collect()
    }

    /// Resolves the transport chain for a recipient and sends with
    /// backoff. Returns the transport that accepted the envelope.
    async fn deliver_to_recipient(
        &self,
        recipient: &RecipientRow,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        let mut candidates: Vec<String> = Vec::new();
        if recipient.transport != "auto" {
            candidates.push(recipient.transport.clone());
        } else if let Some(selected) = self.registry.select_for_peer(&PeerId::new(&recipient.identifier)) {
            candidates.push(selected);
        }
        for fallback in &recipient.preferences.fallback_transports {
            if !candidates.contains(fallback) {
                candidates.push(fallback.clone());
            }
        }

        let chosen = candidates
            .iter()
            .find(|name| self.registry.is_active(name))
            .cloned()
            .ok_or_else(|| {
                TransportError::Unavailable(
                    candidates.first().cloned().unwrap_or_else(|| "auto".into()),
                )
            })?;

        self.send_with_retry(&chosen, envelope, cancel).await?;
        Ok(chosen)
    }

    async fn send_with_retry(
        &self,
        transport: &str,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut delay = self.retry.initial_delay;
        let mut last = TransportError::Unavailable(transport.to_string());
        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(TransportError::Transient("dispatch cancelled".into()));
            }
            let result = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(TransportError::Transient("dispatch cancelled".into()));
                }
                result = self.registry.send_via(transport, envelope) => result,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::debug!(
                        transport,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient send failure, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(TransportError::Transient("dispatch cancelled".into()));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = std::cmp::min(delay.saturating_mul(2), self.retry.max_delay);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Applies signatures to a transfer's documents and advances the
    /// transfer state. On an incoming transfer with `return_transport`,
    /// a reciprocal outgoing transfer carries the signed documents back
    /// to the original sender.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown transfer or
    /// document, [`ApiError::InvalidRequest`] for malformed signatures
    /// or foreign documents.
    pub async fn sign_documents(
        &self,
        transfer_id: &TransferId,
        request: &SignRequest,
    ) -> Result<SignOutcome, ApiError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;

        let transfer = self
            .db
            .with_conn(|conn| transfers::find(conn, transfer_id))?
            .ok_or_else(|| ApiError::not_found("transfer", transfer_id.as_str()))?;

        for signature in &request.signatures {
            let doc = self
                .db
                .with_conn(|conn| documents::find(conn, &signature.document_id))?
                .ok_or_else(|| ApiError::not_found("document", signature.document_id.as_str()))?;
            if doc.transfer_id != *transfer_id {
                return Err(ApiError::invalid(
                    "signatures.documentId",
                    format!("document {} does not belong to transfer", doc.id),
                ));
            }
            let signature_bytes = BASE64
                .decode(&signature.signature)
                .map_err(|_| ApiError::invalid("signatures.signature", "invalid base64"))?;

            match signature.status {
                SignatureStatus::Signed => {
                    let sig_path = BlobStore::document_path(
                        DocumentCategory::Signed,
                        doc.created_at,
                        doc.id.as_str(),
                        &format!("{}.sig", doc.stored_name),
                    );
                    self.documents.blob().save(&sig_path, &signature_bytes)?;
                    self.documents.update_status(
                        &doc.id,
                        DocumentStatus::Signed,
                        Some(self.local_peer.as_str()),
                    )?;
                }
                SignatureStatus::Rejected => {
                    self.documents
                        .update_status(&doc.id, DocumentStatus::Rejected, None)?;
                }
            }
        }

        self.advance_after_signing(transfer_id, &transfer)?;

        let return_transfer_id = if let Some(return_transport) = &request.return_transport {
            if transfer.transfer_type == TransferType::Incoming {
                Some(self.create_return_transfer(transfer_id, &transfer, return_transport)?)
            } else {
                None
            }
        } else {
            None
        };

        Ok(SignOutcome {
            status: "success".to_string(),
            return_transfer_id,
        })
    }

    /// Recomputes the transfer status from its children (invariant: a
    /// transfer completes iff every document is resolved and, when
    /// `require_all_signatures` is set, every recipient has signed).
    fn advance_after_signing(
        &self,
        transfer_id: &TransferId,
        transfer: &TransferRow,
    ) -> Result<(), ApiError> {
        let docs = self
            .db
            .with_conn(|conn| documents::find_by_transfer(conn, transfer_id))?;
        let all_resolved = !docs.is_empty() && docs.iter().all(|d| d.status.is_resolved());
        let any_resolved = docs.iter().any(|d| d.status.is_resolved());

        let recipients_ok = if transfer.metadata.require_all_signatures {
            let rows = self
                .db
                .with_conn(|conn| recipients::find_by_transfer(conn, transfer_id))?;
            !rows.is_empty() && rows.iter().all(|r| r.status == RecipientStatus::Signed)
        } else {
            true
        };

        let target = if all_resolved && recipients_ok {
            Some(TransferStatus::Completed)
        } else if any_resolved {
            Some(TransferStatus::PartiallySigned)
        } else {
            None
        };

        if let Some(target) = target {
            let current = self
                .db
                .with_conn(|conn| transfers::find(conn, transfer_id))?
                .ok_or_else(|| ApiError::not_found("transfer", transfer_id.as_str()))?;
            if current.status.can_transition_to(target) {
                self.db
                    .with_conn(|conn| transfers::set_status(conn, transfer_id, target))?;
                self.bus.publish(&Event::TransferUpdated {
                    transfer_id: transfer_id.to_string(),
                    status: target.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Builds the reciprocal outgoing transfer for a sign-and-return.
    fn create_return_transfer(
        &self,
        original_id: &TransferId,
        original: &TransferRow,
        return_transport: &str,
    ) -> Result<String, ApiError> {
        let sender = original.sender.as_ref().ok_or_else(|| {
            ApiError::invalid("returnTransport", "incoming transfer has no sender snapshot")
        })?;

        let docs = self
            .db
            .with_conn(|conn| documents::find_by_transfer(conn, original_id))?;
        let mut documents = Vec::new();
        for doc in docs
            .iter()
            .filter(|d| d.status == DocumentStatus::Signed)
        {
            let with_data = self.documents.get_document(&doc.id)?;
            documents.push(TransferDocument {
                file_name: doc.file_name.clone(),
                data: with_data.data,
            });
        }
        if documents.is_empty() {
            return Err(ApiError::invalid(
                "returnTransport",
                "no signed documents to return",
            ));
        }

        let mut metadata = TransferMetadata::default();
        metadata.extra.insert(
            "originalTransferId".to_string(),
            serde_json::Value::String(original_id.to_string()),
        );
        metadata
            .extra
            .insert("returnTransport".to_string(), serde_json::Value::Bool(true));

        let created = self.create_transfer(&CreateTransferRequest {
            documents,
            recipients: vec![TransferRecipient {
                identifier: sender.sender_id.clone(),
                transport: return_transport.to_string(),
                preferences: RecipientPreferences::default(),
            }],
            metadata,
            transport: Some(return_transport.to_string()),
        })?;
        tracing::info!(
            original = %original_id,
            reciprocal = %created.transfer_id,
            transport = return_transport,
            "return transfer created"
        );
        Ok(created.transfer_id)
    }

    /// Ingests an incoming envelope: persists the transfer, documents
    /// (bytes from the inline payload), and the local recipient row.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] when persistence fails.
    pub fn receive_envelope(&self, envelope: &Envelope) -> Result<TransferId, ApiError> {
        let transfer_id = envelope.transfer_id.clone();
        let created_at = Timestamp::now();
        let blob = self.documents.blob();

        let mut stored = Vec::new();
        for doc in &envelope.documents {
            let bytes = doc
                .data
                .as_ref()
                .map(|data| BASE64.decode(data))
                .transpose()
                .map_err(|_| ApiError::invalid("documents.data", "invalid base64"))?
                .unwrap_or_default();
            let relpath = BlobStore::document_path(
                DocumentCategory::Received,
                created_at,
                doc.id.as_str(),
                &doc.file_name,
            );
            let hash = blob.save(&relpath, &bytes)?;
            if hash != doc.hash {
                tracing::warn!(
                    document = %doc.id,
                    declared = %doc.hash,
                    actual = %hash,
                    "envelope hash disagrees with received bytes"
                );
            }
            stored.push((doc, bytes.len() as u64, hash));
        }

        let local = envelope.to.clone();
        let sender = envelope.sender.clone();
        let metadata = envelope.metadata.clone();
        let transport = sender.transport.clone().unwrap_or_else(|| "web".to_string());
        self.db.with_tx(|tx| {
            transfers::insert(
                tx,
                &NewTransfer {
                    id: transfer_id.clone(),
                    transfer_type: TransferType::Incoming,
                    status: TransferStatus::Pending,
                    code: None,
                    sender: Some(sender.clone()),
                    transport: Some(transport.clone()),
                    metadata: metadata.clone(),
                },
            )?;
            for (doc, size, hash) in &stored {
                documents::insert(
                    tx,
                    &NewDocument {
                        id: doc.id.clone(),
                        transfer_id: transfer_id.clone(),
                        file_name: doc.file_name.clone(),
                        stored_name: crate::blob::sanitize_name(&doc.file_name),
                        size: *size,
                        hash: hash.clone(),
                        status: DocumentStatus::Pending,
                        category: DocumentCategory::Received,
                        uploaded_by: Some(sender.sender_id.clone()),
                        tags: Vec::new(),
                        version: 1,
                        previous_version_id: None,
                    },
                )?;
            }
            recipients::insert(
                tx,
                &NewRecipient {
                    id: format!("recipient-{}", uuid::Uuid::now_v7()),
                    transfer_id: transfer_id.clone(),
                    identifier: local.clone(),
                    transport: transport.clone(),
                    preferences: RecipientPreferences::default(),
                },
            )?;
            transfers::set_status(tx, &transfer_id, TransferStatus::Ready)?;
            Ok(())
        })?;

        tracing::info!(transfer = %transfer_id, sender = %sender.sender_id, "incoming transfer received");
        self.bus.publish(&Event::TransferCreated {
            transfer_id: transfer_id.to_string(),
            code: None,
        });

        // A reciprocal sign-and-return closes the loop on the original
        // outgoing transfer.
        if envelope.metadata.extra.get("returnTransport") == Some(&serde_json::Value::Bool(true))
            && let Some(serde_json::Value::String(original)) =
                envelope.metadata.extra.get("originalTransferId")
        {
            let original_id = TransferId::new(original.clone());
            if let Err(e) = self.apply_returned_signatures(&original_id, envelope) {
                tracing::warn!(
                    original = %original_id,
                    error = %e,
                    "could not apply returned signatures to original transfer"
                );
            }
        }
        Ok(transfer_id)
    }

    /// Marks the original outgoing transfer's recipient as signed and
    /// resolves the documents that came back, then re-evaluates the
    /// transfer status.
    fn apply_returned_signatures(
        &self,
        original_id: &TransferId,
        envelope: &Envelope,
    ) -> Result<(), ApiError> {
        let Some(original) = self.db.with_conn(|conn| transfers::find(conn, original_id))? else {
            return Err(ApiError::not_found("transfer", original_id.as_str()));
        };
        if original.transfer_type != TransferType::Outgoing {
            return Ok(());
        }

        let signer = &envelope.sender.sender_id;
        let recipient = self
            .db
            .with_conn(|conn| recipients::find_by_identifier(conn, original_id, signer))?;
        if let Some(recipient) = recipient {
            self.db.with_conn(|conn| {
                recipients::set_status(conn, &recipient.id, RecipientStatus::Signed, None)
            })?;
        } else {
            tracing::warn!(
                original = %original_id,
                signer = %signer,
                "return transfer from an unknown recipient"
            );
        }

        // The returned documents carry the signed content; resolve the
        // matching originals by file name.
        let docs = self
            .db
            .with_conn(|conn| documents::find_by_transfer(conn, original_id))?;
        for returned in &envelope.documents {
            if let Some(doc) = docs
                .iter()
                .find(|d| d.file_name == returned.file_name && !d.status.is_resolved())
            {
                self.documents
                    .update_status(&doc.id, DocumentStatus::Signed, Some(signer))?;
            }
        }

        self.advance_after_signing(original_id, &original)
    }

    /// Cancels a non-terminal transfer.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id or
    /// [`ApiError::Conflict`] for a terminal transfer.
    pub async fn cancel(&self, transfer_id: &TransferId) -> Result<(), ApiError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        self.db
            .with_conn(|conn| transfers::set_status(conn, transfer_id, TransferStatus::Cancelled))?;
        self.bus.publish(&Event::TransferUpdated {
            transfer_id: transfer_id.to_string(),
            status: TransferStatus::Cancelled.as_str().to_string(),
        });
        Ok(())
    }

    /// Loads a transfer with its documents and recipients.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id.
    pub fn get_transfer(&self, transfer_id: &TransferId) -> Result<TransferDetail, ApiError> {
        let transfer = self
            .db
            .with_conn(|conn| transfers::find(conn, transfer_id))?
            .ok_or_else(|| ApiError::not_found("transfer", transfer_id.as_str()))?;
        let docs = self
            .db
            .with_conn(|conn| documents::find_by_transfer(conn, transfer_id))?;
        let recips = self
            .db
            .with_conn(|conn| recipients::find_by_transfer(conn, transfer_id))?;
        Ok(TransferDetail {
            transfer,
            documents: docs,
            recipients: recips,
        })
    }

    /// Lists transfers.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] on engine failure.
    pub fn list_transfers(&self, filter: &TransferFilter) -> Result<Vec<TransferRow>, ApiError> {
        Ok(self.db.with_conn(|conn| transfers::list(conn, filter))?)
    }

    /// Re-dispatches outgoing transfers left `pending` by a previous
    /// run. Called once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] when the scan fails.
    pub async fn resume_pending(&self) -> Result<u32, ApiError> {
        let pending = self.list_transfers(&TransferFilter {
            transfer_type: Some(TransferType::Outgoing),
            status: Some(TransferStatus::Pending),
            limit: Some(u32::MAX),
            offset: None,
        })?;
        let count = u32::try_from(pending.len()).unwrap_or(u32::MAX);
        for transfer in pending {
            if let Err(e) = self.dispatch_transfer(&transfer.id).await {
                tracing::warn!(transfer = %transfer.id, error = %e, "resume dispatch failed");
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStoreOptions;
    use crate::transport::channel::{ChannelTransport, InjectedFailure};

    struct Fixture {
        _dir: tempfile::TempDir,
        router: TransferRouter,
        transport: Arc<ChannelTransport>,
        outbox: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
        bus: Arc<EventBus>,
    }

    async fn fixture() -> Fixture {
        fixture_with_retry(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 5,
        })
        .await
    }

    async fn fixture_with_retry(retry: RetryPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let blob = Arc::new(
            BlobStore::new(dir.path().join("docs"), BlobStoreOptions::default()).unwrap(),
        );
        let documents = Arc::new(DocumentService::new(Arc::clone(&db), blob));
        let registry = Arc::new(TransportRegistry::new());
        let (transport, outbox) = ChannelTransport::create("email");
        registry.register(Arc::clone(&transport) as Arc<dyn crate::transport::Transport>);
        registry
            .initialize(&["email".to_string()], &HashMap::new())
            .await;
        let bus = Arc::new(EventBus::new());
        let router = TransferRouter::new(
            db,
            documents,
            registry,
            Arc::clone(&bus),
            PeerId::new("self"),
            retry,
        );
        Fixture {
            _dir: dir,
            router,
            transport,
            outbox,
            bus,
        }
    }

    fn request(identifier: &str) -> CreateTransferRequest {
        CreateTransferRequest {
            documents: vec![TransferDocument {
                file_name: "a.pdf".into(),
                data: b"0123456789abcdef0123456789abcdef".to_vec(),
            }],
            recipients: vec![TransferRecipient {
                identifier: identifier.into(),
                transport: "email".into(),
                preferences: RecipientPreferences::default(),
            }],
            metadata: TransferMetadata::default(),
            transport: Some("email".into()),
        }
    }

    #[tokio::test]
    async fn create_issues_code_from_alphabet() {
        let fx = fixture().await;
        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        assert_eq!(created.status, "created");
        assert_eq!(created.code.len(), 6);
        assert!(code::canonicalize(&created.code).is_ok());

        let listed = fx.router.list_transfers(&TransferFilter::default()).unwrap();
        assert!(listed.iter().any(|t| t.id.to_string() == created.transfer_id));
    }

    #[tokio::test]
    async fn empty_documents_rejected() {
        let fx = fixture().await;
        let mut req = request("bob@x");
        req.documents.clear();
        assert!(matches!(
            fx.router.create_transfer(&req),
            Err(ApiError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn dispatch_notifies_recipient_and_marks_ready() {
        let mut fx = fixture().await;
        let mut events = fx.bus.subscribe();
        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        let id = TransferId::new(created.transfer_id.clone());

        fx.router.dispatch_transfer(&id).await.unwrap();

        let envelope = fx.outbox.recv().await.unwrap();
        assert_eq!(envelope.to, "bob@x");
        assert_eq!(envelope.documents.len(), 1);
        assert!(envelope.documents[0].data.is_some());

        let detail = fx.router.get_transfer(&id).unwrap();
        assert_eq!(detail.transfer.status, TransferStatus::Ready);
        assert_eq!(detail.recipients[0].status, RecipientStatus::Notified);

        // transfer:created then transfer:update(ready).
        assert_eq!(events.recv().await.unwrap().name(), "transfer:created");
        let update = events.recv().await.unwrap();
        assert_eq!(update.name(), "transfer:update");
        assert_eq!(update.payload()["status"], "ready");
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let mut fx = fixture().await;
        fx.transport.fail_next(InjectedFailure::Transient, 3);

        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        let id = TransferId::new(created.transfer_id);
        fx.router.dispatch_transfer(&id).await.unwrap();

        // The fourth attempt succeeded.
        assert!(fx.outbox.recv().await.is_some());
        let detail = fx.router.get_transfer(&id).unwrap();
        assert_eq!(detail.recipients[0].status, RecipientStatus::Notified);
    }

    #[tokio::test]
    async fn permanent_failure_leaves_recipient_pending_with_error() {
        let fx = fixture().await;
        fx.transport.fail_next(InjectedFailure::Permanent, 1);

        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        let id = TransferId::new(created.transfer_id);
        fx.router.dispatch_transfer(&id).await.unwrap();

        let detail = fx.router.get_transfer(&id).unwrap();
        assert_eq!(detail.transfer.status, TransferStatus::Pending);
        assert_eq!(detail.recipients[0].status, RecipientStatus::Pending);
        assert!(detail.recipients[0].error.as_deref().unwrap().contains("permanent"));
        // Exactly one attempt went out.
        assert_eq!(fx.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_transient_retries_leave_pending() {
        let fx = fixture_with_retry(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 2,
        })
        .await;
        fx.transport.fail_next(InjectedFailure::Transient, 5);

        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        let id = TransferId::new(created.transfer_id);
        fx.router.dispatch_transfer(&id).await.unwrap();

        let detail = fx.router.get_transfer(&id).unwrap();
        assert_eq!(detail.recipients[0].status, RecipientStatus::Pending);
        assert!(detail.recipients[0].error.is_some());
    }

    #[tokio::test]
    async fn cancelled_scope_skips_dispatch_entirely() {
        let fx = fixture().await;
        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        let id = TransferId::new(created.transfer_id);

        let cancel = fx.router.cancellation_scope();
        cancel.cancel();
        fx.router.dispatch_with_cancel(&id, &cancel).await.unwrap();

        // Nothing went out; the recipient resumes on the next dispatch.
        let detail = fx.router.get_transfer(&id).unwrap();
        assert_eq!(detail.transfer.status, TransferStatus::Pending);
        assert_eq!(detail.recipients[0].status, RecipientStatus::Pending);
        assert_eq!(fx.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_backoff() {
        let fx = fixture_with_retry(RetryPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(100),
            max_attempts: 5,
        })
        .await;
        fx.transport.fail_next(InjectedFailure::Transient, u32::MAX);

        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        let id = TransferId::new(created.transfer_id);

        // Cancel mid-backoff, well before the retries would exhaust.
        let cancel = fx.router.cancellation_scope();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        fx.router.dispatch_with_cancel(&id, &cancel).await.unwrap();

        let detail = fx.router.get_transfer(&id).unwrap();
        assert_eq!(detail.recipients[0].status, RecipientStatus::Pending);
        assert!(
            detail.recipients[0]
                .error
                .as_deref()
                .unwrap()
                .contains("cancelled")
        );
        assert_eq!(fx.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn begin_shutdown_cancels_every_scope() {
        let fx = fixture().await;
        let scope = fx.router.cancellation_scope();
        assert!(!scope.is_cancelled());
        fx.router.begin_shutdown();
        assert!(scope.is_cancelled());
        // Scopes created after shutdown are born cancelled.
        assert!(fx.router.cancellation_scope().is_cancelled());
    }

    fn incoming_envelope(transfer_id: &str, from: &str) -> Envelope {
        let data = b"incoming document bytes".to_vec();
        Envelope {
            transfer_id: TransferId::new(transfer_id),
            to: "self".into(),
            documents: vec![EnvelopeDocument {
                id: DocumentId::generate(),
                file_name: "incoming.pdf".into(),
                size: data.len() as u64,
                hash: crate::blob::sha256_hex(&data),
                data: Some(BASE64.encode(&data)),
            }],
            sender: SenderInfo {
                sender_id: from.into(),
                name: Some("Peer A".into()),
                transport: Some("email".into()),
            },
            metadata: TransferMetadata::default(),
        }
    }

    #[tokio::test]
    async fn sign_and_return_creates_reciprocal_transfer() {
        let fx = fixture().await;
        let envelope = incoming_envelope("transfer-100-aa", "peerA");
        let incoming_id = fx.router.receive_envelope(&envelope).unwrap();

        let doc_id = fx.router.get_transfer(&incoming_id).unwrap().documents[0]
            .id
            .clone();
        let outcome = fx
            .router
            .sign_documents(
                &incoming_id,
                &SignRequest {
                    signatures: vec![DocumentSignature {
                        document_id: doc_id,
                        signature: BASE64.encode(b"sig-bytes"),
                        components: serde_json::json!([]),
                        status: SignatureStatus::Signed,
                    }],
                    return_transport: Some("email".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, "success");

        // The reciprocal transfer targets the original sender and
        // carries the return metadata.
        let return_id = TransferId::new(outcome.return_transfer_id.unwrap());
        let detail = fx.router.get_transfer(&return_id).unwrap();
        assert_eq!(detail.transfer.transfer_type, TransferType::Outgoing);
        assert_eq!(detail.recipients.len(), 1);
        assert_eq!(detail.recipients[0].identifier, "peerA");
        assert_eq!(
            detail.transfer.metadata.extra["originalTransferId"],
            serde_json::json!(incoming_id.to_string())
        );
        assert_eq!(
            detail.transfer.metadata.extra["returnTransport"],
            serde_json::json!(true)
        );

        // The incoming transfer completed (sole document signed).
        let incoming = fx.router.get_transfer(&incoming_id).unwrap();
        assert_eq!(incoming.transfer.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn partial_signing_sets_partially_signed() {
        let fx = fixture().await;
        let mut envelope = incoming_envelope("transfer-101-aa", "peerA");
        let second = b"second doc".to_vec();
        envelope.documents.push(EnvelopeDocument {
            id: DocumentId::generate(),
            file_name: "second.pdf".into(),
            size: second.len() as u64,
            hash: crate::blob::sha256_hex(&second),
            data: Some(BASE64.encode(&second)),
        });
        let incoming_id = fx.router.receive_envelope(&envelope).unwrap();
        let doc_id = fx.router.get_transfer(&incoming_id).unwrap().documents[0]
            .id
            .clone();

        fx.router
            .sign_documents(
                &incoming_id,
                &SignRequest {
                    signatures: vec![DocumentSignature {
                        document_id: doc_id,
                        signature: BASE64.encode(b"sig"),
                        components: serde_json::Value::Null,
                        status: SignatureStatus::Signed,
                    }],
                    return_transport: None,
                },
            )
            .await
            .unwrap();

        let detail = fx.router.get_transfer(&incoming_id).unwrap();
        assert_eq!(detail.transfer.status, TransferStatus::PartiallySigned);
    }

    #[tokio::test]
    async fn require_all_signatures_blocks_completion() {
        let fx = fixture().await;
        let mut envelope = incoming_envelope("transfer-102-aa", "peerA");
        envelope.metadata.require_all_signatures = true;
        let incoming_id = fx.router.receive_envelope(&envelope).unwrap();
        let doc_id = fx.router.get_transfer(&incoming_id).unwrap().documents[0]
            .id
            .clone();

        fx.router
            .sign_documents(
                &incoming_id,
                &SignRequest {
                    signatures: vec![DocumentSignature {
                        document_id: doc_id,
                        signature: BASE64.encode(b"sig"),
                        components: serde_json::Value::Null,
                        status: SignatureStatus::Signed,
                    }],
                    return_transport: None,
                },
            )
            .await
            .unwrap();

        // The document is signed but the recipient has not signed, so
        // the transfer stays partially-signed.
        let detail = fx.router.get_transfer(&incoming_id).unwrap();
        assert_eq!(detail.transfer.status, TransferStatus::PartiallySigned);
    }

    #[tokio::test]
    async fn returned_signatures_complete_the_original_transfer() {
        let mut fx = fixture().await;

        // Outgoing transfer to bob@x, dispatched and notified.
        let created = fx.router.create_transfer(&request("bob@x")).unwrap();
        let original_id = TransferId::new(created.transfer_id.clone());
        fx.router.dispatch_transfer(&original_id).await.unwrap();
        let _ = fx.outbox.recv().await;

        // Bob signs and sends the documents back.
        let signed = b"signed content".to_vec();
        let return_envelope = Envelope {
            transfer_id: TransferId::generate(),
            to: "self".into(),
            documents: vec![EnvelopeDocument {
                id: DocumentId::generate(),
                file_name: "a.pdf".into(),
                size: signed.len() as u64,
                hash: crate::blob::sha256_hex(&signed),
                data: Some(BASE64.encode(&signed)),
            }],
            sender: SenderInfo {
                sender_id: "bob@x".into(),
                name: None,
                transport: Some("email".into()),
            },
            metadata: {
                let mut metadata = TransferMetadata::default();
                metadata.extra.insert(
                    "originalTransferId".into(),
                    serde_json::Value::String(original_id.to_string()),
                );
                metadata
                    .extra
                    .insert("returnTransport".into(), serde_json::Value::Bool(true));
                metadata
            },
        };
        fx.router.receive_envelope(&return_envelope).unwrap();

        let detail = fx.router.get_transfer(&original_id).unwrap();
        assert_eq!(detail.recipients[0].status, RecipientStatus::Signed);
        assert_eq!(detail.documents[0].status, DocumentStatus::Signed);
        assert_eq!(detail.transfer.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_is_rejected_on_terminal_transfer() {
        let fx = fixture().await;
        let envelope = incoming_envelope("transfer-103-aa", "peerA");
        let incoming_id = fx.router.receive_envelope(&envelope).unwrap();
        let doc_id = fx.router.get_transfer(&incoming_id).unwrap().documents[0]
            .id
            .clone();
        fx.router
            .sign_documents(
                &incoming_id,
                &SignRequest {
                    signatures: vec![DocumentSignature {
                        document_id: doc_id,
                        signature: BASE64.encode(b"sig"),
                        components: serde_json::Value::Null,
                        status: SignatureStatus::Signed,
                    }],
                    return_transport: None,
                },
            )
            .await
            .unwrap();

        let err = fx.router.cancel(&incoming_id).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn signing_foreign_document_is_invalid() {
        let fx = fixture().await;
        let first = fx
            .router
            .receive_envelope(&incoming_envelope("transfer-104-aa", "peerA"))
            .unwrap();
        let second = fx
            .router
            .receive_envelope(&incoming_envelope("transfer-105-aa", "peerB"))
            .unwrap();
        let foreign_doc = fx.router.get_transfer(&second).unwrap().documents[0]
            .id
            .clone();

        let err = fx
            .router
            .sign_documents(
                &first,
                &SignRequest {
                    signatures: vec![DocumentSignature {
                        document_id: foreign_doc,
                        signature: BASE64.encode(b"sig"),
                        components: serde_json::Value::Null,
                        status: SignatureStatus::Signed,
                    }],
                    return_transport: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest { .. }));
    }
}
