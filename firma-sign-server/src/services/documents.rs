//! Document service: bytes plus metadata, versioning, status moves,
//! and search.

use std::sync::Arc;

use firma_sign_proto::ids::{DocumentId, Timestamp, TransferId};
use firma_sign_proto::transfer::{
    DocumentCategory, DocumentStatus, TransferMetadata, TransferStatus, TransferType,
};

use crate::blob::{BlobError, BlobStore};
use crate::db::documents::{DocumentFilter, DocumentRow, NewDocument};
use crate::db::transfers::NewTransfer;
use crate::db::{Database, documents, transfers};
use crate::error::ApiError;

/// Options for [`DocumentService::store_document`].
#[derive(Debug, Clone, Default)]
pub struct StoreDocumentOptions {
    /// Owning transfer; a stub transfer is created when absent so the
    /// referential invariant holds.
    pub transfer_id: Option<TransferId>,
    /// Uploading peer.
    pub uploaded_by: Option<String>,
    /// Tags to attach.
    pub tags: Vec<String>,
    /// Initial status (default `draft`).
    pub status: Option<DocumentStatus>,
}

/// A stored document with its verified bytes.
#[derive(Debug, Clone)]
pub struct DocumentWithData {
    /// The metadata row.
    pub document: DocumentRow,
    /// The verified bytes.
    pub data: Vec<u8>,
}

/// Stores document bytes and metadata.
pub struct DocumentService {
    db: Arc<Database>,
    blob: Arc<BlobStore>,
}

impl DocumentService {
    /// Creates the service.
    #[must_use]
    pub fn new(db: Arc<Database>, blob: Arc<BlobStore>) -> Self {
        Self { db, blob }
    }

    /// The underlying blob store.
    #[must_use]
    pub fn blob(&self) -> &Arc<BlobStore> {
        &self.blob
    }

    /// Stores `bytes` under the category tree and persists the
    /// metadata row. Default status `draft`, version 1.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] when either the blob write or the
    /// row insert fails; a failed insert removes the written blob.
    pub fn store_document(
        &self,
        bytes: &[u8],
        original_name: &str,
        category: DocumentCategory,
        opts: StoreDocumentOptions,
    ) -> Result<DocumentRow, ApiError> {
        let id = DocumentId::generate();
        let created_at = Timestamp::now();
        let stored_name = crate::blob::sanitize_name(original_name);
        let relpath = BlobStore::document_path(category, created_at, id.as_str(), original_name);
        let hash = self.blob.save(&relpath, bytes)?;

        let transfer_id = opts.transfer_id.clone();
        let status = opts.status.unwrap_or(DocumentStatus::Draft);
        let result = self.db.with_tx(|tx| {
            let transfer_id = match &transfer_id {
                Some(existing) => existing.clone(),
                None => {
                    // Stub transfer so the document always has an owner.
                    let stub = NewTransfer {
                        id: TransferId::generate(),
                        transfer_type: TransferType::Outgoing,
                        status: TransferStatus::Pending,
                        code: None,
                        sender: None,
                        transport: None,
                        metadata: TransferMetadata::default(),
                    };
                    transfers::insert(tx, &stub)?;
                    stub.id
                }
            };
            documents::insert(
                tx,
                &NewDocument {
                    id: id.clone(),
                    transfer_id,
                    file_name: original_name.to_string(),
                    stored_name: stored_name.clone(),
                    size: bytes.len() as u64,
                    hash: hash.clone(),
                    status,
                    category,
                    uploaded_by: opts.uploaded_by.clone(),
                    tags: opts.tags.clone(),
                    version: 1,
                    previous_version_id: None,
                },
            )?;
            documents::find(tx, &id)?
                .ok_or_else(|| crate::db::StoreError::not_found("document", id.as_str()))
        });

        match result {
            Ok(row) => {
                tracing::info!(document = %row.id, category = category.as_str(), size = bytes.len(), "document stored");
                Ok(row)
            }
            Err(e) => {
                // The row never landed; do not leave orphan bytes.
                if let Err(cleanup) = self.blob.delete(&relpath) {
                    tracing::warn!(error = %cleanup, "failed to clean up blob after insert failure");
                }
                Err(e.into())
            }
        }
    }

    /// Loads a document's metadata and verified bytes. The blob is
    /// located by probing the document's own category first, then the
    /// others under the same creation year/month.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id or missing
    /// bytes, [`ApiError::Storage`] for checksum failures.
    pub fn get_document(&self, id: &DocumentId) -> Result<DocumentWithData, ApiError> {
        let document = self.find_row(id)?;
        let data = self.read_bytes(&document)?;
        Ok(DocumentWithData { document, data })
    }

    fn find_row(&self, id: &DocumentId) -> Result<DocumentRow, ApiError> {
        self.db
            .with_conn(|conn| documents::find(conn, id))?
            .ok_or_else(|| ApiError::not_found("document", id.as_str()))
    }

    fn read_bytes(&self, document: &DocumentRow) -> Result<Vec<u8>, ApiError> {
        let mut categories = vec![document.category];
        categories.extend(
            DocumentCategory::ALL
                .into_iter()
                .filter(|c| *c != document.category),
        );
        for category in categories {
            let relpath = BlobStore::document_path(
                category,
                document.created_at,
                document.id.as_str(),
                &document.stored_name,
            );
            match self.blob.read(&relpath, Some(&document.hash)) {
                Ok(bytes) => return Ok(bytes),
                Err(BlobError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(ApiError::not_found("document", document.id.as_str()))
    }

    /// Advances a document's status. Reaching `signed` or `archived`
    /// physically moves the bytes into the matching category tree
    /// (copy, then delete the old path, rolling the copy back if the
    /// delete fails).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id or
    /// [`ApiError::Storage`] when the move cannot complete.
    pub fn update_status(
        &self,
        id: &DocumentId,
        status: DocumentStatus,
        signed_by: Option<&str>,
    ) -> Result<DocumentRow, ApiError> {
        let document = self.find_row(id)?;
        let target_category = match status {
            DocumentStatus::Signed => Some(DocumentCategory::Signed),
            DocumentStatus::Archived => Some(DocumentCategory::Archived),
            _ => None,
        };

        if let Some(new_category) = target_category
            && new_category != document.category
        {
            self.move_bytes(&document, new_category)?;
            self.db
                .with_conn(|conn| documents::set_category(conn, id, new_category))?;
        }

        self.db
            .with_conn(|conn| documents::set_status(conn, id, status, signed_by))?;
        self.find_row(id)
    }

    fn move_bytes(
        &self,
        document: &DocumentRow,
        new_category: DocumentCategory,
    ) -> Result<(), ApiError> {
        let old_path = BlobStore::document_path(
            document.category,
            document.created_at,
            document.id.as_str(),
            &document.stored_name,
        );
        let new_path = BlobStore::document_path(
            new_category,
            document.created_at,
            document.id.as_str(),
            &document.stored_name,
        );
        let bytes = self.blob.read(&old_path, Some(&document.hash))?;
        self.blob.save(&new_path, &bytes)?;
        if let Err(e) = self.blob.delete(&old_path) {
            // Roll the copy back so exactly one location holds the bytes.
            if let Err(rollback) = self.blob.delete(&new_path) {
                tracing::warn!(error = %rollback, "rollback of category move copy failed");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Searches documents.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Storage`] on engine failure.
    pub fn search(&self, filter: &DocumentFilter) -> Result<Vec<DocumentRow>, ApiError> {
        Ok(self.db.with_conn(|conn| documents::search(conn, filter))?)
    }

    /// Stores a new version of an existing document.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] when the base document is
    /// unknown.
    pub fn create_version(
        &self,
        id: &DocumentId,
        bytes: &[u8],
        uploaded_by: Option<String>,
    ) -> Result<DocumentRow, ApiError> {
        let base = self.find_row(id)?;
        let new_id = DocumentId::generate();
        let created_at = Timestamp::now();
        let relpath = BlobStore::document_path(
            base.category,
            created_at,
            new_id.as_str(),
            &base.file_name,
        );
        let hash = self.blob.save(&relpath, bytes)?;

        let result = self.db.with_tx(|tx| {
            documents::insert(
                tx,
                &NewDocument {
                    id: new_id.clone(),
                    transfer_id: base.transfer_id.clone(),
                    file_name: base.file_name.clone(),
                    stored_name: base.stored_name.clone(),
                    size: bytes.len() as u64,
                    hash: hash.clone(),
                    status: base.status,
                    category: base.category,
                    uploaded_by: uploaded_by.clone(),
                    tags: base.tags.clone(),
                    version: base.version + 1,
                    previous_version_id: Some(base.id.clone()),
                },
            )?;
            documents::find(tx, &new_id)?
                .ok_or_else(|| crate::db::StoreError::not_found("document", new_id.as_str()))
        });
        match result {
            Ok(row) => Ok(row),
            Err(e) => {
                if let Err(cleanup) = self.blob.delete(&relpath) {
                    tracing::warn!(error = %cleanup, "failed to clean up version blob");
                }
                Err(e.into())
            }
        }
    }

    /// Walks the version chain, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id.
    pub fn get_versions(&self, id: &DocumentId) -> Result<Vec<DocumentRow>, ApiError> {
        Ok(self.db.with_conn(|conn| documents::versions(conn, id))?)
    }

    /// Deletes a document. Soft delete sets status `deleted`; a
    /// permanent delete also removes the row and the bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id.
    pub fn delete(&self, id: &DocumentId, permanent: bool) -> Result<(), ApiError> {
        let document = self.find_row(id)?;
        if permanent {
            let relpath = BlobStore::document_path(
                document.category,
                document.created_at,
                document.id.as_str(),
                &document.stored_name,
            );
            match self.blob.delete(&relpath) {
                Ok(()) | Err(BlobError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.db.with_conn(|conn| documents::delete(conn, id))?;
        } else {
            self.db.with_conn(|conn| {
                documents::set_status(conn, id, DocumentStatus::Deleted, None)
            })?;
        }
        Ok(())
    }
}
