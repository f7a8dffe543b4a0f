//! `/api/transfers` handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use firma_sign_proto::ids::{DocumentId, TransferId};
use firma_sign_proto::transfer::{TransferStatus, TransferType};

use crate::db::documents::DocumentRow;
use crate::db::recipients::RecipientRow;
use crate::db::transfers::{TransferFilter, TransferRow};
use crate::error::ApiError;
use crate::http::AppState;
use crate::http::dto::{CreateTransferDto, SignTransferDto};

/// Query string of `GET /api/transfers`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListQuery {
    /// `incoming` or `outgoing`.
    #[serde(rename = "type")]
    pub transfer_type: Option<String>,
    /// Transfer status.
    pub status: Option<String>,
    /// Page size.
    pub limit: Option<u32>,
    /// Page offset.
    pub offset: Option<u32>,
}

fn transfer_json(row: &TransferRow) -> serde_json::Value {
    json!({
        "transferId": row.id.to_string(),
        "type": row.transfer_type.as_str(),
        "status": row.status.as_str(),
        "code": row.code,
        "sender": row.sender,
        "transport": row.transport,
        "metadata": row.metadata,
        "createdAt": row.created_at.as_millis(),
        "updatedAt": row.updated_at.as_millis(),
    })
}

fn document_json(row: &DocumentRow) -> serde_json::Value {
    json!({
        "documentId": row.id.to_string(),
        "fileName": row.file_name,
        "storedName": row.stored_name,
        "size": row.size,
        "hash": row.hash,
        "status": row.status.as_str(),
        "category": row.category.as_str(),
        "signedBy": row.signed_by,
        "signedAt": row.signed_at.map(|t| t.as_millis()),
        "version": row.version,
        "previousVersionId": row.previous_version_id.as_ref().map(ToString::to_string),
    })
}

fn recipient_json(row: &RecipientRow) -> serde_json::Value {
    json!({
        "recipientId": row.id,
        "identifier": row.identifier,
        "transport": row.transport,
        "status": row.status.as_str(),
        "error": row.error,
        "notifiedAt": row.notified_at.map(|t| t.as_millis()),
        "signedAt": row.signed_at.map(|t| t.as_millis()),
    })
}

/// `POST /api/transfers/create`
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTransferDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = body.parse()?;
    let created = state.transfer_router.create_transfer(&request)?;

    // Dispatch happens off the request path; the transfer is already
    // durable and resumable.
    let router = Arc::clone(&state.transfer_router);
    let transfer_id = TransferId::new(created.transfer_id.clone());
    tokio::spawn(async move {
        if let Err(e) = router.dispatch_transfer(&transfer_id).await {
            tracing::warn!(transfer = %transfer_id, error = %e, "dispatch failed");
        }
    });

    Ok(Json(json!({
        "transferId": created.transfer_id,
        "code": created.code,
        "status": created.status,
        "documentIds": created.document_ids,
    })))
}

/// `GET /api/transfers`
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let transfer_type = query
        .transfer_type
        .as_deref()
        .map(|raw| {
            TransferType::parse(raw)
                .ok_or_else(|| ApiError::invalid("type", format!("unknown type {raw:?}")))
        })
        .transpose()?;
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            TransferStatus::parse(raw)
                .ok_or_else(|| ApiError::invalid("status", format!("unknown status {raw:?}")))
        })
        .transpose()?;

    let rows = state.transfer_router.list_transfers(&TransferFilter {
        transfer_type,
        status,
        limit: query.limit,
        offset: query.offset,
    })?;
    Ok(Json(json!({
        "transfers": rows.iter().map(transfer_json).collect::<Vec<_>>(),
    })))
}

/// `GET /api/transfers/:id`
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let detail = state.transfer_router.get_transfer(&TransferId::new(id))?;
    let mut body = transfer_json(&detail.transfer);
    body["documents"] = detail.documents.iter().map(document_json).collect();
    body["recipients"] = detail.recipients.iter().map(recipient_json).collect();
    Ok(Json(body))
}

/// `POST /api/transfers/:id/sign`
pub async fn sign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SignTransferDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = body.parse()?;
    let transfer_id = TransferId::new(id);
    let outcome = state
        .transfer_router
        .sign_documents(&transfer_id, &request)
        .await?;

    // The reciprocal transfer, when created, leaves on its own task.
    if let Some(return_id) = &outcome.return_transfer_id {
        let router = Arc::clone(&state.transfer_router);
        let return_id = TransferId::new(return_id.clone());
        tokio::spawn(async move {
            if let Err(e) = router.dispatch_transfer(&return_id).await {
                tracing::warn!(transfer = %return_id, error = %e, "return dispatch failed");
            }
        });
    }

    Ok(Json(serde_json::to_value(&outcome).unwrap_or_else(
        |_| json!({ "status": "success" }),
    )))
}

/// `GET /api/transfers/:id/documents/:docId`
pub async fn download_document(
    State(state): State<Arc<AppState>>,
    Path((transfer_id, doc_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let transfer_id = TransferId::new(transfer_id);
    let doc_id = DocumentId::new(doc_id);
    let detail = state.transfer_router.get_transfer(&transfer_id)?;
    if !detail.documents.iter().any(|d| d.id == doc_id) {
        return Err(ApiError::not_found("document", doc_id.as_str()));
    }
    let loaded = state.documents.get_document(&doc_id)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", loaded.document.stored_name),
            ),
        ],
        loaded.data,
    ))
}
