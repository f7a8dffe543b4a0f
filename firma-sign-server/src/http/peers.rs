//! `/api/peers` handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;

use firma_sign_proto::ids::{PeerId, Timestamp};

use crate::db::messages::HistoryPage;
use crate::db::transfers::TransferRow;
use crate::error::ApiError;
use crate::http::AppState;
use crate::http::dto::{
    ConnectPeerDto, DiscoverDto, MarkReadDto, PeerTransferDto, SendMessageDto,
};
use crate::services::peers::{ConnectOptions, DiscoverFilter};

fn transfer_json(row: &TransferRow) -> serde_json::Value {
    json!({
        "transferId": row.id.to_string(),
        "type": row.transfer_type.as_str(),
        "status": row.status.as_str(),
        "transport": row.transport,
        "createdAt": row.created_at.as_millis(),
    })
}

/// `POST /api/peers/discover`
pub async fn discover(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DiscoverDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let peers = state
        .peers
        .discover(&DiscoverFilter {
            transports: body.transports,
            query: body.query,
            online_only: body.filters.online,
            verified_only: body.filters.verified,
        })
        .await?;
    Ok(Json(json!({ "peers": peers })))
}

/// `GET /api/peers/:id`
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let details = state.peers.get_details(&PeerId::new(id))?;
    Ok(Json(json!({
        "peerId": details.peer.id.to_string(),
        "displayName": details.peer.display_name,
        "avatar": details.peer.avatar,
        "status": details.peer.status.as_str(),
        "trustLevel": details.peer.trust_level.as_str(),
        "lastSeen": details.peer.last_seen.map(|t| t.as_millis()),
        "publicKey": details.peer.public_key,
        "metadata": details.peer.metadata,
        "identifiers": details.identifiers.iter().map(|i| json!({
            "transport": i.transport,
            "identifier": i.identifier,
            "verified": i.verified,
        })).collect::<Vec<_>>(),
        "transfers": details.transfers,
    })))
}

/// `POST /api/peers/:id/connect`
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ConnectPeerDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.transport.is_empty() {
        return Err(ApiError::invalid("transport", "must not be empty"));
    }
    let outcome = state
        .peers
        .connect(
            &PeerId::new(id),
            &ConnectOptions {
                transport: body.transport,
                fallback_transports: body.fallback_transports,
            },
        )
        .await?;
    Ok(Json(serde_json::to_value(&outcome).unwrap_or_default()))
}

/// `POST /api/peers/:id/disconnect`
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.peers.disconnect(&PeerId::new(id)).await?;
    Ok(Json(json!({ "status": "disconnected" })))
}

/// `POST /api/peers/:id/transfers`
pub async fn send_transfer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PeerTransferDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.transport.is_empty() {
        return Err(ApiError::invalid("transport", "must not be empty"));
    }
    let documents = body.parse_documents()?;
    let created = state
        .peers
        .send_transfer(
            &PeerId::new(id),
            documents,
            body.transport,
            body.fallback_transports,
        )
        .await?;
    Ok(Json(json!({
        "transferId": created.transfer_id,
        "code": created.code,
        "status": created.status,
    })))
}

/// Query string of `GET /api/peers/:id/transfers`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PeerTransfersQuery {
    /// `sent` or `received`.
    #[serde(rename = "type")]
    pub direction: Option<String>,
}

/// `GET /api/peers/:id/transfers`
pub async fn list_transfers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PeerTransfersQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(direction) = query.direction.as_deref()
        && direction != "sent"
        && direction != "received"
    {
        return Err(ApiError::invalid(
            "type",
            format!("expected sent or received, got {direction:?}"),
        ));
    }
    let rows = state
        .peers
        .get_peer_transfers(&PeerId::new(id), query.direction.as_deref())?;
    Ok(Json(json!({
        "transfers": rows.iter().map(transfer_json).collect::<Vec<_>>(),
    })))
}

/// `POST /api/peers/:id/messages`
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let options = body.parse()?;
    let receipt = state.messages.send(&PeerId::new(id), options)?;
    Ok(Json(serde_json::to_value(&receipt).unwrap_or_default()))
}

/// Query string of `GET /api/peers/:id/messages`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MessagesQuery {
    /// Page size.
    pub limit: Option<u32>,
    /// Only messages created strictly before this instant (millis).
    pub before: Option<u64>,
    /// Only messages created strictly after this instant (millis).
    pub after: Option<u64>,
}

/// `GET /api/peers/:id/messages`
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let history = state.messages.history(
        &PeerId::new(id),
        &HistoryPage {
            before: query.before.map(Timestamp::from_millis),
            after: query.after.map(Timestamp::from_millis),
            limit: query.limit,
        },
    )?;
    Ok(Json(json!({
        "messages": history.messages.iter().map(|m| json!({
            "messageId": m.id.to_string(),
            "from": m.from_peer.to_string(),
            "to": m.to_peer.to_string(),
            "content": m.content,
            "type": m.message_type.as_str(),
            "transport": m.transport,
            "direction": m.direction.as_str(),
            "status": m.status.as_str(),
            "attachments": m.attachments,
            "encrypted": m.encrypted,
            "sentAt": m.sent_at.map(|t| t.as_millis()),
            "deliveredAt": m.delivered_at.map(|t| t.as_millis()),
            "readAt": m.read_at.map(|t| t.as_millis()),
            "createdAt": m.created_at.as_millis(),
        })).collect::<Vec<_>>(),
        "hasMore": history.has_more,
    })))
}

/// `POST /api/peers/:id/messages/read`
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MarkReadDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ids = body.parse()?;
    let receipt = state.messages.mark_read(&PeerId::new(id), ids.as_deref())?;
    Ok(Json(serde_json::to_value(&receipt).unwrap_or_default()))
}
