//! `/api/transports` handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::json;

use crate::error::ApiError;
use crate::http::AppState;
use crate::transport::KNOWN_TRANSPORTS;

/// `GET /api/transports/available`
pub async fn available(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let statuses = state.registry.statuses();
    Json(json!({
        "known": KNOWN_TRANSPORTS,
        "registered": statuses
            .iter()
            .map(|(name, status)| json!({ "name": name, "state": status }))
            .collect::<Vec<_>>(),
    }))
}

/// `GET /api/transports/p2p/network`
pub async fn p2p_network(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state
        .registry
        .status("p2p")
        .ok_or_else(|| ApiError::TransportUnavailable("p2p".to_string()))?;
    let open = state.db.with_conn(|conn| {
        conn.query_row(
            "SELECT count(*) FROM peer_connections
             WHERE transport = 'p2p' AND status IN ('connecting', 'connected')",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map_err(crate::db::StoreError::from)
    })?;
    Ok(Json(json!({
        "transport": "p2p",
        "state": status,
        "openConnections": open,
    })))
}

/// `GET /api/transports/email/queue`
pub async fn email_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state
        .registry
        .status("email")
        .ok_or_else(|| ApiError::TransportUnavailable("email".to_string()))?;
    let queued = state.db.with_conn(|conn| {
        conn.query_row(
            "SELECT count(*) FROM recipients WHERE transport = 'email' AND status = 'pending'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map_err(crate::db::StoreError::from)
    })?;
    Ok(Json(json!({
        "transport": "email",
        "state": status,
        "queued": queued,
    })))
}
