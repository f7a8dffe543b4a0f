//! `/api/connections` handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::json;

use crate::db::transport_configs;
use crate::error::ApiError;
use crate::events::Event;
use crate::http::AppState;
use crate::http::dto::InitializeConnectionsDto;
use crate::transport::TransportStatus;

/// `POST /api/connections/initialize`
pub async fn initialize(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitializeConnectionsDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    body.validate()?;
    let results = state
        .registry
        .initialize(&body.transports, &body.config)
        .await;

    for (name, status) in &results {
        let config = body
            .config
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let (status_text, initialized) = match status {
            TransportStatus::Active => ("active".to_string(), true),
            TransportStatus::Error { error } => (format!("error: {error}"), false),
            other => (format!("{other:?}").to_lowercase(), false),
        };
        state.db.with_conn(|conn| {
            transport_configs::upsert(conn, name, &config, &status_text, initialized)
        })?;
        match status {
            TransportStatus::Active => state.bus.publish(&Event::TransportInitialized {
                transport: name.clone(),
            }),
            TransportStatus::Error { error } => state.bus.publish(&Event::TransportError {
                transport: name.clone(),
                error: error.clone(),
            }),
            _ => {}
        }
    }

    Ok(Json(json!({
        "transports": results
            .iter()
            .map(|(name, status)| json!({ "name": name, "state": status }))
            .collect::<Vec<_>>(),
    })))
}

/// `GET /api/connections/status`
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let statuses = state.registry.statuses();
    Json(json!({
        "transports": statuses
            .iter()
            .map(|(name, status)| json!({ "name": name, "state": status }))
            .collect::<Vec<_>>(),
        "activeTransports": state.registry.active_names(),
        "connectedClients": state.gateway.clients().len(),
    }))
}
