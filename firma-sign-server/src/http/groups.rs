//! `/api/groups` handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde_json::json;

use firma_sign_proto::ids::{GroupId, PeerId};

use crate::error::ApiError;
use crate::http::AppState;
use crate::http::dto::{AddMemberDto, CreateGroupDto, GroupSendDto};

fn parse_group_id(raw: &str) -> Result<GroupId, ApiError> {
    GroupId::parse(raw).map_err(|_| ApiError::not_found("group", raw))
}

/// `POST /api/groups`
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateGroupDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = body
        .owner_id
        .clone()
        .map_or_else(|| state.messages.local_peer().clone(), PeerId::new);
    let request = body.parse()?;
    let group = state.groups.create(&owner, &request)?;
    Ok(Json(json!({
        "groupId": group.id.to_string(),
        "name": group.name,
        "ownerId": group.owner_peer.to_string(),
        "settings": group.settings,
        "createdAt": group.created_at.as_millis(),
    })))
}

/// `GET /api/groups/:id`
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id = parse_group_id(&id)?;
    let group = state.groups.get(&group_id)?;
    let members = state.groups.members(&group_id)?;
    Ok(Json(json!({
        "groupId": group.id.to_string(),
        "name": group.name,
        "description": group.description,
        "ownerId": group.owner_peer.to_string(),
        "settings": group.settings,
        "memberCount": members.len(),
        "createdAt": group.created_at.as_millis(),
    })))
}

/// `GET /api/groups/:id/members`
pub async fn members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id = parse_group_id(&id)?;
    let members = state.groups.members(&group_id)?;
    Ok(Json(json!({
        "members": members.iter().map(|m| json!({
            "peerId": m.peer_id.to_string(),
            "role": m.role.as_str(),
            "joinedAt": m.joined_at.as_millis(),
        })).collect::<Vec<_>>(),
    })))
}

/// `POST /api/groups/:id/send`
pub async fn send(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<GroupSendDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id = parse_group_id(&id)?;
    let sender = body
        .sender_id
        .clone()
        .map_or_else(|| state.messages.local_peer().clone(), PeerId::new);
    let request = body.parse()?;
    let results = state.groups.send_to_group(&group_id, &sender, &request).await?;
    Ok(Json(json!({ "results": results })))
}

/// `POST /api/groups/:id/members`
pub async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AddMemberDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id = parse_group_id(&id)?;
    let role = body.parse_role()?;
    state
        .groups
        .add_member(&group_id, &PeerId::new(body.peer_id.clone()), role)?;
    Ok(Json(json!({ "status": "added", "peerId": body.peer_id })))
}

/// `DELETE /api/groups/:id/members/:peerId`
pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((id, peer_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id = parse_group_id(&id)?;
    state.groups.remove_member(&group_id, &PeerId::new(peer_id))?;
    Ok(Json(json!({ "status": "removed" })))
}

/// `DELETE /api/groups/:id`
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id = parse_group_id(&id)?;
    state.groups.delete(&group_id)?;
    Ok(Json(json!({ "status": "deleted" })))
}
