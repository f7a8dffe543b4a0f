//! Group and membership repository.
//!
//! The owner-safety invariant lives here: the owner is always a member
//! with role `admin`, cannot be removed, and cannot be demoted unless
//! ownership is transferred first.

use rusqlite::{Connection, OptionalExtension, Row, params};

use firma_sign_proto::ids::{GroupId, PeerId, Timestamp};
use firma_sign_proto::peer::{GroupRole, GroupSettings};

use super::{StoreError, parse_enum, ts_from_db, ts_to_db};

/// A stored group.
#[derive(Debug, Clone)]
pub struct GroupRow {
    /// Group id.
    pub id: GroupId,
    /// Group name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Owning peer.
    pub owner_peer: PeerId,
    /// Behavior settings.
    pub settings: GroupSettings,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

/// A group membership row.
#[derive(Debug, Clone)]
pub struct GroupMemberRow {
    /// The group.
    pub group_id: GroupId,
    /// The member peer.
    pub peer_id: PeerId,
    /// Member role.
    pub role: GroupRole,
    /// When the peer joined.
    pub joined_at: Timestamp,
}

const COLUMNS: &str = "id, name, description, owner_peer, settings, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<GroupRow> {
    let id: String = row.get(0)?;
    let settings: String = row.get(4)?;
    Ok(GroupRow {
        id: GroupId::parse(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_peer: PeerId::new(row.get::<_, String>(3)?),
        settings: serde_json::from_str(&settings).unwrap_or_default(),
        created_at: ts_from_db(row.get(5)?),
        updated_at: ts_from_db(row.get(6)?),
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<GroupMemberRow> {
    let group_id: String = row.get(0)?;
    let role: String = row.get(2)?;
    Ok(GroupMemberRow {
        group_id: GroupId::parse(&group_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        peer_id: PeerId::new(row.get::<_, String>(1)?),
        role: parse_enum(2, &role, GroupRole::parse)?,
        joined_at: ts_from_db(row.get(3)?),
    })
}

/// Inserts a group and its owner as an admin member.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] for a duplicate id.
pub fn insert(
    conn: &Connection,
    id: &GroupId,
    name: &str,
    description: Option<&str>,
    owner: &PeerId,
    settings: &GroupSettings,
) -> Result<(), StoreError> {
    let now = ts_to_db(Timestamp::now());
    let settings =
        serde_json::to_string(settings).map_err(|e| StoreError::Internal(e.to_string()))?;
    conn.execute(
        &format!("INSERT INTO groups ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)"),
        params![id.to_string(), name, description, owner.as_str(), settings, now],
    )?;
    conn.execute(
        "INSERT INTO group_members (group_id, peer_id, role, joined_at) VALUES (?1, ?2, 'admin', ?3)",
        params![id.to_string(), owner.as_str(), now],
    )?;
    Ok(())
}

/// Looks a group up by id.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find(conn: &Connection, id: &GroupId) -> Result<Option<GroupRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM groups WHERE id = ?1"),
        [id.to_string()],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Deletes a group; members cascade.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id.
pub fn delete(conn: &Connection, id: &GroupId) -> Result<(), StoreError> {
    let deleted = conn.execute("DELETE FROM groups WHERE id = ?1", [id.to_string()])?;
    if deleted == 0 {
        return Err(StoreError::not_found("group", id.to_string()));
    }
    Ok(())
}

/// Adds a member.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] when the peer is already a member.
pub fn add_member(
    conn: &Connection,
    group_id: &GroupId,
    peer_id: &PeerId,
    role: GroupRole,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO group_members (group_id, peer_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            group_id.to_string(),
            peer_id.as_str(),
            role.as_str(),
            ts_to_db(Timestamp::now()),
        ],
    )?;
    Ok(())
}

/// Removes a member. The owner cannot be removed.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] when the peer is the owner, or
/// [`StoreError::NotFound`] when the membership does not exist.
pub fn remove_member(
    conn: &Connection,
    group_id: &GroupId,
    peer_id: &PeerId,
) -> Result<(), StoreError> {
    let Some(group) = find(conn, group_id)? else {
        return Err(StoreError::not_found("group", group_id.to_string()));
    };
    if group.owner_peer == *peer_id {
        return Err(StoreError::Constraint {
            column: "group_members.peer_id: owner cannot be removed".into(),
        });
    }
    let deleted = conn.execute(
        "DELETE FROM group_members WHERE group_id = ?1 AND peer_id = ?2",
        params![group_id.to_string(), peer_id.as_str()],
    )?;
    if deleted == 0 {
        return Err(StoreError::not_found("member", peer_id.as_str()));
    }
    Ok(())
}

/// Changes a member's role. The owner cannot be demoted.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] when demoting the owner, or
/// [`StoreError::NotFound`] when the membership does not exist.
pub fn update_role(
    conn: &Connection,
    group_id: &GroupId,
    peer_id: &PeerId,
    role: GroupRole,
) -> Result<(), StoreError> {
    let Some(group) = find(conn, group_id)? else {
        return Err(StoreError::not_found("group", group_id.to_string()));
    };
    if group.owner_peer == *peer_id && role != GroupRole::Admin {
        return Err(StoreError::Constraint {
            column: "group_members.role: owner must stay admin".into(),
        });
    }
    let updated = conn.execute(
        "UPDATE group_members SET role = ?3 WHERE group_id = ?1 AND peer_id = ?2",
        params![group_id.to_string(), peer_id.as_str(), role.as_str()],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("member", peer_id.as_str()));
    }
    Ok(())
}

/// Transfers ownership to an existing member, promoting them to admin.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] when the group or the new owner's
/// membership does not exist.
pub fn transfer_ownership(
    conn: &Connection,
    group_id: &GroupId,
    new_owner: &PeerId,
) -> Result<(), StoreError> {
    if find_member(conn, group_id, new_owner)?.is_none() {
        return Err(StoreError::not_found("member", new_owner.as_str()));
    }
    conn.execute(
        "UPDATE group_members SET role = 'admin' WHERE group_id = ?1 AND peer_id = ?2",
        params![group_id.to_string(), new_owner.as_str()],
    )?;
    let updated = conn.execute(
        "UPDATE groups SET owner_peer = ?2, updated_at = ?3 WHERE id = ?1",
        params![
            group_id.to_string(),
            new_owner.as_str(),
            ts_to_db(Timestamp::now())
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("group", group_id.to_string()));
    }
    Ok(())
}

/// Returns all members of a group, oldest join first.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn members(conn: &Connection, group_id: &GroupId) -> Result<Vec<GroupMemberRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT group_id, peer_id, role, joined_at FROM group_members
         WHERE group_id = ?1 ORDER BY joined_at, id",
    )?;
    let rows = stmt.query_map([group_id.to_string()], member_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Looks up a single membership.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_member(
    conn: &Connection,
    group_id: &GroupId,
    peer_id: &PeerId,
) -> Result<Option<GroupMemberRow>, StoreError> {
    conn.query_row(
        "SELECT group_id, peer_id, role, joined_at FROM group_members
         WHERE group_id = ?1 AND peer_id = ?2",
        params![group_id.to_string(), peer_id.as_str()],
        member_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}
