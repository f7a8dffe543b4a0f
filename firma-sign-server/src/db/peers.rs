//! Peer directory repository: peers and their per-transport identifiers.

use rusqlite::{Connection, OptionalExtension, Row, params};

use firma_sign_proto::ids::{PeerId, Timestamp};
use firma_sign_proto::peer::{PresenceStatus, TrustLevel};

use super::{StoreError, parse_enum, ts_from_db, ts_to_db};

/// A stored peer.
#[derive(Debug, Clone)]
pub struct PeerRow {
    /// Stable peer id.
    pub id: PeerId,
    /// Display name.
    pub display_name: String,
    /// Optional avatar reference.
    pub avatar: Option<String>,
    /// Last observed presence.
    pub status: PresenceStatus,
    /// Identity trust level.
    pub trust_level: TrustLevel,
    /// When the peer was last seen, if ever.
    pub last_seen: Option<Timestamp>,
    /// Optional public key (opaque).
    pub public_key: Option<String>,
    /// Open metadata map, stored as JSON text.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

/// A per-transport address for a peer.
#[derive(Debug, Clone)]
pub struct PeerIdentifierRow {
    /// Owning peer.
    pub peer_id: PeerId,
    /// Transport name.
    pub transport: String,
    /// Transport-specific address.
    pub identifier: String,
    /// Whether the identifier was verified.
    pub verified: bool,
}

/// Fields for creating a peer.
#[derive(Debug, Clone)]
pub struct NewPeer {
    /// Stable peer id.
    pub id: PeerId,
    /// Display name.
    pub display_name: String,
    /// Optional avatar reference.
    pub avatar: Option<String>,
    /// Identity trust level.
    pub trust_level: TrustLevel,
    /// Optional public key.
    pub public_key: Option<String>,
    /// Open metadata map.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<PeerRow> {
    let status: String = row.get(3)?;
    let trust: String = row.get(4)?;
    let metadata: String = row.get(7)?;
    Ok(PeerRow {
        id: PeerId::new(row.get::<_, String>(0)?),
        display_name: row.get(1)?,
        avatar: row.get(2)?,
        status: parse_enum(3, &status, PresenceStatus::parse)?,
        trust_level: parse_enum(4, &trust, TrustLevel::parse)?,
        last_seen: row.get::<_, Option<i64>>(5)?.map(ts_from_db),
        public_key: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: ts_from_db(row.get(8)?),
        updated_at: ts_from_db(row.get(9)?),
    })
}

const COLUMNS: &str = "id, display_name, avatar, status, trust_level, last_seen, \
                       public_key, metadata, created_at, updated_at";

/// Inserts a peer with presence `offline`.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] for a duplicate id.
pub fn insert(conn: &Connection, peer: &NewPeer) -> Result<(), StoreError> {
    let now = ts_to_db(Timestamp::now());
    conn.execute(
        "INSERT INTO peers (id, display_name, avatar, status, trust_level, public_key, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'offline', ?4, ?5, ?6, ?7, ?7)",
        params![
            peer.id.as_str(),
            peer.display_name,
            peer.avatar,
            peer.trust_level.as_str(),
            peer.public_key,
            serde_json::Value::Object(peer.metadata.clone()).to_string(),
            now,
        ],
    )?;
    Ok(())
}

/// Looks a peer up by id.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find(conn: &Connection, id: &PeerId) -> Result<Option<PeerRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM peers WHERE id = ?1"),
        [id.as_str()],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Lists all peers, most recently seen first.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn list(conn: &Connection) -> Result<Vec<PeerRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM peers ORDER BY last_seen DESC NULLS LAST, id"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Updates presence and bumps `last_seen`.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] when the peer does not exist.
pub fn set_presence(
    conn: &Connection,
    id: &PeerId,
    status: PresenceStatus,
) -> Result<(), StoreError> {
    let now = ts_to_db(Timestamp::now());
    let updated = conn.execute(
        "UPDATE peers SET status = ?2, last_seen = ?3, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), status.as_str(), now],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("peer", id.as_str()));
    }
    Ok(())
}

/// Updates the trust level.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] when the peer does not exist.
pub fn set_trust(conn: &Connection, id: &PeerId, trust: TrustLevel) -> Result<(), StoreError> {
    let updated = conn.execute(
        "UPDATE peers SET trust_level = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), trust.as_str(), ts_to_db(Timestamp::now())],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("peer", id.as_str()));
    }
    Ok(())
}

/// Deletes a peer (identifiers cascade).
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] when the peer does not exist.
pub fn delete(conn: &Connection, id: &PeerId) -> Result<(), StoreError> {
    let deleted = conn.execute("DELETE FROM peers WHERE id = ?1", [id.as_str()])?;
    if deleted == 0 {
        return Err(StoreError::not_found("peer", id.as_str()));
    }
    Ok(())
}

/// Attaches a per-transport identifier to a peer.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] when the (transport, identifier)
/// pair is already claimed.
pub fn add_identifier(
    conn: &Connection,
    peer_id: &PeerId,
    transport: &str,
    identifier: &str,
    verified: bool,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO peer_identifiers (peer_id, transport, identifier, verified, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            peer_id.as_str(),
            transport,
            identifier,
            i32::from(verified),
            ts_to_db(Timestamp::now()),
        ],
    )?;
    Ok(())
}

/// Returns all identifiers attached to a peer.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn identifiers(conn: &Connection, peer_id: &PeerId) -> Result<Vec<PeerIdentifierRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT peer_id, transport, identifier, verified FROM peer_identifiers
         WHERE peer_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([peer_id.as_str()], |row| {
        Ok(PeerIdentifierRow {
            peer_id: PeerId::new(row.get::<_, String>(0)?),
            transport: row.get(1)?,
            identifier: row.get(2)?,
            verified: row.get::<_, i32>(3)? != 0,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Resolves the peer owning a (transport, identifier) pair.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_by_identifier(
    conn: &Connection,
    transport: &str,
    identifier: &str,
) -> Result<Option<PeerRow>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM peers WHERE id =
             (SELECT peer_id FROM peer_identifiers WHERE transport = ?1 AND identifier = ?2)"
        ),
        params![transport, identifier],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn new_peer(id: &str) -> NewPeer {
        NewPeer {
            id: PeerId::new(id),
            display_name: format!("Peer {id}"),
            avatar: None,
            trust_level: TrustLevel::Unverified,
            public_key: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn insert_and_find_round_trip() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &new_peer("alice"))?;
            let found = find(conn, &PeerId::new("alice"))?.unwrap();
            assert_eq!(found.display_name, "Peer alice");
            assert_eq!(found.status, PresenceStatus::Offline);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn duplicate_identifier_pair_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &new_peer("alice"))?;
            insert(conn, &new_peer("bob"))?;
            add_identifier(conn, &PeerId::new("alice"), "email", "a@x.test", false)?;
            let err =
                add_identifier(conn, &PeerId::new("bob"), "email", "a@x.test", false).unwrap_err();
            assert!(matches!(err, StoreError::Constraint { .. }));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn same_peer_carries_several_identifiers() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &new_peer("alice"))?;
            add_identifier(conn, &PeerId::new("alice"), "email", "a@x.test", false)?;
            add_identifier(conn, &PeerId::new("alice"), "p2p", "12D3KooW...", true)?;
            assert_eq!(identifiers(conn, &PeerId::new("alice"))?.len(), 2);

            let resolved = find_by_identifier(conn, "p2p", "12D3KooW...")?.unwrap();
            assert_eq!(resolved.id, PeerId::new("alice"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn set_presence_bumps_last_seen() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &new_peer("alice"))?;
            set_presence(conn, &PeerId::new("alice"), PresenceStatus::Online)?;
            let found = find(conn, &PeerId::new("alice"))?.unwrap();
            assert_eq!(found.status, PresenceStatus::Online);
            assert!(found.last_seen.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn missing_peer_update_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_conn(|conn| set_presence(conn, &PeerId::new("ghost"), PresenceStatus::Online))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
