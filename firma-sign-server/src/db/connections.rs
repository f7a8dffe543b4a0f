//! Peer connection repository.
//!
//! Invariant: at most one open row per (local, remote, transport)
//! triple. [`open`] closes any stale open row before inserting, and
//! every failure path must call [`close`] so rows are not leaked.

use rusqlite::{Connection, OptionalExtension, Row, params};

use firma_sign_proto::ids::{PeerId, Timestamp};
use firma_sign_proto::peer::{ConnectionDirection, ConnectionStatus};

use super::{StoreError, parse_enum, ts_from_db, ts_to_db};

/// A stored peer connection.
#[derive(Debug, Clone)]
pub struct ConnectionRow {
    /// Row id.
    pub id: i64,
    /// Local peer.
    pub local_peer: PeerId,
    /// Remote peer.
    pub remote_peer: PeerId,
    /// Transport name.
    pub transport: String,
    /// Who initiated.
    pub direction: ConnectionDirection,
    /// Connection state.
    pub status: ConnectionStatus,
    /// When the connection was established.
    pub connected_at: Option<Timestamp>,
    /// When the connection closed.
    pub disconnected_at: Option<Timestamp>,
}

const COLUMNS: &str = "id, local_peer, remote_peer, transport, direction, status, \
                       connected_at, disconnected_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ConnectionRow> {
    let direction: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(ConnectionRow {
        id: row.get(0)?,
        local_peer: PeerId::new(row.get::<_, String>(1)?),
        remote_peer: PeerId::new(row.get::<_, String>(2)?),
        transport: row.get(3)?,
        direction: parse_enum(4, &direction, ConnectionDirection::parse)?,
        status: parse_enum(5, &status, ConnectionStatus::parse)?,
        connected_at: row.get::<_, Option<i64>>(6)?.map(ts_from_db),
        disconnected_at: row.get::<_, Option<i64>>(7)?.map(ts_from_db),
    })
}

/// Opens a connection row with status `connected`, closing any stale
/// open row for the same triple first.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn open(
    conn: &Connection,
    local: &PeerId,
    remote: &PeerId,
    transport: &str,
    direction: ConnectionDirection,
) -> Result<ConnectionRow, StoreError> {
    let now = ts_to_db(Timestamp::now());
    conn.execute(
        "UPDATE peer_connections SET status = 'disconnected', disconnected_at = ?4, updated_at = ?4
         WHERE local_peer = ?1 AND remote_peer = ?2 AND transport = ?3
           AND status IN ('connecting', 'connected')",
        params![local.as_str(), remote.as_str(), transport, now],
    )?;
    conn.execute(
        "INSERT INTO peer_connections
             (local_peer, remote_peer, transport, direction, status, connected_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'connected', ?5, ?5, ?5)",
        params![
            local.as_str(),
            remote.as_str(),
            transport,
            direction.as_str(),
            now
        ],
    )?;
    find_open(conn, local, remote, transport)?
        .ok_or_else(|| StoreError::Internal("connection row vanished after insert".into()))
}

/// Closes the open row for a triple with the given terminal status.
///
/// Returns `true` when an open row existed.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn close(
    conn: &Connection,
    local: &PeerId,
    remote: &PeerId,
    transport: &str,
    status: ConnectionStatus,
) -> Result<bool, StoreError> {
    debug_assert!(!status.is_open());
    let now = ts_to_db(Timestamp::now());
    let updated = conn.execute(
        "UPDATE peer_connections SET status = ?4, disconnected_at = ?5, updated_at = ?5
         WHERE local_peer = ?1 AND remote_peer = ?2 AND transport = ?3
           AND status IN ('connecting', 'connected')",
        params![local.as_str(), remote.as_str(), transport, status.as_str(), now],
    )?;
    Ok(updated > 0)
}

/// Returns the open row for a triple, if any.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_open(
    conn: &Connection,
    local: &PeerId,
    remote: &PeerId,
    transport: &str,
) -> Result<Option<ConnectionRow>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM peer_connections
             WHERE local_peer = ?1 AND remote_peer = ?2 AND transport = ?3
               AND status IN ('connecting', 'connected')
             ORDER BY id DESC LIMIT 1"
        ),
        params![local.as_str(), remote.as_str(), transport],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Returns every open connection involving a remote peer.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn open_for_peer(conn: &Connection, remote: &PeerId) -> Result<Vec<ConnectionRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM peer_connections
         WHERE remote_peer = ?1 AND status IN ('connecting', 'connected')
         ORDER BY id"
    ))?;
    let rows = stmt.query_map([remote.as_str()], from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn open_then_close_round_trip() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let local = PeerId::new("self");
            let remote = PeerId::new("bob");
            let row = open(conn, &local, &remote, "p2p", ConnectionDirection::Outbound)?;
            assert_eq!(row.status, ConnectionStatus::Connected);

            assert!(close(conn, &local, &remote, "p2p", ConnectionStatus::Disconnected)?);
            assert!(find_open(conn, &local, &remote, "p2p")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reopen_keeps_exactly_one_open_row() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let local = PeerId::new("self");
            let remote = PeerId::new("bob");
            open(conn, &local, &remote, "p2p", ConnectionDirection::Outbound)?;
            open(conn, &local, &remote, "p2p", ConnectionDirection::Outbound)?;

            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM peer_connections
                     WHERE local_peer = 'self' AND remote_peer = 'bob' AND transport = 'p2p'
                       AND status IN ('connecting', 'connected')",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn close_without_open_row_reports_false() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let closed = close(
                conn,
                &PeerId::new("self"),
                &PeerId::new("ghost"),
                "p2p",
                ConnectionStatus::Failed,
            )?;
            assert!(!closed);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn open_for_peer_spans_transports() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let local = PeerId::new("self");
            let remote = PeerId::new("bob");
            open(conn, &local, &remote, "p2p", ConnectionDirection::Outbound)?;
            open(conn, &local, &remote, "email", ConnectionDirection::Outbound)?;
            assert_eq!(open_for_peer(conn, &remote)?.len(), 2);
            Ok(())
        })
        .unwrap();
    }
}
