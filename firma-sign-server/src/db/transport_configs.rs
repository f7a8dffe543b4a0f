//! Transport configuration repository.
//!
//! Stores each transport's opaque config blob and the outcome of its
//! last initialization so the registry can resume after a restart.

use rusqlite::{Connection, OptionalExtension, Row, params};

use firma_sign_proto::ids::Timestamp;

use super::{StoreError, ts_from_db, ts_to_db};

/// A stored transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfigRow {
    /// Transport name.
    pub transport: String,
    /// Opaque config blob.
    pub config: serde_json::Value,
    /// Last recorded status string (`active`, `error: …`, `shutdown`).
    pub status: String,
    /// When the transport last initialized successfully.
    pub initialized_at: Option<Timestamp>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<TransportConfigRow> {
    let config: String = row.get(1)?;
    Ok(TransportConfigRow {
        transport: row.get(0)?,
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        status: row.get(2)?,
        initialized_at: row.get::<_, Option<i64>>(3)?.map(ts_from_db),
    })
}

/// Inserts or replaces a transport's config and status.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn upsert(
    conn: &Connection,
    transport: &str,
    config: &serde_json::Value,
    status: &str,
    initialized: bool,
) -> Result<(), StoreError> {
    let initialized_at = initialized.then(|| ts_to_db(Timestamp::now()));
    conn.execute(
        "INSERT INTO transport_configs (transport, config, status, initialized_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(transport) DO UPDATE SET
             config = excluded.config,
             status = excluded.status,
             initialized_at = coalesce(excluded.initialized_at, initialized_at)",
        params![transport, config.to_string(), status, initialized_at],
    )?;
    Ok(())
}

/// Looks a transport's stored config up by name.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find(conn: &Connection, transport: &str) -> Result<Option<TransportConfigRow>, StoreError> {
    conn.query_row(
        "SELECT transport, config, status, initialized_at FROM transport_configs WHERE transport = ?1",
        [transport],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Lists all stored transport configs.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn list(conn: &Connection) -> Result<Vec<TransportConfigRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT transport, config, status, initialized_at FROM transport_configs ORDER BY transport",
    )?;
    let rows = stmt.query_map([], from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}
