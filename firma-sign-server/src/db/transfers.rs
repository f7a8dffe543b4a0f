//! Transfer repository.

use rusqlite::{Connection, OptionalExtension, Row, params};

use firma_sign_proto::ids::{Timestamp, TransferId};
use firma_sign_proto::transfer::{SenderInfo, TransferMetadata, TransferStatus, TransferType};

use super::{StoreError, parse_enum, ts_from_db, ts_to_db};

/// A stored transfer.
#[derive(Debug, Clone)]
pub struct TransferRow {
    /// Transfer id.
    pub id: TransferId,
    /// Direction relative to the local node.
    pub transfer_type: TransferType,
    /// Lifecycle state.
    pub status: TransferStatus,
    /// Human code, when issued.
    pub code: Option<String>,
    /// Snapshot of the sender, for incoming transfers.
    pub sender: Option<SenderInfo>,
    /// Transport the transfer was created for or arrived on.
    pub transport: Option<String>,
    /// Free-form metadata.
    pub metadata: TransferMetadata,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

/// Fields for creating a transfer.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    /// Transfer id.
    pub id: TransferId,
    /// Direction relative to the local node.
    pub transfer_type: TransferType,
    /// Initial status.
    pub status: TransferStatus,
    /// Human code, when issued.
    pub code: Option<String>,
    /// Snapshot of the sender.
    pub sender: Option<SenderInfo>,
    /// Transport name.
    pub transport: Option<String>,
    /// Free-form metadata.
    pub metadata: TransferMetadata,
}

/// Filter for [`list`].
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    /// Restrict to a direction.
    pub transfer_type: Option<TransferType>,
    /// Restrict to a status.
    pub status: Option<TransferStatus>,
    /// Page size (default 50).
    pub limit: Option<u32>,
    /// Page offset.
    pub offset: Option<u32>,
}

const COLUMNS: &str = "id, type, status, code, sender, transport, metadata, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<TransferRow> {
    let transfer_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let sender: Option<String> = row.get(4)?;
    let metadata: String = row.get(6)?;
    Ok(TransferRow {
        id: TransferId::new(row.get::<_, String>(0)?),
        transfer_type: parse_enum(1, &transfer_type, TransferType::parse)?,
        status: parse_enum(2, &status, TransferStatus::parse)?,
        code: row.get(3)?,
        sender: sender.and_then(|s| serde_json::from_str(&s).ok()),
        transport: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: ts_from_db(row.get(7)?),
        updated_at: ts_from_db(row.get(8)?),
    })
}

/// Inserts a transfer.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] for a duplicate id.
pub fn insert(conn: &Connection, transfer: &NewTransfer) -> Result<(), StoreError> {
    let now = ts_to_db(Timestamp::now());
    let sender = transfer
        .sender
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Internal(e.to_string()))?;
    let metadata = serde_json::to_string(&transfer.metadata)
        .map_err(|e| StoreError::Internal(e.to_string()))?;
    conn.execute(
        &format!("INSERT INTO transfers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)"),
        params![
            transfer.id.as_str(),
            transfer.transfer_type.as_str(),
            transfer.status.as_str(),
            transfer.code,
            sender,
            transfer.transport,
            metadata,
            now,
        ],
    )?;
    Ok(())
}

/// Looks a transfer up by id.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find(conn: &Connection, id: &TransferId) -> Result<Option<TransferRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM transfers WHERE id = ?1"),
        [id.as_str()],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Lists transfers matching the filter, newest first.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn list(conn: &Connection, filter: &TransferFilter) -> Result<Vec<TransferRow>, StoreError> {
    let limit = i64::from(filter.limit.unwrap_or(50));
    let offset = i64::from(filter.offset.unwrap_or(0));
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM transfers
         WHERE (?1 IS NULL OR type = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = stmt.query_map(
        params![
            filter.transfer_type.map(|t| t.as_str()),
            filter.status.map(|s| s.as_str()),
            limit,
            offset,
        ],
        from_row,
    )?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Advances the transfer status, enforcing the state machine.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id and
/// [`StoreError::Constraint`] for an illegal transition.
pub fn set_status(
    conn: &Connection,
    id: &TransferId,
    next: TransferStatus,
) -> Result<TransferRow, StoreError> {
    let Some(current) = find(conn, id)? else {
        return Err(StoreError::not_found("transfer", id.as_str()));
    };
    if !current.status.can_transition_to(next) {
        return Err(StoreError::Constraint {
            column: format!(
                "transfers.status: {} -> {}",
                current.status.as_str(),
                next.as_str()
            ),
        });
    }
    conn.execute(
        "UPDATE transfers SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), next.as_str(), ts_to_db(Timestamp::now())],
    )?;
    find(conn, id)?.ok_or_else(|| StoreError::not_found("transfer", id.as_str()))
}

/// Replaces the transfer metadata blob.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id.
pub fn set_metadata(
    conn: &Connection,
    id: &TransferId,
    metadata: &TransferMetadata,
) -> Result<(), StoreError> {
    let encoded =
        serde_json::to_string(metadata).map_err(|e| StoreError::Internal(e.to_string()))?;
    let updated = conn.execute(
        "UPDATE transfers SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), encoded, ts_to_db(Timestamp::now())],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("transfer", id.as_str()));
    }
    Ok(())
}

/// Deletes a transfer; documents and recipients cascade.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id.
pub fn delete(conn: &Connection, id: &TransferId) -> Result<(), StoreError> {
    let deleted = conn.execute("DELETE FROM transfers WHERE id = ?1", [id.as_str()])?;
    if deleted == 0 {
        return Err(StoreError::not_found("transfer", id.as_str()));
    }
    Ok(())
}

/// Lists outgoing transfers addressed to any of the given recipient
/// identifiers, newest first.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_sent_to_identifiers(
    conn: &Connection,
    identifiers: &[String],
) -> Result<Vec<TransferRow>, StoreError> {
    if identifiers.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = (1..=identifiers.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT t.id, t.type, t.status, t.code, t.sender, t.transport, t.metadata,
                t.created_at, t.updated_at
         FROM transfers t
         JOIN recipients r ON r.transfer_id = t.id
         WHERE t.type = 'outgoing' AND r.identifier IN ({placeholders})
         ORDER BY t.created_at DESC, t.id DESC"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(identifiers.iter().map(String::as_str)),
        from_row,
    )?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Lists incoming transfers whose sender snapshot names `sender_id`,
/// newest first.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_received_from_sender(
    conn: &Connection,
    sender_id: &str,
) -> Result<Vec<TransferRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM transfers
         WHERE type = 'incoming' AND json_extract(sender, '$.senderId') = ?1
         ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map([sender_id], from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Looks a transfer up by its canonical human code.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_by_code(conn: &Connection, code: &str) -> Result<Option<TransferRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM transfers WHERE code = ?1"),
        [code],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}
