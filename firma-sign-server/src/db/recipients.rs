//! Recipient repository.

use rusqlite::{Connection, OptionalExtension, Row, params};

use firma_sign_proto::ids::{Timestamp, TransferId};
use firma_sign_proto::transfer::RecipientStatus;

use super::{StoreError, parse_enum, ts_from_db, ts_to_db};

/// Delivery preferences for a recipient.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecipientPreferences {
    /// Transports to try, in order, when the primary fails.
    pub fallback_transports: Vec<String>,
    /// Whether to send notification messages.
    pub notification_enabled: bool,
}

/// A stored recipient.
#[derive(Debug, Clone)]
pub struct RecipientRow {
    /// Recipient id.
    pub id: String,
    /// Owning transfer.
    pub transfer_id: TransferId,
    /// Transport-specific address.
    pub identifier: String,
    /// Transport the recipient is addressed over.
    pub transport: String,
    /// Lifecycle state.
    pub status: RecipientStatus,
    /// Delivery preferences.
    pub preferences: RecipientPreferences,
    /// Last delivery error, if any.
    pub error: Option<String>,
    /// When the recipient was notified.
    pub notified_at: Option<Timestamp>,
    /// When the recipient signed.
    pub signed_at: Option<Timestamp>,
    /// Creation time.
    pub created_at: Timestamp,
}

/// Fields for creating a recipient.
#[derive(Debug, Clone)]
pub struct NewRecipient {
    /// Recipient id.
    pub id: String,
    /// Owning transfer.
    pub transfer_id: TransferId,
    /// Transport-specific address.
    pub identifier: String,
    /// Transport name.
    pub transport: String,
    /// Delivery preferences.
    pub preferences: RecipientPreferences,
}

const COLUMNS: &str = "id, transfer_id, identifier, transport, status, preferences, error, \
                       notified_at, signed_at, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<RecipientRow> {
    let status: String = row.get(4)?;
    let preferences: String = row.get(5)?;
    Ok(RecipientRow {
        id: row.get(0)?,
        transfer_id: TransferId::new(row.get::<_, String>(1)?),
        identifier: row.get(2)?,
        transport: row.get(3)?,
        status: parse_enum(4, &status, RecipientStatus::parse)?,
        preferences: serde_json::from_str(&preferences).unwrap_or_default(),
        error: row.get(6)?,
        notified_at: row.get::<_, Option<i64>>(7)?.map(ts_from_db),
        signed_at: row.get::<_, Option<i64>>(8)?.map(ts_from_db),
        created_at: ts_from_db(row.get(9)?),
    })
}

/// Inserts a recipient with status `pending`.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] for a duplicate id or a missing
/// owning transfer.
pub fn insert(conn: &Connection, recipient: &NewRecipient) -> Result<(), StoreError> {
    let preferences = serde_json::to_string(&recipient.preferences)
        .map_err(|e| StoreError::Internal(e.to_string()))?;
    conn.execute(
        "INSERT INTO recipients (id, transfer_id, identifier, transport, status, preferences, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
        params![
            recipient.id,
            recipient.transfer_id.as_str(),
            recipient.identifier,
            recipient.transport,
            preferences,
            ts_to_db(Timestamp::now()),
        ],
    )?;
    Ok(())
}

/// Looks a recipient up by id.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find(conn: &Connection, id: &str) -> Result<Option<RecipientRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM recipients WHERE id = ?1"),
        [id],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Returns all recipients of a transfer.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_by_transfer(
    conn: &Connection,
    transfer_id: &TransferId,
) -> Result<Vec<RecipientRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM recipients WHERE transfer_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map([transfer_id.as_str()], from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Finds a transfer's recipient by its transport address.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_by_identifier(
    conn: &Connection,
    transfer_id: &TransferId,
    identifier: &str,
) -> Result<Option<RecipientRow>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM recipients WHERE transfer_id = ?1 AND identifier = ?2"
        ),
        params![transfer_id.as_str(), identifier],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Updates a recipient's status, stamping `notified_at`/`signed_at` and
/// recording or clearing the delivery error.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id.
pub fn set_status(
    conn: &Connection,
    id: &str,
    status: RecipientStatus,
    error: Option<&str>,
) -> Result<(), StoreError> {
    let now = ts_to_db(Timestamp::now());
    let notified_at = matches!(status, RecipientStatus::Notified).then_some(now);
    let signed_at = matches!(status, RecipientStatus::Signed).then_some(now);
    let updated = conn.execute(
        "UPDATE recipients SET status = ?2,
             error = ?3,
             notified_at = coalesce(?4, notified_at),
             signed_at = coalesce(?5, signed_at),
             updated_at = ?6
         WHERE id = ?1",
        params![id, status.as_str(), error, notified_at, signed_at, now],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("recipient", id));
    }
    Ok(())
}

/// Counts a transfer's recipients in the given status.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn count_by_status(
    conn: &Connection,
    transfer_id: &TransferId,
    status: RecipientStatus,
) -> Result<u32, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM recipients WHERE transfer_id = ?1 AND status = ?2",
        params![transfer_id.as_str(), status.as_str()],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::db::transfers::{self, NewTransfer};
    use firma_sign_proto::transfer::{TransferMetadata, TransferStatus, TransferType};

    fn seed_transfer(conn: &Connection, id: &str) {
        transfers::insert(
            conn,
            &NewTransfer {
                id: TransferId::new(id),
                transfer_type: TransferType::Outgoing,
                status: TransferStatus::Pending,
                code: None,
                sender: None,
                transport: None,
                metadata: TransferMetadata::default(),
            },
        )
        .unwrap();
    }

    fn new_recipient(id: &str, transfer: &str, identifier: &str) -> NewRecipient {
        NewRecipient {
            id: id.into(),
            transfer_id: TransferId::new(transfer),
            identifier: identifier.into(),
            transport: "email".into(),
            preferences: RecipientPreferences::default(),
        }
    }

    #[test]
    fn recipient_requires_existing_transfer() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_conn(|conn| insert(conn, &new_recipient("r1", "missing", "bob@x")))
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }));
    }

    #[test]
    fn notify_stamps_timestamp_and_clears_error() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            insert(conn, &new_recipient("r1", "t1", "bob@x"))?;
            set_status(conn, "r1", RecipientStatus::Pending, Some("smtp timeout"))?;
            set_status(conn, "r1", RecipientStatus::Notified, None)?;

            let row = find(conn, "r1")?.unwrap();
            assert_eq!(row.status, RecipientStatus::Notified);
            assert!(row.notified_at.is_some());
            assert!(row.error.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn count_by_status_counts_only_matching() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            insert(conn, &new_recipient("r1", "t1", "bob@x"))?;
            insert(conn, &new_recipient("r2", "t1", "carol@x"))?;
            set_status(conn, "r1", RecipientStatus::Signed, None)?;

            assert_eq!(count_by_status(conn, &TransferId::new("t1"), RecipientStatus::Signed)?, 1);
            assert_eq!(
                count_by_status(conn, &TransferId::new("t1"), RecipientStatus::Pending)?,
                1
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn find_by_identifier_scopes_to_transfer() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            seed_transfer(conn, "t2");
            insert(conn, &new_recipient("r1", "t1", "bob@x"))?;
            insert(conn, &new_recipient("r2", "t2", "bob@x"))?;

            let found = find_by_identifier(conn, &TransferId::new("t1"), "bob@x")?.unwrap();
            assert_eq!(found.id, "r1");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn preferences_round_trip() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            let mut recipient = new_recipient("r1", "t1", "bob@x");
            recipient.preferences.fallback_transports = vec!["email".into(), "discord".into()];
            recipient.preferences.notification_enabled = true;
            insert(conn, &recipient)?;

            let row = find(conn, "r1")?.unwrap();
            assert_eq!(row.preferences.fallback_transports, vec!["email", "discord"]);
            assert!(row.preferences.notification_enabled);
            Ok(())
        })
        .unwrap();
    }
}
