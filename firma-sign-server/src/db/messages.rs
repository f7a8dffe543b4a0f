//! Message journal repository.
//!
//! Status updates go through [`advance_status`], which enforces the
//! monotonic `pending → sent → delivered → read` chain and stamps the
//! timestamp for the reached state (plus any skipped earlier states, so
//! a later timestamp always implies the earlier ones).

use rusqlite::{Connection, OptionalExtension, Row, params};

use firma_sign_proto::ids::{MessageId, PeerId, Timestamp};
use firma_sign_proto::message::{Attachment, MessageDirection, MessageStatus, MessageType};

use super::{StoreError, parse_enum, ts_from_db, ts_to_db};

/// A stored message.
#[derive(Debug, Clone)]
pub struct MessageRow {
    /// Message id.
    pub id: MessageId,
    /// Sending peer.
    pub from_peer: PeerId,
    /// Receiving peer.
    pub to_peer: PeerId,
    /// Message body.
    pub content: String,
    /// Message kind.
    pub message_type: MessageType,
    /// Transport the message travelled over.
    pub transport: Option<String>,
    /// Direction relative to the local peer.
    pub direction: MessageDirection,
    /// Delivery state.
    pub status: MessageStatus,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Whether the content was encrypted in transit.
    pub encrypted: bool,
    /// When the message was handed to a transport.
    pub sent_at: Option<Timestamp>,
    /// When delivery was acknowledged.
    pub delivered_at: Option<Timestamp>,
    /// When the recipient read it.
    pub read_at: Option<Timestamp>,
    /// Creation time.
    pub created_at: Timestamp,
}

/// Fields for creating a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Message id.
    pub id: MessageId,
    /// Sending peer.
    pub from_peer: PeerId,
    /// Receiving peer.
    pub to_peer: PeerId,
    /// Message body.
    pub content: String,
    /// Message kind.
    pub message_type: MessageType,
    /// Transport name.
    pub transport: Option<String>,
    /// Direction relative to the local peer.
    pub direction: MessageDirection,
    /// Initial status.
    pub status: MessageStatus,
    /// Attachments.
    pub attachments: Vec<Attachment>,
    /// Whether the content was encrypted in transit.
    pub encrypted: bool,
}

/// Page request for [`find_between`].
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    /// Only messages created strictly before this instant.
    pub before: Option<Timestamp>,
    /// Only messages created strictly after this instant.
    pub after: Option<Timestamp>,
    /// Page size (default 50).
    pub limit: Option<u32>,
}

const COLUMNS: &str = "id, from_peer, to_peer, content, type, transport, direction, status, \
                       attachments, encrypted, sent_at, delivered_at, read_at, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let id: String = row.get(0)?;
    let message_type: String = row.get(4)?;
    let direction: String = row.get(6)?;
    let status: String = row.get(7)?;
    let attachments: String = row.get(8)?;
    Ok(MessageRow {
        id: MessageId::parse(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        from_peer: PeerId::new(row.get::<_, String>(1)?),
        to_peer: PeerId::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        message_type: parse_enum(4, &message_type, MessageType::parse)?,
        transport: row.get(5)?,
        direction: parse_enum(6, &direction, MessageDirection::parse)?,
        status: parse_enum(7, &status, MessageStatus::parse)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        encrypted: row.get::<_, i32>(9)? != 0,
        sent_at: row.get::<_, Option<i64>>(10)?.map(ts_from_db),
        delivered_at: row.get::<_, Option<i64>>(11)?.map(ts_from_db),
        read_at: row.get::<_, Option<i64>>(12)?.map(ts_from_db),
        created_at: ts_from_db(row.get(13)?),
    })
}

/// Inserts a message, stamping `sent_at` when it arrives already `sent`.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] for a duplicate id.
pub fn insert(conn: &Connection, message: &NewMessage) -> Result<MessageRow, StoreError> {
    let now = ts_to_db(Timestamp::now());
    let attachments = serde_json::to_string(&message.attachments)
        .map_err(|e| StoreError::Internal(e.to_string()))?;
    let sent_at =
        (message.status.rank() >= MessageStatus::Sent.rank() && message.status != MessageStatus::Failed)
            .then_some(now);
    conn.execute(
        &format!(
            "INSERT INTO messages ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, NULL, ?12)"
        ),
        params![
            message.id.to_string(),
            message.from_peer.as_str(),
            message.to_peer.as_str(),
            message.content,
            message.message_type.as_str(),
            message.transport,
            message.direction.as_str(),
            message.status.as_str(),
            attachments,
            i32::from(message.encrypted),
            sent_at,
            now,
        ],
    )?;
    find(conn, &message.id)?
        .ok_or_else(|| StoreError::not_found("message", message.id.to_string()))
}

/// Looks a message up by id.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find(conn: &Connection, id: &MessageId) -> Result<Option<MessageRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
        [id.to_string()],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Advances a message's delivery state, stamping timestamps for the
/// reached state and any skipped earlier states.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id and
/// [`StoreError::Constraint`] when the transition is not monotonic.
pub fn advance_status(
    conn: &Connection,
    id: &MessageId,
    next: MessageStatus,
) -> Result<MessageRow, StoreError> {
    let Some(current) = find(conn, id)? else {
        return Err(StoreError::not_found("message", id.to_string()));
    };
    if !current.status.can_advance_to(next) {
        return Err(StoreError::Constraint {
            column: format!(
                "messages.status: {} -> {}",
                current.status.as_str(),
                next.as_str()
            ),
        });
    }
    let now = ts_to_db(Timestamp::now());
    let rank = next.rank();
    let sent_at = (next != MessageStatus::Failed && rank >= MessageStatus::Sent.rank())
        .then_some(now);
    let delivered_at = (next != MessageStatus::Failed && rank >= MessageStatus::Delivered.rank())
        .then_some(now);
    let read_at = (next == MessageStatus::Read).then_some(now);
    conn.execute(
        "UPDATE messages SET status = ?2,
             sent_at = coalesce(sent_at, ?3),
             delivered_at = coalesce(delivered_at, ?4),
             read_at = coalesce(read_at, ?5)
         WHERE id = ?1",
        params![id.to_string(), next.as_str(), sent_at, delivered_at, read_at],
    )?;
    find(conn, id)?.ok_or_else(|| StoreError::not_found("message", id.to_string()))
}

/// Returns up to `limit` messages between two peers (either direction),
/// newest first, plus a flag for whether older messages remain.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_between(
    conn: &Connection,
    peer_a: &PeerId,
    peer_b: &PeerId,
    page: &HistoryPage,
) -> Result<(Vec<MessageRow>, bool), StoreError> {
    let limit = page.limit.unwrap_or(50);
    let probe = i64::from(limit) + 1;
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages
         WHERE ((from_peer = ?1 AND to_peer = ?2) OR (from_peer = ?2 AND to_peer = ?1))
           AND (?3 IS NULL OR created_at < ?3)
           AND (?4 IS NULL OR created_at > ?4)
         ORDER BY created_at DESC, id DESC
         LIMIT ?5"
    ))?;
    let rows = stmt.query_map(
        params![
            peer_a.as_str(),
            peer_b.as_str(),
            page.before.map(ts_to_db),
            page.after.map(ts_to_db),
            probe,
        ],
        from_row,
    )?;
    let mut messages = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)?;
    let has_more = messages.len() > limit as usize;
    messages.truncate(limit as usize);
    Ok((messages, has_more))
}

/// Marks messages from `from_peer` to `reader` as read.
///
/// With `ids`, only those messages are touched, and only when they are
/// addressed to the reader and not yet read, so repeating the call has
/// zero effect. Without `ids`, every unread message from that peer is
/// marked. Returns the number of rows updated and the read timestamp.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn mark_read(
    conn: &Connection,
    reader: &PeerId,
    from_peer: &PeerId,
    ids: Option<&[MessageId]>,
) -> Result<(u32, Timestamp), StoreError> {
    let now = Timestamp::now();
    let stamp = ts_to_db(now);
    let updated = match ids {
        Some(ids) => {
            let mut total = 0usize;
            for id in ids {
                total += conn.execute(
                    "UPDATE messages SET status = 'read',
                         delivered_at = coalesce(delivered_at, ?3),
                         read_at = ?3
                     WHERE id = ?1 AND to_peer = ?2 AND status != 'read' AND status != 'failed'",
                    params![id.to_string(), reader.as_str(), stamp],
                )?;
            }
            total
        }
        None => conn.execute(
            "UPDATE messages SET status = 'read',
                 delivered_at = coalesce(delivered_at, ?3),
                 read_at = ?3
             WHERE to_peer = ?1 AND from_peer = ?2 AND status != 'read' AND status != 'failed'",
            params![reader.as_str(), from_peer.as_str(), stamp],
        )?,
    };
    Ok((u32::try_from(updated).unwrap_or(u32::MAX), now))
}

/// Counts messages addressed to `peer` that are not yet read.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn unread_count(conn: &Connection, peer: &PeerId) -> Result<u32, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM messages WHERE to_peer = ?1 AND status != 'read'",
        [peer.as_str()],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Case-insensitive substring search over a peer's conversations,
/// newest first, capped at `limit`.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn search(
    conn: &Connection,
    peer: &PeerId,
    query: &str,
    limit: u32,
) -> Result<Vec<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages
         WHERE (from_peer = ?1 OR to_peer = ?1) AND lower(content) LIKE ?2
         ORDER BY created_at DESC, id DESC
         LIMIT ?3"
    ))?;
    let pattern = format!("%{}%", query.to_lowercase());
    let rows = stmt.query_map(params![peer.as_str(), pattern, i64::from(limit)], from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}
