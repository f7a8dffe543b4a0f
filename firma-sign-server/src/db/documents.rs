//! Document repository, including version chains and search.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use firma_sign_proto::ids::{DocumentId, Timestamp, TransferId};
use firma_sign_proto::transfer::{DocumentCategory, DocumentStatus};

use super::{StoreError, parse_enum, ts_from_db, ts_to_db};

/// A stored document.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    /// Document id.
    pub id: DocumentId,
    /// Owning transfer.
    pub transfer_id: TransferId,
    /// Original file name as uploaded.
    pub file_name: String,
    /// Sanitized name the bytes are stored under.
    pub stored_name: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 of the bytes, lower-case hex.
    pub hash: String,
    /// Lifecycle state.
    pub status: DocumentStatus,
    /// Storage category.
    pub category: DocumentCategory,
    /// Peer that uploaded the document.
    pub uploaded_by: Option<String>,
    /// Peer that signed it, once signed.
    pub signed_by: Option<String>,
    /// When it was signed.
    pub signed_at: Option<Timestamp>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Version number, starting at 1.
    pub version: u32,
    /// Previous version in the chain.
    pub previous_version_id: Option<DocumentId>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

/// Fields for creating a document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Document id.
    pub id: DocumentId,
    /// Owning transfer.
    pub transfer_id: TransferId,
    /// Original file name.
    pub file_name: String,
    /// Sanitized stored name.
    pub stored_name: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256 hex.
    pub hash: String,
    /// Initial status.
    pub status: DocumentStatus,
    /// Storage category.
    pub category: DocumentCategory,
    /// Uploader.
    pub uploaded_by: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Version number.
    pub version: u32,
    /// Previous version in the chain.
    pub previous_version_id: Option<DocumentId>,
}

/// Search filter; all present fields must match.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    /// Storage category.
    pub category: Option<DocumentCategory>,
    /// Lifecycle state.
    pub status: Option<DocumentStatus>,
    /// Owning transfer.
    pub transfer_id: Option<TransferId>,
    /// Uploader.
    pub uploaded_by: Option<String>,
    /// Signer.
    pub signed_by: Option<String>,
    /// Tags the document must carry (subset match).
    pub tags: Option<Vec<String>>,
    /// Created at or after.
    pub from: Option<Timestamp>,
    /// Created at or before.
    pub to: Option<Timestamp>,
    /// Case-insensitive substring of the file name.
    pub name_contains: Option<String>,
    /// Page size (default 50).
    pub limit: Option<u32>,
    /// Page offset.
    pub offset: Option<u32>,
}

const COLUMNS: &str = "id, transfer_id, file_name, stored_name, size, hash, status, category, \
                       uploaded_by, signed_by, signed_at, tags, version, previous_version_id, \
                       created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    let status: String = row.get(6)?;
    let category: String = row.get(7)?;
    let tags: String = row.get(11)?;
    Ok(DocumentRow {
        id: DocumentId::new(row.get::<_, String>(0)?),
        transfer_id: TransferId::new(row.get::<_, String>(1)?),
        file_name: row.get(2)?,
        stored_name: row.get(3)?,
        size: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
        hash: row.get(5)?,
        status: parse_enum(6, &status, DocumentStatus::parse)?,
        category: parse_enum(7, &category, DocumentCategory::parse)?,
        uploaded_by: row.get(8)?,
        signed_by: row.get(9)?,
        signed_at: row.get::<_, Option<i64>>(10)?.map(ts_from_db),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        version: u32::try_from(row.get::<_, i64>(12)?).unwrap_or(1),
        previous_version_id: row.get::<_, Option<String>>(13)?.map(DocumentId::new),
        created_at: ts_from_db(row.get(14)?),
        updated_at: ts_from_db(row.get(15)?),
    })
}

/// Inserts a document.
///
/// # Errors
///
/// Returns [`StoreError::Constraint`] for a duplicate id or a missing
/// owning transfer.
pub fn insert(conn: &Connection, doc: &NewDocument) -> Result<(), StoreError> {
    let now = ts_to_db(Timestamp::now());
    let tags = serde_json::to_string(&doc.tags).map_err(|e| StoreError::Internal(e.to_string()))?;
    conn.execute(
        &format!(
            "INSERT INTO documents ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, ?10, ?11, ?12, ?13, ?13)"
        ),
        params![
            doc.id.as_str(),
            doc.transfer_id.as_str(),
            doc.file_name,
            doc.stored_name,
            i64::try_from(doc.size).unwrap_or(i64::MAX),
            doc.hash,
            doc.status.as_str(),
            doc.category.as_str(),
            doc.uploaded_by,
            tags,
            i64::from(doc.version),
            doc.previous_version_id.as_ref().map(DocumentId::as_str),
            now,
        ],
    )?;
    Ok(())
}

/// Looks a document up by id.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find(conn: &Connection, id: &DocumentId) -> Result<Option<DocumentRow>, StoreError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM documents WHERE id = ?1"),
        [id.as_str()],
        from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Returns all documents owned by a transfer.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn find_by_transfer(
    conn: &Connection,
    transfer_id: &TransferId,
) -> Result<Vec<DocumentRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM documents WHERE transfer_id = ?1 ORDER BY created_at, id"
    ))?;
    let rows = stmt.query_map([transfer_id.as_str()], from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)
}

/// Updates a document's status, and optionally the signer.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id.
pub fn set_status(
    conn: &Connection,
    id: &DocumentId,
    status: DocumentStatus,
    signed_by: Option<&str>,
) -> Result<(), StoreError> {
    let now = ts_to_db(Timestamp::now());
    let signed_at = matches!(status, DocumentStatus::Signed).then_some(now);
    let updated = conn.execute(
        "UPDATE documents SET status = ?2,
             signed_by = coalesce(?3, signed_by),
             signed_at = coalesce(?4, signed_at),
             updated_at = ?5
         WHERE id = ?1",
        params![id.as_str(), status.as_str(), signed_by, signed_at, now],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("document", id.as_str()));
    }
    Ok(())
}

/// Moves a document to a new storage category.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id.
pub fn set_category(
    conn: &Connection,
    id: &DocumentId,
    category: DocumentCategory,
) -> Result<(), StoreError> {
    let updated = conn.execute(
        "UPDATE documents SET category = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), category.as_str(), ts_to_db(Timestamp::now())],
    )?;
    if updated == 0 {
        return Err(StoreError::not_found("document", id.as_str()));
    }
    Ok(())
}

/// Deletes a document row (hard delete).
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] for an unknown id.
pub fn delete(conn: &Connection, id: &DocumentId) -> Result<(), StoreError> {
    let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", [id.as_str()])?;
    if deleted == 0 {
        return Err(StoreError::not_found("document", id.as_str()));
    }
    Ok(())
}

/// Searches documents. Scalar predicates run in SQL; the tag subset
/// match runs over the page candidates.
///
/// # Errors
///
/// Returns [`StoreError::Internal`] on engine failure.
pub fn search(conn: &Connection, filter: &DocumentFilter) -> Result<Vec<DocumentRow>, StoreError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    let push = |clause: &str, value: Value, values: &mut Vec<Value>| {
        values.push(value);
        format!("{} ?{}", clause, values.len())
    };

    if let Some(category) = filter.category {
        let clause = push("category =", Value::from(category.as_str().to_string()), &mut values);
        clauses.push(clause);
    }
    if let Some(status) = filter.status {
        let clause = push("status =", Value::from(status.as_str().to_string()), &mut values);
        clauses.push(clause);
    }
    if let Some(transfer_id) = &filter.transfer_id {
        let clause = push(
            "transfer_id =",
            Value::from(transfer_id.as_str().to_string()),
            &mut values,
        );
        clauses.push(clause);
    }
    if let Some(uploaded_by) = &filter.uploaded_by {
        let clause = push("uploaded_by =", Value::from(uploaded_by.clone()), &mut values);
        clauses.push(clause);
    }
    if let Some(signed_by) = &filter.signed_by {
        let clause = push("signed_by =", Value::from(signed_by.clone()), &mut values);
        clauses.push(clause);
    }
    if let Some(from) = filter.from {
        let clause = push("created_at >=", Value::from(ts_to_db(from)), &mut values);
        clauses.push(clause);
    }
    if let Some(to) = filter.to {
        let clause = push("created_at <=", Value::from(ts_to_db(to)), &mut values);
        clauses.push(clause);
    }
    if let Some(name) = &filter.name_contains {
        let clause = push(
            "lower(file_name) LIKE",
            Value::from(format!("%{}%", name.to_lowercase())),
            &mut values,
        );
        clauses.push(clause);
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let limit = i64::from(filter.limit.unwrap_or(50));
    let offset = i64::from(filter.offset.unwrap_or(0));

    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM documents {where_clause}
         ORDER BY created_at DESC, id DESC
         LIMIT {limit} OFFSET {offset}"
    ))?;
    let rows = stmt.query_map(params_from_iter(values), from_row)?;
    let mut docs = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)?;

    if let Some(required) = &filter.tags {
        docs.retain(|doc| required.iter().all(|tag| doc.tags.contains(tag)));
    }
    Ok(docs)
}

/// Walks the version chain starting from `id` back to version 1,
/// newest first.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] when `id` is unknown.
pub fn versions(conn: &Connection, id: &DocumentId) -> Result<Vec<DocumentRow>, StoreError> {
    let Some(head) = find(conn, id)? else {
        return Err(StoreError::not_found("document", id.as_str()));
    };
    let mut chain = vec![head];
    loop {
        let Some(prev_id) = chain
            .last()
            .and_then(|d| d.previous_version_id.clone())
        else {
            break;
        };
        match find(conn, &prev_id)? {
            Some(prev) => chain.push(prev),
            None => break,
        }
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::transfers::{self, NewTransfer};
    use crate::db::Database;
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

    fn new_doc(id: &str, transfer: &str) -> NewDocument {
        NewDocument {
            id: DocumentId::new(id),
            transfer_id: TransferId::new(transfer),
            file_name: "contract.pdf".into(),
            stored_name: "contract.pdf".into(),
            size: 64,
            hash: "abc123".into(),
            status: DocumentStatus::Draft,
            category: DocumentCategory::Uploaded,
            uploaded_by: Some("alice".into()),
            tags: vec!["legal".into()],
            version: 1,
            previous_version_id: None,
        }
    }

    #[test]
    fn document_requires_existing_transfer() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_conn(|conn| insert(conn, &new_doc("d1", "missing")))
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { .. }), "got {err:?}");
    }

    #[test]
    fn insert_and_find_by_transfer() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            insert(conn, &new_doc("d1", "t1"))?;
            insert(conn, &new_doc("d2", "t1"))?;
            assert_eq!(find_by_transfer(conn, &TransferId::new("t1"))?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn signing_sets_signer_and_timestamp() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            insert(conn, &new_doc("d1", "t1"))?;
            set_status(conn, &DocumentId::new("d1"), DocumentStatus::Signed, Some("bob"))?;
            let doc = find(conn, &DocumentId::new("d1"))?.unwrap();
            assert_eq!(doc.status, DocumentStatus::Signed);
            assert_eq!(doc.signed_by.as_deref(), Some("bob"));
            assert!(doc.signed_at.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn search_filters_compose() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            insert(conn, &new_doc("d1", "t1"))?;
            let mut other = new_doc("d2", "t1");
            other.file_name = "notes.txt".into();
            other.tags = vec![];
            insert(conn, &other)?;

            let found = search(
                conn,
                &DocumentFilter {
                    name_contains: Some("CONTRACT".into()),
                    tags: Some(vec!["legal".into()]),
                    ..DocumentFilter::default()
                },
            )?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].id, DocumentId::new("d1"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn version_chain_walks_to_root() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            insert(conn, &new_doc("d1", "t1"))?;
            let mut v2 = new_doc("d2", "t1");
            v2.version = 2;
            v2.previous_version_id = Some(DocumentId::new("d1"));
            insert(conn, &v2)?;

            let chain = versions(conn, &DocumentId::new("d2"))?;
            assert_eq!(chain.len(), 2);
            assert_eq!(chain[0].version, 2);
            assert_eq!(chain[1].version, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn cascade_delete_with_transfer() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed_transfer(conn, "t1");
            insert(conn, &new_doc("d1", "t1"))?;
            transfers::delete(conn, &TransferId::new("t1"))?;
            assert!(find(conn, &DocumentId::new("d1"))?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
