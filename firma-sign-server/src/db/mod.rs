//! SQLite-backed persistence layer.
//!
//! One [`Database`] owns a single `rusqlite` connection behind a mutex:
//! the store is the single writer of relational state and serializes
//! writes internally. Repositories are free functions over
//! [`rusqlite::Connection`] so they compose inside one transaction:
//! [`Database::with_tx`] is the unit of work, committing on `Ok` and
//! rolling back on `Err`. Nested units cannot be expressed because the
//! closure receives the open transaction.
//!
//! Transient failures (`SQLITE_BUSY`, `SQLITE_LOCKED`) are retried twice
//! before surfacing as [`StoreError::Transient`].

pub mod connections;
pub mod documents;
pub mod groups;
pub mod messages;
mod migrations;
pub mod peers;
pub mod recipients;
pub mod transfers;
pub mod transport_configs;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use firma_sign_proto::ids::Timestamp;

/// Attempts for operations that fail with a transient error.
const TRANSIENT_ATTEMPTS: u32 = 3;

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness or foreign-key constraint was violated.
    #[error("constraint violation: {column}")]
    Constraint {
        /// The offending column(s), as reported by the engine.
        column: String,
    },

    /// The database was busy or locked; the caller may retry.
    #[error("database temporarily unavailable")]
    Transient,

    /// The schema is missing, newer than this binary, or a migration
    /// failed. Fatal at startup.
    #[error("schema error: {0}")]
    Schema(String),

    /// An entity lookup found nothing.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind.
        resource: &'static str,
        /// The id that missed.
        id: String,
    },

    /// Any other engine failure.
    #[error("storage failure: {0}")]
    Internal(String),
}

impl StoreError {
    /// Shorthand for a not-found lookup.
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg) => match code.code {
                rusqlite::ErrorCode::ConstraintViolation => Self::Constraint {
                    column: msg.clone().unwrap_or_else(|| "unknown".to_string()),
                },
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Self::Transient
                }
                _ => Self::Internal(err.to_string()),
            },
            _ => Self::Internal(err.to_string()),
        }
    }
}

/// Converts a [`Timestamp`] to its storage form (millis as `i64`).
pub(crate) fn ts_to_db(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

/// Converts a stored millis value back to a [`Timestamp`].
pub(crate) fn ts_from_db(millis: i64) -> Timestamp {
    Timestamp::from_millis(u64::try_from(millis).unwrap_or(0))
}

/// Column-level helper: parses a canonical enum name read from a row.
pub(crate) fn parse_enum<T>(
    idx: usize,
    value: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized value {value:?}").into(),
        )
    })
}

/// Handle to the relational store.
///
/// Cheap to share via `Arc`; all access is serialized through the inner
/// mutex, matching the single-writer policy.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database at `path` and applies pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Schema`] when migrations cannot be applied;
    /// this is fatal at startup.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(StoreError::from)?;
        Self::prepare(conn)
    }

    /// Opens an in-memory database with the full schema, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Schema`] when migrations cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::from)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::from)?;
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` against the connection, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error after retries are exhausted.
    pub fn with_conn<T>(
        &self,
        mut f: impl FnMut(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        let mut last = StoreError::Transient;
        for _ in 0..TRANSIENT_ATTEMPTS {
            match f(&conn) {
                Err(StoreError::Transient) => last = StoreError::Transient,
                other => return other,
            }
        }
        Err(last)
    }

    /// Unit of work: runs `f` inside a transaction, committing on `Ok`
    /// and rolling back on `Err`. Transient failures retry the whole
    /// unit.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or the commit failure.
    pub fn with_tx<T>(
        &self,
        mut f: impl FnMut(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let mut last = StoreError::Transient;
        for _ in 0..TRANSIENT_ATTEMPTS {
            let tx = conn.transaction().map_err(StoreError::from)?;
            match f(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(e) => match StoreError::from(e) {
                        StoreError::Transient => last = StoreError::Transient,
                        fatal => return Err(fatal),
                    },
                },
                Err(StoreError::Transient) => {
                    // Rolls back on drop.
                    last = StoreError::Transient;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last)
    }
}
