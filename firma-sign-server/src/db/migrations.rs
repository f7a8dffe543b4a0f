//! Versioned, forward-only schema migrations.
//!
//! `schema_version` holds a single row with the last applied version.
//! At startup every script newer than that version runs inside its own
//! transaction; any failure aborts startup with
//! [`StoreError::Schema`](super::StoreError::Schema). A database newer
//! than this binary is rejected outright.

use rusqlite::Connection;

use super::StoreError;

/// Migration scripts, one entry per schema version, starting at 1.
const MIGRATIONS: &[&str] = &[
    // v1: full relational model.
    "
    CREATE TABLE peers (
        id            TEXT PRIMARY KEY,
        display_name  TEXT NOT NULL,
        avatar        TEXT,
        status        TEXT NOT NULL DEFAULT 'offline',
        trust_level   TEXT NOT NULL DEFAULT 'unverified',
        last_seen     INTEGER,
        public_key    TEXT,
        metadata      TEXT NOT NULL DEFAULT '{}',
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL
    );

    CREATE TABLE peer_identifiers (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        peer_id     TEXT NOT NULL REFERENCES peers(id) ON DELETE CASCADE,
        transport   TEXT NOT NULL,
        identifier  TEXT NOT NULL,
        verified    INTEGER NOT NULL DEFAULT 0,
        created_at  INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX idx_peer_identifiers_transport_identifier
        ON peer_identifiers(transport, identifier);

    CREATE TABLE peer_connections (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        local_peer       TEXT NOT NULL,
        remote_peer      TEXT NOT NULL,
        transport        TEXT NOT NULL,
        direction        TEXT NOT NULL,
        status           TEXT NOT NULL,
        connected_at     INTEGER,
        disconnected_at  INTEGER,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL
    );
    CREATE INDEX idx_peer_connections_triple
        ON peer_connections(local_peer, remote_peer, transport);

    CREATE TABLE transfers (
        id          TEXT PRIMARY KEY,
        type        TEXT NOT NULL,
        status      TEXT NOT NULL,
        code        TEXT,
        sender      TEXT,
        transport   TEXT,
        metadata    TEXT NOT NULL DEFAULT '{}',
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    );
    CREATE INDEX idx_transfers_type_status ON transfers(type, status);

    CREATE TABLE documents (
        id                   TEXT PRIMARY KEY,
        transfer_id          TEXT NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
        file_name            TEXT NOT NULL,
        stored_name          TEXT NOT NULL,
        size                 INTEGER NOT NULL,
        hash                 TEXT NOT NULL,
        status               TEXT NOT NULL,
        category             TEXT NOT NULL,
        uploaded_by          TEXT,
        signed_by            TEXT,
        signed_at            INTEGER,
        tags                 TEXT NOT NULL DEFAULT '[]',
        version              INTEGER NOT NULL DEFAULT 1,
        previous_version_id  TEXT,
        created_at           INTEGER NOT NULL,
        updated_at           INTEGER NOT NULL
    );
    CREATE INDEX idx_documents_transfer_status ON documents(transfer_id, status);

    CREATE TABLE recipients (
        id           TEXT PRIMARY KEY,
        transfer_id  TEXT NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
        identifier   TEXT NOT NULL,
        transport    TEXT NOT NULL,
        status       TEXT NOT NULL,
        preferences  TEXT NOT NULL DEFAULT '{}',
        error        TEXT,
        notified_at  INTEGER,
        signed_at    INTEGER,
        created_at   INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL
    );
    CREATE INDEX idx_recipients_transfer_identifier
        ON recipients(transfer_id, identifier);

    CREATE TABLE messages (
        id            TEXT PRIMARY KEY,
        from_peer     TEXT NOT NULL,
        to_peer       TEXT NOT NULL,
        content       TEXT NOT NULL,
        type          TEXT NOT NULL,
        transport     TEXT,
        direction     TEXT NOT NULL,
        status        TEXT NOT NULL,
        attachments   TEXT NOT NULL DEFAULT '[]',
        encrypted     INTEGER NOT NULL DEFAULT 0,
        sent_at       INTEGER,
        delivered_at  INTEGER,
        read_at       INTEGER,
        created_at    INTEGER NOT NULL
    );
    CREATE INDEX idx_messages_pair_created
        ON messages(from_peer, to_peer, created_at DESC);

    CREATE TABLE groups (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        description TEXT,
        owner_peer  TEXT NOT NULL,
        settings    TEXT NOT NULL DEFAULT '{}',
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    );

    CREATE TABLE group_members (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id   TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        peer_id    TEXT NOT NULL,
        role       TEXT NOT NULL,
        joined_at  INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX idx_group_members_group_peer
        ON group_members(group_id, peer_id);

    CREATE TABLE transport_configs (
        transport       TEXT PRIMARY KEY,
        config          TEXT NOT NULL DEFAULT '{}',
        status          TEXT NOT NULL,
        initialized_at  INTEGER
    );
    ",
];

/// Applies all pending migrations.
///
/// # Errors
///
/// Returns [`StoreError::Schema`] when the stored version is newer than
/// this binary or any script fails.
pub fn apply(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::Schema(e.to_string()))?;

    let current: i64 = conn
        .query_row(
            "SELECT coalesce(max(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Schema(e.to_string()))?;
    let current = usize::try_from(current).map_err(|_| {
        StoreError::Schema(format!("schema_version holds invalid version {current}"))
    })?;

    if current > MIGRATIONS.len() {
        return Err(StoreError::Schema(format!(
            "database schema version {current} is newer than supported {}",
            MIGRATIONS.len()
        )));
    }

    for (version, script) in MIGRATIONS.iter().enumerate().skip(current) {
        let target = version + 1;
        tracing::info!(version = target, "applying schema migration");
        conn.execute_batch(&format!("BEGIN; {script} COMMIT;"))
            .map_err(|e| StoreError::Schema(format!("migration {target} failed: {e}")))?;
        conn.execute("DELETE FROM schema_version", [])
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [i64::try_from(target).unwrap_or(i64::MAX)],
        )
        .map_err(|e| StoreError::Schema(e.to_string()))?;
    }

    Ok(())
}
