//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: series, reports, vectors, chat turns
    r#"
    CREATE TABLE IF NOT EXISTS series (
        id               TEXT PRIMARY KEY,
        fetched_at       DATETIME NOT NULL,
        -- [{timestamp, value}] sorted by timestamp
        observations     JSON NOT NULL
    );

    -- Append-only: regeneration inserts a new row, older rows are history
    CREATE TABLE IF NOT EXISTS analysis_reports (
        id                TEXT PRIMARY KEY,
        series_id         TEXT NOT NULL,
        kind              TEXT NOT NULL,
        payload           JSON NOT NULL,
        series_fetched_at DATETIME NOT NULL,
        generated_at      DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS vector_entries (
        series_id        TEXT PRIMARY KEY,
        dimension        INTEGER NOT NULL,
        -- little-endian f32 components
        embedding        BLOB NOT NULL,
        upserted_at      DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chat_turns (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL,
        seq              INTEGER NOT NULL,
        user_input       TEXT NOT NULL,
        context          JSON NOT NULL,
        response         TEXT NOT NULL,
        failure          TEXT,
        created_at       DATETIME NOT NULL,

        UNIQUE(session_id, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_reports_series ON analysis_reports(series_id);
    CREATE INDEX IF NOT EXISTS idx_chat_turns_session ON chat_turns(session_id, seq);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
