//! SQLite repository
//!
//! Implements [`Repository`] on a single mutex-guarded connection.

use super::Repository;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;  -- 16MB cache
            ",
        )?;

        tracing::debug!(path = %path.display(), "Opened database");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_to_series(row: &Row) -> rusqlite::Result<Series> {
        let observations: String = row.get("observations")?;
        Ok(Series {
            id: row.get("id")?,
            observations: from_json(row, "observations", &observations)?,
            fetched_at: get_datetime(row, "fetched_at")?,
        })
    }

    fn row_to_report(row: &Row) -> rusqlite::Result<AnalysisReport> {
        let kind_str: String = row.get("kind")?;
        let payload: String = row.get("payload")?;
        Ok(AnalysisReport {
            id: row.get("id")?,
            series_id: row.get("series_id")?,
            kind: kind_str
                .parse()
                .map_err(|e: String| conversion_error(row, "kind", e.into()))?,
            payload: from_json(row, "payload", &payload)?,
            series_fetched_at: get_datetime(row, "series_fetched_at")?,
            generated_at: get_datetime(row, "generated_at")?,
        })
    }

    fn row_to_vector(row: &Row) -> rusqlite::Result<VectorEntry> {
        let blob: Vec<u8> = row.get("embedding")?;
        Ok(VectorEntry {
            series_id: row.get("series_id")?,
            embedding: decode_embedding(&blob)
                .ok_or_else(|| conversion_error(row, "embedding", "truncated blob".into()))?,
            upserted_at: get_datetime(row, "upserted_at")?,
        })
    }

    fn row_to_turn(row: &Row) -> rusqlite::Result<ChatTurn> {
        let context: String = row.get("context")?;
        let failure: Option<String> = row.get("failure")?;
        let failure = failure
            .map(|s| {
                s.parse()
                    .map_err(|e: String| conversion_error(row, "failure", e.into()))
            })
            .transpose()?;
        Ok(ChatTurn {
            user_input: row.get("user_input")?,
            context: from_json(row, "context", &context)?,
            response: row.get("response")?,
            failure,
            timestamp: get_datetime(row, "created_at")?,
        })
    }

    fn load_turns(conn: &Connection, session_id: &str) -> Result<Vec<ChatTurn>> {
        let mut stmt = conn.prepare(
            "SELECT * FROM chat_turns WHERE session_id = ? ORDER BY seq ASC",
        )?;
        let turns = stmt
            .query_map([session_id], Self::row_to_turn)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(turns)
    }
}

impl Repository for Database {
    fn save_series(&self, series: &Series) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO series (id, fetched_at, observations)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                fetched_at = excluded.fetched_at,
                observations = excluded.observations
            WHERE excluded.fetched_at > series.fetched_at
            "#,
            params![
                series.id,
                format_datetime(&series.fetched_at),
                serde_json::to_string(&series.observations)?,
            ],
        )?;
        Ok(())
    }

    fn find_series(&self, series_id: &str) -> Result<Option<Series>> {
        let conn = self.connection();
        conn.query_row(
            "SELECT * FROM series WHERE id = ?",
            [series_id],
            Self::row_to_series,
        )
        .optional()
        .map_err(Error::from)
    }

    fn find_all_series(&self) -> Result<Vec<Series>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT * FROM series ORDER BY id")?;
        let series = stmt
            .query_map([], Self::row_to_series)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(series)
    }

    fn save_report(&self, report: &AnalysisReport) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO analysis_reports (id, series_id, kind, payload,
                                          series_fetched_at, generated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                report.id,
                report.series_id,
                report.kind.as_str(),
                serde_json::to_string(&report.payload)?,
                format_datetime(&report.series_fetched_at),
                format_datetime(&report.generated_at),
            ],
        )?;
        Ok(())
    }

    fn find_report(&self, report_id: &str) -> Result<Option<AnalysisReport>> {
        let conn = self.connection();
        conn.query_row(
            "SELECT * FROM analysis_reports WHERE id = ?",
            [report_id],
            Self::row_to_report,
        )
        .optional()
        .map_err(Error::from)
    }

    fn find_reports(&self, series_id: &str) -> Result<Vec<AnalysisReport>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT * FROM analysis_reports WHERE series_id = ? ORDER BY rowid ASC",
        )?;
        let reports = stmt
            .query_map([series_id], Self::row_to_report)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(reports)
    }

    fn save_vector(&self, entry: &VectorEntry) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO vector_entries (series_id, dimension, embedding, upserted_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(series_id) DO UPDATE SET
                dimension = excluded.dimension,
                embedding = excluded.embedding,
                upserted_at = excluded.upserted_at
            WHERE excluded.upserted_at > vector_entries.upserted_at
            "#,
            params![
                entry.series_id,
                entry.embedding.len() as i64,
                encode_embedding(&entry.embedding),
                format_datetime(&entry.upserted_at),
            ],
        )?;
        Ok(())
    }

    fn find_vector(&self, series_id: &str) -> Result<Option<VectorEntry>> {
        let conn = self.connection();
        conn.query_row(
            "SELECT * FROM vector_entries WHERE series_id = ?",
            [series_id],
            Self::row_to_vector,
        )
        .optional()
        .map_err(Error::from)
    }

    fn find_all_vectors(&self) -> Result<Vec<VectorEntry>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT * FROM vector_entries ORDER BY series_id")?;
        let entries = stmt
            .query_map([], Self::row_to_vector)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn append_turn(&self, session_id: &str, turn: &ChatTurn) -> Result<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        let next_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM chat_turns WHERE session_id = ?",
            [session_id],
            |r| r.get(0),
        )?;
        tx.execute(
            r#"
            INSERT INTO chat_turns (session_id, seq, user_input, context,
                                    response, failure, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session_id,
                next_seq,
                turn.user_input,
                serde_json::to_string(&turn.context)?,
                turn.response,
                turn.failure.map(|k| k.as_str()),
                format_datetime(&turn.timestamp),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn find_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let conn = self.connection();
        let turns = Self::load_turns(&conn, session_id)?;
        if turns.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChatSession {
            id: session_id.to_string(),
            turns,
        }))
    }

    fn find_all_sessions(&self) -> Result<Vec<ChatSession>> {
        let conn = self.connection();
        let mut stmt =
            conn.prepare("SELECT DISTINCT session_id FROM chat_turns ORDER BY session_id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        ids.into_iter()
            .map(|id| {
                let turns = Self::load_turns(&conn, &id)?;
                Ok(ChatSession { id, turns })
            })
            .collect()
    }
}

/// Timestamps are stored with full precision so cache keys survive a restart
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn get_datetime(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(row, column, Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(
    row: &Row,
    column: &str,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_error(row, column, Box::new(e)))
}

fn conversion_error(
    row: &Row,
    column: &str,
    err: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err)
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
