//! Persistence layer for fredrag
//!
//! The core talks to storage through the [`Repository`] trait:
//! - [`Database`]: SQLite with embedded migrations
//! - [`MemoryRepository`]: process-local maps for tests and throwaway runs

pub mod memory;
pub mod repo;
pub mod schema;

pub use memory::MemoryRepository;
pub use repo::Database;

use crate::error::Result;
use crate::types::{AnalysisReport, ChatSession, ChatTurn, Series, VectorEntry};

/// Durable storage for series, reports, vectors and chat sessions.
///
/// Implementations must keep reports append-only: `save_report` never replaces
/// an earlier report, and `find_reports` returns them in insertion order.
pub trait Repository: Send + Sync {
    /// Insert a series, or replace the stored one if `fetched_at` is newer
    fn save_series(&self, series: &Series) -> Result<()>;

    fn find_series(&self, series_id: &str) -> Result<Option<Series>>;

    fn find_all_series(&self) -> Result<Vec<Series>>;

    /// Append a report
    fn save_report(&self, report: &AnalysisReport) -> Result<()>;

    fn find_report(&self, report_id: &str) -> Result<Option<AnalysisReport>>;

    /// All reports for a series, oldest first
    fn find_reports(&self, series_id: &str) -> Result<Vec<AnalysisReport>>;

    /// Insert a vector entry, or replace the stored one if `upserted_at` is newer
    fn save_vector(&self, entry: &VectorEntry) -> Result<()>;

    fn find_vector(&self, series_id: &str) -> Result<Option<VectorEntry>>;

    fn find_all_vectors(&self) -> Result<Vec<VectorEntry>>;

    /// Append a turn to a session, creating the session if needed
    fn append_turn(&self, session_id: &str, turn: &ChatTurn) -> Result<()>;

    fn find_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    fn find_all_sessions(&self) -> Result<Vec<ChatSession>>;
}
