//! In-memory [`Repository`]

use super::Repository;
use crate::error::{Error, Result};
use crate::types::{AnalysisReport, ChatSession, ChatTurn, Series, VectorEntry};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Tables {
    series: BTreeMap<String, Series>,
    /// Insertion order is report history order
    reports: Vec<AnalysisReport>,
    vectors: BTreeMap<String, VectorEntry>,
    sessions: BTreeMap<String, ChatSession>,
    report_index: HashMap<String, usize>,
}

/// Repository backed by process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Repository for MemoryRepository {
    fn save_series(&self, series: &Series) -> Result<()> {
        let mut tables = self.tables();
        match tables.series.get(&series.id) {
            Some(stored) if stored.fetched_at >= series.fetched_at => {}
            _ => {
                tables.series.insert(series.id.clone(), series.clone());
            }
        }
        Ok(())
    }

    fn find_series(&self, series_id: &str) -> Result<Option<Series>> {
        Ok(self.tables().series.get(series_id).cloned())
    }

    fn find_all_series(&self) -> Result<Vec<Series>> {
        Ok(self.tables().series.values().cloned().collect())
    }

    fn save_report(&self, report: &AnalysisReport) -> Result<()> {
        let mut tables = self.tables();
        if tables.report_index.contains_key(&report.id) {
            return Err(Error::Storage(format!(
                "report {} already exists; reports are immutable",
                report.id
            )));
        }
        let position = tables.reports.len();
        tables.report_index.insert(report.id.clone(), position);
        tables.reports.push(report.clone());
        Ok(())
    }

    fn find_report(&self, report_id: &str) -> Result<Option<AnalysisReport>> {
        let tables = self.tables();
        Ok(tables
            .report_index
            .get(report_id)
            .and_then(|i| tables.reports.get(*i))
            .cloned())
    }

    fn find_reports(&self, series_id: &str) -> Result<Vec<AnalysisReport>> {
        Ok(self
            .tables()
            .reports
            .iter()
            .filter(|r| r.series_id == series_id)
            .cloned()
            .collect())
    }

    fn save_vector(&self, entry: &VectorEntry) -> Result<()> {
        let mut tables = self.tables();
        match tables.vectors.get(&entry.series_id) {
            Some(stored) if stored.upserted_at >= entry.upserted_at => {}
            _ => {
                tables.vectors.insert(entry.series_id.clone(), entry.clone());
            }
        }
        Ok(())
    }

    fn find_vector(&self, series_id: &str) -> Result<Option<VectorEntry>> {
        Ok(self.tables().vectors.get(series_id).cloned())
    }

    fn find_all_vectors(&self) -> Result<Vec<VectorEntry>> {
        Ok(self.tables().vectors.values().cloned().collect())
    }

    fn append_turn(&self, session_id: &str, turn: &ChatTurn) -> Result<()> {
        self.tables()
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ChatSession::new(session_id))
            .turns
            .push(turn.clone());
        Ok(())
    }

    fn find_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        Ok(self.tables().sessions.get(session_id).cloned())
    }

    fn find_all_sessions(&self) -> Result<Vec<ChatSession>> {
        Ok(self.tables().sessions.values().cloned().collect())
    }
}
