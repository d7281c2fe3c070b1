//! Analysis engine
//!
//! Computes [`AnalysisReport`]s over series held in the [`SeriesStore`] and
//! memoizes them per `(series_id, kind)`.
//!
//! ## Caching
//!
//! ```text
//!   analyze(id, kind)
//!        │
//!        ▼
//!   slots[(id, kind)] ──► slot.series.fetched_at < current fetched_at ?
//!        │                      │ yes: replace slot (new OnceCell)
//!        ▼                      ▼
//!   OnceCell::get_or_try_init ──► first caller computes, concurrent
//!                                 callers await the same cell
//! ```
//!
//! A slot is bound to one fetched version of a series. Re-ingesting the series
//! advances `fetched_at`, so the next `analyze` call installs a fresh slot and
//! the old report becomes history. The slot map lock is held only while the
//! slot is looked up, never across an await.
//!
//! An empty slot is first filled from the repository: the newest persisted
//! report of the same kind for the same `fetched_at` is reused instead of
//! computing a duplicate. A persisted anomaly report is reused only if it was
//! computed with this engine's threshold, and a persisted summary only if it
//! is at least as new as the component reports it would be composed from.

use crate::analytics::stats::{self, SummaryInput};
use crate::db::Repository;
use crate::error::{Error, Result};
use crate::store::SeriesStore;
use crate::types::{AnalysisReport, ReportKind, ReportPayload, Series, SummaryResult};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// |z| above which an observation is flagged when no threshold is configured.
pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 2.0;

type SlotKey = (String, ReportKind);

/// Cache slot for one fetched version of a series.
struct Slot {
    series: Arc<Series>,
    report: Arc<OnceCell<Arc<AnalysisReport>>>,
}

/// Engine that computes and memoizes analysis reports.
pub struct AnalysisEngine {
    store: Arc<SeriesStore>,
    repo: Arc<dyn Repository>,
    anomaly_threshold: f64,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    computations: AtomicU64,
}

impl AnalysisEngine {
    pub fn new(store: Arc<SeriesStore>, repo: Arc<dyn Repository>) -> Self {
        Self {
            store,
            repo,
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            slots: Mutex::new(HashMap::new()),
            computations: AtomicU64::new(0),
        }
    }

    /// Set the |z| threshold used by anomaly reports.
    pub fn with_anomaly_threshold(mut self, threshold: f64) -> Self {
        self.anomaly_threshold = threshold;
        self
    }

    pub fn anomaly_threshold(&self) -> f64 {
        self.anomaly_threshold
    }

    /// Number of reports computed since construction.
    ///
    /// Reports reused from the repository are not counted.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::SeqCst)
    }

    /// Return the current report for `(series_id, kind)`, computing it if needed.
    ///
    /// Returns the cached report while the series has not been re-ingested.
    /// Concurrent calls for the same key share one computation.
    pub async fn analyze(&self, series_id: &str, kind: ReportKind) -> Result<Arc<AnalysisReport>> {
        let series = self.store.get(series_id)?;

        match kind {
            ReportKind::Summary => {
                let (series, cell) = self.slot(series, kind);
                let report = cell.get_or_try_init(|| self.summary_report(&series)).await?;
                Ok(Arc::clone(report))
            }
            base => self.base_report(series, base).await,
        }
    }

    /// Cached report for `(series_id, kind)` without computing one.
    ///
    /// Returns `None` when nothing is cached or the series was re-ingested
    /// since the cached report was computed.
    pub fn current(&self, series_id: &str, kind: ReportKind) -> Option<Arc<AnalysisReport>> {
        let fetched_at = self.store.get(series_id).ok()?.fetched_at;
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(&(series_id.to_string(), kind))?;
        if slot.series.fetched_at != fetched_at {
            return None;
        }
        slot.report.get().cloned()
    }

    /// Persisted reports of one kind for a series, oldest first.
    pub fn history(&self, series_id: &str, kind: ReportKind) -> Result<Vec<AnalysisReport>> {
        Ok(self
            .repo
            .find_reports(series_id)?
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect())
    }

    /// Trend, volatility and anomaly reports; never recurses into summaries.
    async fn base_report(&self, series: Arc<Series>, kind: ReportKind) -> Result<Arc<AnalysisReport>> {
        let (series, cell) = self.slot(series, kind);
        let report = cell
            .get_or_try_init(|| async {
                let reusable = |r: &AnalysisReport| match &r.payload {
                    ReportPayload::Anomaly(a) => a.threshold == self.anomaly_threshold,
                    _ => true,
                };
                if let Some(report) = self.persisted(&series, kind, reusable)? {
                    return Ok(report);
                }
                let payload = self.compute(&series, kind)?;
                self.record(&series, payload)
            })
            .await?;
        Ok(Arc::clone(report))
    }

    async fn summary_report(&self, series: &Arc<Series>) -> Result<Arc<AnalysisReport>> {
        Self::ensure_enough(series, ReportKind::Summary)?;

        let trend = self.base_report(Arc::clone(series), ReportKind::Trend).await?;
        let volatility = self
            .base_report(Arc::clone(series), ReportKind::Volatility)
            .await?;
        let anomaly = self
            .base_report(Arc::clone(series), ReportKind::Anomaly)
            .await?;

        let newest_part = [&trend, &volatility, &anomaly]
            .iter()
            .map(|r| r.generated_at)
            .max()
            .unwrap_or(series.fetched_at);
        let reusable = |r: &AnalysisReport| r.generated_at >= newest_part;
        if let Some(report) = self.persisted(series, ReportKind::Summary, reusable)? {
            return Ok(report);
        }

        let payload = Self::summarize(series, &trend, &volatility, &anomaly)?;
        self.record(series, payload)
    }

    /// Newest persisted report of `kind` for this version of `series` that
    /// `reusable` accepts.
    fn persisted(
        &self,
        series: &Series,
        kind: ReportKind,
        reusable: impl Fn(&AnalysisReport) -> bool,
    ) -> Result<Option<Arc<AnalysisReport>>> {
        let found = self
            .repo
            .find_reports(&series.id)?
            .into_iter()
            .rev()
            .find(|r| r.kind == kind && r.series_fetched_at == series.fetched_at && reusable(r));

        if let Some(report) = &found {
            tracing::debug!(
                series_id = %series.id,
                kind = %kind,
                report_id = %report.id,
                "Reusing persisted analysis report"
            );
        }
        Ok(found.map(Arc::new))
    }

    /// Look up or install the cache slot for `series`' version.
    ///
    /// Returns the series version bound to the slot, which may be newer than
    /// the one passed in if another caller already saw a later ingest.
    fn slot(
        &self,
        series: Arc<Series>,
        kind: ReportKind,
    ) -> (Arc<Series>, Arc<OnceCell<Arc<AnalysisReport>>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (series.id.clone(), kind);

        match slots.get(&key) {
            Some(slot) if slot.series.fetched_at >= series.fetched_at => {
                tracing::debug!(
                    series_id = %series.id,
                    kind = %kind,
                    fetched_at = %slot.series.fetched_at,
                    "Using cached analysis slot"
                );
                (Arc::clone(&slot.series), Arc::clone(&slot.report))
            }
            stale => {
                if let Some(old) = stale {
                    tracing::debug!(
                        series_id = %series.id,
                        kind = %kind,
                        cached_fetched_at = %old.series.fetched_at,
                        fetched_at = %series.fetched_at,
                        "Analysis slot is stale, replacing"
                    );
                }
                let report = Arc::new(OnceCell::new());
                slots.insert(
                    key,
                    Slot {
                        series: Arc::clone(&series),
                        report: Arc::clone(&report),
                    },
                );
                (series, report)
            }
        }
    }

    fn ensure_enough(series: &Series, kind: ReportKind) -> Result<()> {
        let required = kind.min_observations();
        if series.len() < required {
            return Err(Error::InsufficientData {
                series_id: series.id.clone(),
                required,
                actual: series.len(),
            });
        }
        Ok(())
    }

    fn compute(&self, series: &Series, kind: ReportKind) -> Result<ReportPayload> {
        Self::ensure_enough(series, kind)?;
        let values = series.values();
        let insufficient = || Error::InsufficientData {
            series_id: series.id.clone(),
            required: kind.min_observations(),
            actual: values.len(),
        };

        match kind {
            ReportKind::Trend => stats::trend(&values)
                .map(ReportPayload::Trend)
                .ok_or_else(insufficient),
            ReportKind::Volatility => stats::volatility(&values)
                .map(ReportPayload::Volatility)
                .ok_or_else(insufficient),
            ReportKind::Anomaly => {
                let vol = stats::volatility(&values).ok_or_else(insufficient)?;
                Ok(ReportPayload::Anomaly(stats::anomalies(
                    &values,
                    &vol,
                    self.anomaly_threshold,
                )))
            }
            ReportKind::Summary => Err(Error::Config(
                "summary reports are composed, not computed directly".to_string(),
            )),
        }
    }

    /// Compose a summary from the trend, volatility and anomaly reports.
    fn summarize(
        series: &Series,
        trend: &AnalysisReport,
        volatility: &AnalysisReport,
        anomaly: &AnalysisReport,
    ) -> Result<ReportPayload> {
        let (ReportPayload::Trend(trend), ReportPayload::Volatility(volatility), ReportPayload::Anomaly(anomaly)) =
            (&trend.payload, &volatility.payload, &anomaly.payload)
        else {
            return Err(Error::Config(format!(
                "cached reports for {} have unexpected kinds",
                series.id
            )));
        };

        let date = |o: Option<&crate::types::Observation>| {
            o.map(|o| o.timestamp.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
        };

        let text = stats::compose_summary(&SummaryInput {
            series_id: &series.id,
            observation_count: series.len(),
            first_date: date(series.first()),
            last_date: date(series.latest()),
            latest_value: series.latest().map(|o| o.value).unwrap_or_default(),
            trend,
            volatility,
            anomaly,
        });

        Ok(ReportPayload::Summary(SummaryResult {
            text,
            trend: trend.clone(),
            volatility: *volatility,
            anomaly_count: anomaly.flagged.len(),
        }))
    }

    /// Create, count and persist a new report.
    fn record(&self, series: &Series, payload: ReportPayload) -> Result<Arc<AnalysisReport>> {
        let report = AnalysisReport {
            id: uuid::Uuid::new_v4().to_string(),
            series_id: series.id.clone(),
            kind: payload.kind(),
            payload,
            series_fetched_at: series.fetched_at,
            generated_at: Utc::now(),
        };

        self.computations.fetch_add(1, Ordering::SeqCst);
        self.repo.save_report(&report)?;

        tracing::info!(
            series_id = %report.series_id,
            kind = %report.kind,
            report_id = %report.id,
            "Computed analysis report"
        );

        Ok(Arc::new(report))
    }
}
