//! Series ingestion
//!
//! Pulls series from a [`SeriesProvider`] into the core and keeps the vector
//! index in step with the stored data.
//!
//! ## Flow
//!
//! ```text
//! ┌────────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │ SeriesProvider │ ──► │ IngestCoordinator│ ──► │ SeriesStore  │ ──► Repository
//! │ (FRED files)   │     │  fetch + backoff │     └──────────────┘
//! └────────────────┘     └──────────────────┘
//!                                │ describe_series
//!                                ▼
//!                     ┌──────────────────────┐     ┌──────────────┐
//!                     │  EmbeddingProvider   │ ──► │ VectorIndex  │ ──► Repository
//!                     └──────────────────────┘     └──────────────┘
//! ```
//!
//! A series that was stored but could not be embedded is still ingested; the
//! returned [`IngestOutcome`] carries the indexing error.

use crate::config::IngestConfig;
use crate::db::Repository;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::providers::{call_with_retry, CallPolicy, EmbeddingProvider, SeriesProvider};
use crate::store::SeriesStore;
use crate::types::{Observation, Series};
use std::sync::Arc;
use std::time::Duration;

/// Result of ingesting one series.
#[derive(Debug)]
pub struct IngestOutcome {
    pub series: Arc<Series>,
    /// Fetch attempts made, including the successful one
    pub attempts: usize,
    /// Why the series could not be (re)indexed, if it could not
    pub index_error: Option<Error>,
}

impl IngestOutcome {
    pub fn is_indexed(&self) -> bool {
        self.index_error.is_none()
    }
}

/// Result of ingesting a batch of series.
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub ingested: Vec<IngestOutcome>,
    /// Series that could not be ingested (series id, error)
    pub errors: Vec<(String, Error)>,
}

impl IngestSummary {
    pub fn indexed(&self) -> usize {
        self.ingested.iter().filter(|o| o.is_indexed()).count()
    }
}

/// Fetches, stores, persists and indexes series.
pub struct IngestCoordinator {
    store: Arc<SeriesStore>,
    index: Arc<VectorIndex>,
    repo: Arc<dyn Repository>,
    provider: Arc<dyn SeriesProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: IngestConfig,
    embed_policy: CallPolicy,
}

impl IngestCoordinator {
    pub fn new(
        store: Arc<SeriesStore>,
        index: Arc<VectorIndex>,
        repo: Arc<dyn Repository>,
        provider: Arc<dyn SeriesProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: IngestConfig,
        embed_policy: CallPolicy,
    ) -> Self {
        Self {
            store,
            index,
            repo,
            provider,
            embedder,
            config,
            embed_policy,
        }
    }

    /// Ingest one series from the provider.
    pub async fn ingest(&self, series_id: &str) -> Result<IngestOutcome> {
        let (observations, attempts) = self.fetch_with_retry(series_id).await?;

        let series = self.store.ingest(series_id, observations)?;
        self.repo.save_series(&series)?;

        let index_error = match self.index_series(&series).await {
            Ok(()) => None,
            Err(e @ (Error::Database(_) | Error::Io(_) | Error::Storage(_))) => return Err(e),
            Err(e) => {
                tracing::warn!(series_id, error = %e, "Series ingested but not indexed");
                Some(e)
            }
        };

        Ok(IngestOutcome {
            series,
            attempts,
            index_error,
        })
    }

    /// Ingest every series in `series_ids`, continuing past failures.
    pub async fn ingest_all<I, S>(&self, series_ids: I) -> IngestSummary
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut summary = IngestSummary::default();
        for id in series_ids {
            let id = id.as_ref();
            match self.ingest(id).await {
                Ok(outcome) => summary.ingested.push(outcome),
                Err(e) => {
                    tracing::warn!(series_id = id, error = %e, "Failed to ingest series");
                    summary.errors.push((id.to_string(), e));
                }
            }
        }

        tracing::info!(
            ingested = summary.ingested.len(),
            indexed = summary.indexed(),
            failed = summary.errors.len(),
            "Ingest batch complete"
        );
        summary
    }

    /// Fetch with exponential backoff on transient failures.
    async fn fetch_with_retry(&self, series_id: &str) -> Result<(Vec<Observation>, usize)> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(self.config.initial_backoff_ms);
        let max_delay = Duration::from_millis(self.config.max_backoff_ms);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    series_id,
                    attempt = attempt + 1,
                    max_attempts = self.config.max_retries + 1,
                    ?delay,
                    "Retrying series fetch"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
            }

            match self.provider.fetch(series_id).await {
                Ok(observations) => return Ok((observations, attempt + 1)),
                Err(e) if e.is_transient() => {
                    tracing::warn!(series_id, error = %e, "Transient error fetching series");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Provider("max retries exceeded".to_string())))
    }

    async fn index_series(&self, series: &Series) -> Result<()> {
        let description = describe_series(series);
        let embedder = self.embedder.as_ref();
        let text = description.as_str();
        let embedding = call_with_retry("embed", self.embed_policy, move || embedder.embed(text))
            .await
            .map_err(|e| match e {
                Error::Timeout { .. } | Error::Provider(_) => {
                    Error::EmbeddingUnavailable(e.to_string())
                }
                other => other,
            })?;

        let entry = self.index.upsert(&series.id, embedding)?;
        self.repo.save_vector(&entry)?;
        Ok(())
    }
}

/// Text embedded for a series.
///
/// Names the series and states its span, latest value and mean so that
/// questions mentioning the id or its level retrieve it.
pub fn describe_series(series: &Series) -> String {
    let (Some(first), Some(latest)) = (series.first(), series.latest()) else {
        return format!("Series {}: no observations.", series.id);
    };
    let mean = series.observations.iter().map(|o| o.value).sum::<f64>() / series.len() as f64;
    format!(
        "Series {}: {} observations from {} to {}. Latest value {:.4} on {}. Mean {:.4}.",
        series.id,
        series.len(),
        first.timestamp.format("%Y-%m-%d"),
        latest.timestamp.format("%Y-%m-%d"),
        latest.value,
        latest.timestamp.format("%Y-%m-%d"),
        mean
    )
}
