//! In-memory series store
//!
//! Holds the current version of every ingested series. Ingest is full-refresh:
//! the stored series is replaced wholesale. Writers for the same id serialize on
//! the map shard; writers for other ids proceed independently.

use crate::error::{Error, Result};
use crate::types::{Observation, Series};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Current version of every ingested series, keyed by id.
#[derive(Default)]
pub struct SeriesStore {
    series: DashMap<String, Arc<Series>>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored series for `series_id`.
    ///
    /// Observations are sorted by timestamp; a repeated timestamp keeps the last
    /// value supplied for it. The new `fetched_at` is strictly later than the
    /// previous version's so cached analyses always see the refresh.
    pub fn ingest(&self, series_id: &str, observations: Vec<Observation>) -> Result<Arc<Series>> {
        if series_id.trim().is_empty() {
            return Err(Error::InvalidSeries {
                series_id: series_id.to_string(),
                reason: "series id is empty".to_string(),
            });
        }

        let observations = normalize(series_id, observations)?;

        let mut slot = self.series.entry(series_id.to_string()).or_insert_with(|| {
            Arc::new(Series {
                id: series_id.to_string(),
                observations: Vec::new(),
                fetched_at: DateTime::<Utc>::MIN_UTC,
            })
        });

        let fetched_at = next_fetch_time(slot.fetched_at);
        let series = Arc::new(Series {
            id: series_id.to_string(),
            observations,
            fetched_at,
        });
        *slot = Arc::clone(&series);
        drop(slot);

        tracing::info!(
            series_id,
            observations = series.len(),
            fetched_at = %series.fetched_at,
            "Ingested series"
        );

        Ok(series)
    }

    /// Load a previously persisted series, keeping its `fetched_at`.
    ///
    /// An in-memory version that is already newer wins.
    pub fn restore(&self, series: Series) -> Result<()> {
        let observations = normalize(&series.id, series.observations)?;
        let restored = Arc::new(Series {
            id: series.id.clone(),
            observations,
            fetched_at: series.fetched_at,
        });

        self.series
            .entry(series.id)
            .and_modify(|current| {
                if current.fetched_at < restored.fetched_at {
                    *current = Arc::clone(&restored);
                }
            })
            .or_insert_with(|| Arc::clone(&restored));
        Ok(())
    }

    /// Get the current version of a series
    pub fn get(&self, series_id: &str) -> Result<Arc<Series>> {
        self.series
            .get(series_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::not_found("series", series_id))
    }

    /// All known series ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Sort by timestamp and collapse duplicate timestamps, last value wins.
fn normalize(series_id: &str, mut observations: Vec<Observation>) -> Result<Vec<Observation>> {
    if let Some(bad) = observations.iter().position(|o| !o.value.is_finite()) {
        return Err(Error::InvalidSeries {
            series_id: series_id.to_string(),
            reason: format!("observation {} has a non-finite value", bad),
        });
    }

    // Stable sort keeps input order among equal timestamps.
    observations.sort_by_key(|o| o.timestamp);

    let mut normalized: Vec<Observation> = Vec::with_capacity(observations.len());
    for obs in observations {
        match normalized.last_mut() {
            Some(last) if last.timestamp == obs.timestamp => *last = obs,
            _ => normalized.push(obs),
        }
    }

    if normalized
        .windows(2)
        .any(|w| w[0].timestamp >= w[1].timestamp)
    {
        return Err(Error::InvalidSeries {
            series_id: series_id.to_string(),
            reason: "timestamps are not strictly increasing".to_string(),
        });
    }

    Ok(normalized)
}

fn next_fetch_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}
