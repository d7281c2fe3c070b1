//! Series provider backed by FRED observation files
//!
//! Reads `<data_dir>/<SERIES_ID>.json` in the shape returned by the FRED
//! `series/observations` endpoint:
//!
//! ```json
//! {"observations": [{"date": "2020-01-01", "value": "3.5"}, {"date": "2020-02-01", "value": "."}]}
//! ```
//!
//! Missing values (`"."`) and other non-numeric values are skipped.

use super::SeriesProvider;
use crate::error::{Error, Result};
use crate::types::Observation;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct ObservationsFile {
    observations: Vec<RawObservation>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    date: String,
    value: String,
}

/// Reads series from a directory of FRED JSON files.
#[derive(Debug, Clone)]
pub struct FileSeriesProvider {
    data_dir: PathBuf,
}

impl FileSeriesProvider {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn series_path(&self, series_id: &str) -> Result<PathBuf> {
        let valid = !series_id.is_empty()
            && series_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::InvalidSeries {
                series_id: series_id.to_string(),
                reason: "series id must be ASCII alphanumeric".to_string(),
            });
        }
        Ok(self.data_dir.join(format!("{}.json", series_id)))
    }
}

#[async_trait]
impl SeriesProvider for FileSeriesProvider {
    async fn fetch(&self, series_id: &str) -> Result<Vec<Observation>> {
        let path = self.series_path(series_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("series file", path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let observations = parse_observations(series_id, &raw)?;
        tracing::debug!(
            series_id,
            path = %path.display(),
            count = observations.len(),
            "Read series file"
        );
        Ok(observations)
    }
}

/// Parse a FRED observations document.
pub fn parse_observations(series_id: &str, raw: &str) -> Result<Vec<Observation>> {
    let file: ObservationsFile = serde_json::from_str(raw)?;
    let mut observations = Vec::with_capacity(file.observations.len());
    let mut skipped = 0usize;

    for obs in file.observations {
        let date = NaiveDate::parse_from_str(&obs.date, "%Y-%m-%d").map_err(|e| {
            Error::InvalidSeries {
                series_id: series_id.to_string(),
                reason: format!("bad date {:?}: {}", obs.date, e),
            }
        })?;
        let Ok(value) = obs.value.trim().parse::<f64>() else {
            skipped += 1;
            continue;
        };
        if !value.is_finite() {
            skipped += 1;
            continue;
        }
        let timestamp = date.and_time(chrono::NaiveTime::MIN).and_utc();
        observations.push(Observation::new(timestamp, value));
    }

    if skipped > 0 {
        tracing::debug!(series_id, skipped, "Skipped non-numeric observations");
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use chrono::{Datelike, TimeZone, Utc};

    const SAMPLE: &str = r#"{
        "realtime_start": "2024-01-01",
        "observations": [
            {"realtime_start": "2024-01-01", "date": "2020-01-01", "value": "3.5"},
            {"realtime_start": "2024-01-01", "date": "2020-02-01", "value": "."},
            {"realtime_start": "2024-01-01", "date": "2020-03-01", "value": "4.4"}
        ]
    }"#;

    #[test]
    fn test_parse_skips_missing_values() {
        let observations = parse_observations("UNRATE", SAMPLE).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(
            observations[0].timestamp,
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(observations[1].value, 4.4);
        assert_eq!(observations[1].timestamp.month(), 3);
    }

    #[test]
    fn test_parse_rejects_bad_date() {
        let raw = r#"{"observations": [{"date": "01/02/2020", "value": "1"}]}"#;
        let err = parse_observations("GDP", raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSeries);
    }

    #[tokio::test]
    async fn test_fetch_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UNRATE.json"), SAMPLE).unwrap();
        let provider = FileSeriesProvider::new(dir.path());

        let observations = provider.fetch("UNRATE").await.unwrap();
        assert_eq!(observations.len(), 2);

        let err = provider.fetch("CPIAUCSL").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fetch_rejects_path_components() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSeriesProvider::new(dir.path());
        let err = provider.fetch("../secrets").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSeries);
    }
}
