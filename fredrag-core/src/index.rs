//! Vector similarity index
//!
//! Holds one embedding per series id and answers k-nearest-neighbour queries by
//! exhaustive cosine similarity.
//!
//! The dimension `D` is unset until the first successful upsert and fixed for
//! the lifetime of the index afterwards. Entries are stored as `Arc`s and
//! replaced whole, so a search never observes a partially written vector.

use crate::error::{Error, Result};
use crate::types::{SearchHit, VectorEntry};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

/// In-memory vector index keyed by series id.
#[derive(Default)]
pub struct VectorIndex {
    entries: DashMap<String, Arc<VectorEntry>>,
    dimension: OnceLock<usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed dimension, if any vector has been stored yet.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the vector for `series_id`.
    ///
    /// The first successful upsert fixes the index dimension. Later vectors of
    /// another length fail with `DimensionMismatch` and leave the index as it was.
    /// Upsert times are strictly increasing per series id.
    pub fn upsert(&self, series_id: &str, embedding: Vec<f32>) -> Result<Arc<VectorEntry>> {
        validate(series_id, &embedding)?;
        self.check_dimension(embedding.len())?;

        let mut slot = self.entries.entry(series_id.to_string()).or_insert_with(|| {
            Arc::new(VectorEntry {
                series_id: series_id.to_string(),
                embedding: Vec::new(),
                upserted_at: DateTime::<Utc>::MIN_UTC,
            })
        });
        let entry = Arc::new(VectorEntry {
            series_id: series_id.to_string(),
            embedding,
            upserted_at: next_upsert_time(slot.upserted_at),
        });
        *slot = Arc::clone(&entry);
        drop(slot);

        tracing::debug!(series_id, dimension = entry.embedding.len(), "Upserted vector");
        Ok(entry)
    }

    /// Load a persisted entry, keeping whichever of the stored and loaded
    /// entries was upserted last.
    pub fn restore(&self, entry: VectorEntry) -> Result<()> {
        validate(&entry.series_id, &entry.embedding)?;
        self.check_dimension(entry.embedding.len())?;

        self.entries
            .entry(entry.series_id.clone())
            .and_modify(|current| {
                if current.upserted_at < entry.upserted_at {
                    *current = Arc::new(entry.clone());
                }
            })
            .or_insert_with(|| Arc::new(entry.clone()));
        Ok(())
    }

    pub fn get(&self, series_id: &str) -> Option<Arc<VectorEntry>> {
        self.entries.get(series_id).map(|e| Arc::clone(e.value()))
    }

    /// Return the `k` entries most similar to `query`.
    ///
    /// Results are ordered by similarity descending, then by upsert time
    /// descending, then by series id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let Some(&dimension) = self.dimension.get() else {
            return Err(Error::EmptyIndex);
        };
        if query.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }
        if query.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidVector {
                series_id: "<query>".to_string(),
                reason: "non-finite component".to_string(),
            });
        }

        let snapshot: Vec<Arc<VectorEntry>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        if snapshot.is_empty() {
            return Err(Error::EmptyIndex);
        }

        let query_norm = magnitude(query);
        let mut hits: Vec<SearchHit> = snapshot
            .into_iter()
            .map(|entry| {
                let similarity = cosine(query, query_norm, &entry.embedding);
                SearchHit { entry, similarity }
            })
            .collect();

        hits.sort_by(rank);
        hits.truncate(k);
        Ok(hits)
    }

    /// All entries, sorted by series id.
    pub fn list(&self) -> Vec<Arc<VectorEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        entries.sort_by(|a, b| a.series_id.cmp(&b.series_id));
        entries
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        let expected = *self.dimension.get_or_init(|| {
            tracing::info!(dimension = actual, "Fixed vector index dimension");
            actual
        });
        if actual != expected {
            return Err(Error::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}

fn validate(series_id: &str, embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(Error::InvalidVector {
            series_id: series_id.to_string(),
            reason: "empty vector".to_string(),
        });
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(Error::InvalidVector {
            series_id: series_id.to_string(),
            reason: "non-finite component".to_string(),
        });
    }
    Ok(())
}

fn magnitude(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Cosine similarity; zero when either side has zero magnitude.
fn cosine(query: &[f32], query_norm: f64, stored: &[f32]) -> f32 {
    let stored_norm = magnitude(stored);
    if query_norm == 0.0 || stored_norm == 0.0 {
        return 0.0;
    }
    let dot: f64 = query
        .iter()
        .zip(stored)
        .map(|(&a, &b)| (a as f64) * (b as f64))
        .sum();
    (dot / (query_norm * stored_norm)).clamp(-1.0, 1.0) as f32
}

fn rank(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| b.entry.upserted_at.cmp(&a.entry.upserted_at))
        .then_with(|| a.entry.series_id.cmp(&b.entry.series_id))
}

fn next_upsert_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_exact_match_ranks_first() {
        let index = VectorIndex::new();
        index.upsert("GDP", vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        index.upsert("CPI", vec![4.0, 3.0, 2.0, 1.0]).unwrap();
        index.upsert("UNRATE", vec![-1.0, 0.0, 0.5, 0.0]).unwrap();

        let hits = index.search(&[1.0, 2.0, 3.0, 4.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].entry.series_id, "GDP");
        assert_relative_eq!(hits[0].similarity, 1.0, epsilon = 1e-6);
        assert!(hits[0].similarity >= hits[1].similarity);
        assert!(hits[1].similarity >= hits[2].similarity);
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_unchanged() {
        let index = VectorIndex::new();
        index.upsert("GDP", vec![1.0, 0.0, 0.0, 0.0]).unwrap();

        let err = index.upsert("CPI", vec![1.0, 0.0, 0.0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
        let err = index.upsert("GDP", vec![0.0, 1.0, 0.0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);

        assert_eq!(index.len(), 1);
        assert_eq!(index.dimension(), Some(4));
        assert_eq!(index.get("GDP").unwrap().embedding, vec![1.0, 0.0, 0.0, 0.0]);

        let err = index.search(&[1.0, 0.0], 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_empty_index() {
        let index = VectorIndex::new();
        assert_eq!(
            index.search(&[1.0, 0.0], 5).unwrap_err().kind(),
            ErrorKind::EmptyIndex
        );
        assert!(index.list().is_empty());
        assert_eq!(index.dimension(), None);
    }

    #[test]
    fn test_invalid_vectors_do_not_fix_dimension() {
        let index = VectorIndex::new();
        assert_eq!(
            index.upsert("GDP", vec![]).unwrap_err().kind(),
            ErrorKind::InvalidVector
        );
        assert_eq!(
            index.upsert("GDP", vec![f32::NAN, 1.0]).unwrap_err().kind(),
            ErrorKind::InvalidVector
        );
        assert_eq!(index.dimension(), None);

        index.upsert("GDP", vec![1.0, 1.0, 1.0]).unwrap();
        assert_eq!(index.dimension(), Some(3));
    }

    #[test]
    fn test_zero_magnitude_similarity_is_zero() {
        let index = VectorIndex::new();
        index.upsert("ZERO", vec![0.0, 0.0]).unwrap();
        index.upsert("ONE", vec![1.0, 0.0]).unwrap();

        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert!(hits.iter().all(|h| h.similarity == 0.0));

        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].entry.series_id, "ONE");
        assert_eq!(hits[1].similarity, 0.0);
    }

    #[test]
    fn test_ties_prefer_most_recent_upsert() {
        let index = VectorIndex::new();
        let now = Utc::now();
        index
            .restore(VectorEntry {
                series_id: "OLD".to_string(),
                embedding: vec![1.0, 0.0],
                upserted_at: now - Duration::seconds(10),
            })
            .unwrap();
        index
            .restore(VectorEntry {
                series_id: "NEW".to_string(),
                embedding: vec![2.0, 0.0],
                upserted_at: now,
            })
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].entry.series_id, "NEW");
        assert_eq!(hits[1].entry.series_id, "OLD");
    }

    #[test]
    fn test_restore_keeps_newer_entry() {
        let index = VectorIndex::new();
        let live = index.upsert("GDP", vec![1.0, 0.0]).unwrap();
        index
            .restore(VectorEntry {
                series_id: "GDP".to_string(),
                embedding: vec![0.0, 1.0],
                upserted_at: live.upserted_at - Duration::seconds(1),
            })
            .unwrap();
        assert_eq!(index.get("GDP").unwrap().embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn test_reupsert_advances_timestamp() {
        let index = VectorIndex::new();
        let first = index.upsert("GDP", vec![1.0, 0.0]).unwrap();
        let second = index.upsert("GDP", vec![0.0, 1.0]).unwrap();
        let third = index.upsert("GDP", vec![1.0, 1.0]).unwrap();
        assert!(first.upserted_at < second.upserted_at);
        assert!(second.upserted_at < third.upserted_at);
        assert_eq!(index.get("GDP").unwrap().embedding, vec![1.0, 1.0]);
    }

    #[test]
    fn test_search_k_bounds() {
        let index = VectorIndex::new();
        index.upsert("A", vec![1.0, 0.0]).unwrap();
        index.upsert("B", vec![0.0, 1.0]).unwrap();

        assert!(index.search(&[1.0, 1.0], 0).unwrap().is_empty());
        assert_eq!(index.search(&[1.0, 1.0], 10).unwrap().len(), 2);
    }

    fn vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-100.0f32..100.0, dim)
    }

    proptest! {
        #[test]
        fn prop_upsert_replaces_and_search_is_sorted(
            first in vector(4),
            second in vector(4),
            others in prop::collection::vec(vector(4), 0..8),
            query in vector(4),
        ) {
            let index = VectorIndex::new();
            index.upsert("TARGET", first).unwrap();
            for (i, v) in others.into_iter().enumerate() {
                index.upsert(&format!("S{}", i), v).unwrap();
            }
            index.upsert("TARGET", second.clone()).unwrap();

            let entries = index.list();
            prop_assert_eq!(
                entries.iter().filter(|e| e.series_id == "TARGET").count(),
                1
            );
            prop_assert_eq!(&index.get("TARGET").unwrap().embedding, &second);

            let hits = index.search(&query, entries.len()).unwrap();
            prop_assert_eq!(hits.len(), entries.len());
            for pair in hits.windows(2) {
                prop_assert!(pair[0].similarity >= pair[1].similarity);
            }
            let mut ids: Vec<_> = hits.iter().map(|h| h.entry.series_id.clone()).collect();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), hits.len());
            for hit in &hits {
                prop_assert!((-1.0..=1.0).contains(&hit.similarity));
            }
        }
    }
}
