//! Offline feature-hashing embedder
//!
//! Hashes lowercase terms into fixed-dimension buckets (FNV-1a), weights them by
//! term frequency and L2-normalizes the result. Deterministic and always
//! available, so ingestion and chat work without a remote embedding service.

use super::EmbeddingProvider;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Deterministic text embedder of a fixed dimension.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed synchronously. Text without terms maps to the zero vector.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let terms = tokenize(text);
        let mut vector = vec![0.0f32; self.dimensions];
        if terms.is_empty() {
            return vector;
        }

        let mut counts: HashMap<&str, f32> = HashMap::new();
        for term in &terms {
            *counts.entry(term.as_str()).or_default() += 1.0;
        }

        let total = terms.len() as f32;
        for (term, count) in counts {
            // longer terms carry more signal than short ones
            let weight = 1.0 + (term.len() as f32).ln();
            vector[bucket(term, self.dimensions)] += count / total * weight;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.chars().count() >= 2)
        .map(|s| s.to_lowercase())
        .collect()
}

fn bucket(term: &str, dimensions: usize) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in term.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % dimensions as u64) as usize
}
