//! Explicit wiring of the core components
//!
//! [`Services`] builds every component from its collaborators. Nothing is
//! global: each component receives the shared pieces it needs as `Arc`s.

use crate::analytics::AnalysisEngine;
use crate::chat::RetrievalOrchestrator;
use crate::config::Config;
use crate::db::Repository;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::ingest::IngestCoordinator;
use crate::providers::{
    call_with_retry, CallPolicy, EmbeddingProvider, FileSeriesProvider, GenerationProvider,
    HashingEmbedder, LlmClient, SeriesProvider, UnavailableGenerator,
};
use crate::store::SeriesStore;
use crate::types::SearchHit;
use std::sync::Arc;

/// Counts from [`Services::restore`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreStats {
    pub series: usize,
    pub vectors: usize,
    /// Persisted records that could not be loaded
    pub skipped: usize,
}

/// The assembled core.
pub struct Services {
    pub config: Config,
    pub repo: Arc<dyn Repository>,
    pub store: Arc<SeriesStore>,
    pub engine: Arc<AnalysisEngine>,
    pub index: Arc<VectorIndex>,
    pub chat: Arc<RetrievalOrchestrator>,
    pub ingest: Arc<IngestCoordinator>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Services {
    pub fn new(
        config: Config,
        repo: Arc<dyn Repository>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        series_provider: Arc<dyn SeriesProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SeriesStore::new());
        let index = Arc::new(VectorIndex::new());
        let engine = Arc::new(
            AnalysisEngine::new(Arc::clone(&store), Arc::clone(&repo))
                .with_anomaly_threshold(config.analysis.anomaly_threshold),
        );
        let chat = Arc::new(RetrievalOrchestrator::new(
            Arc::clone(&engine),
            Arc::clone(&index),
            Arc::clone(&embedder),
            generator,
            Arc::clone(&repo),
            config.chat.clone(),
        ));
        let ingest = Arc::new(IngestCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&repo),
            series_provider,
            Arc::clone(&embedder),
            config.ingest.clone(),
            embed_policy(&config),
        ));

        Ok(Self {
            config,
            repo,
            store,
            engine,
            index,
            chat,
            ingest,
            embedder,
        })
    }

    /// Wire the built-in providers selected by `config`.
    ///
    /// Uses the hashing embedder, reads series files from `[ingest] data_dir`
    /// (or `<data dir>/series`) and generates through `[llm]` when configured.
    pub fn with_defaults(config: Config, repo: Arc<dyn Repository>) -> Result<Self> {
        let embedder = Arc::new(HashingEmbedder::new(config.index.embedding_dimensions));
        let generator: Arc<dyn GenerationProvider> = match &config.llm {
            Some(llm) => Arc::new(LlmClient::new(llm)?),
            None => Arc::new(UnavailableGenerator),
        };
        let data_dir = config
            .ingest
            .data_dir
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("series"));
        let series_provider = Arc::new(FileSeriesProvider::new(data_dir));

        Self::new(config, repo, embedder, generator, series_provider)
    }

    /// Reload persisted series and vectors into memory.
    ///
    /// Records that no longer validate are logged and skipped.
    pub fn restore(&self) -> Result<RestoreStats> {
        let mut stats = RestoreStats::default();

        for series in self.repo.find_all_series()? {
            let id = series.id.clone();
            match self.store.restore(series) {
                Ok(()) => stats.series += 1,
                Err(e) => {
                    tracing::warn!(series_id = %id, error = %e, "Skipping persisted series");
                    stats.skipped += 1;
                }
            }
        }

        for entry in self.repo.find_all_vectors()? {
            let id = entry.series_id.clone();
            match self.index.restore(entry) {
                Ok(()) => stats.vectors += 1,
                Err(e) => {
                    tracing::warn!(series_id = %id, error = %e, "Skipping persisted vector");
                    stats.skipped += 1;
                }
            }
        }

        tracing::info!(
            series = stats.series,
            vectors = stats.vectors,
            skipped = stats.skipped,
            "Restored state from repository"
        );
        Ok(stats)
    }

    /// Embed `query` and return the `k` most similar series.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let embedder = self.embedder.as_ref();
        let vector = call_with_retry("embed", embed_policy(&self.config), move || {
            embedder.embed(query)
        })
        .await
        .map_err(|e| match e {
            Error::Timeout { .. } | Error::Provider(_) => Error::EmbeddingUnavailable(e.to_string()),
            other => other,
        })?;
        self.index.search(&vector, k)
    }
}

fn embed_policy(config: &Config) -> CallPolicy {
    CallPolicy {
        timeout: config.chat.embed_timeout(),
        retries: config.chat.provider_retries,
    }
}
