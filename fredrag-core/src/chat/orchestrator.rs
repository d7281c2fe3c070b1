//! Retrieval-augmented chat orchestrator
//!
//! Each turn walks a fixed state machine:
//!
//! ```text
//! Idle → Embedding → Retrieving → Composing → Generating → Completed
//!          │             │            │            │
//!          └─────────────┴────────────┴────────────┴──► Failed(kind)
//! ```
//!
//! - **Embedding** failures record a fallback turn (`EmbeddingUnavailable`).
//! - **Retrieving** on an empty index continues with no context.
//! - **Composing** asks the [`AnalysisEngine`] for each hit's summary report.
//! - **Generating** failures record the fallback response (`GenerationUnavailable`).
//!
//! No lock is held across provider or analysis awaits. Session appends are
//! serialized per session id and keep turn timestamps strictly increasing.

use super::context::{compose, ContextBlock};
use crate::analytics::AnalysisEngine;
use crate::cancel::CancellationToken;
use crate::config::ChatConfig;
use crate::db::Repository;
use crate::error::{Error, ErrorKind, Result};
use crate::index::VectorIndex;
use crate::providers::{
    call_with_retry, CallPolicy, EmbeddingProvider, GenerationProvider, GenerationRequest,
};
use crate::types::{ChatSession, ChatTurn, ContextRef, ReportKind, SearchHit};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Position of a chat turn in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Embedding,
    Retrieving,
    Composing,
    Generating,
    Completed,
    Failed(ErrorKind),
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Failed(_))
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnState::Idle => f.write_str("idle"),
            TurnState::Embedding => f.write_str("embedding"),
            TurnState::Retrieving => f.write_str("retrieving"),
            TurnState::Composing => f.write_str("composing"),
            TurnState::Generating => f.write_str("generating"),
            TurnState::Completed => f.write_str("completed"),
            TurnState::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}

/// Tracks and logs the state of one turn.
struct Turn<'a> {
    session_id: &'a str,
    state: TurnState,
}

impl<'a> Turn<'a> {
    fn new(session_id: &'a str) -> Self {
        Self {
            session_id,
            state: TurnState::Idle,
        }
    }

    fn advance(&mut self, next: TurnState) {
        tracing::debug!(
            session_id = self.session_id,
            from = %self.state,
            to = %next,
            "Chat turn transition"
        );
        self.state = next;
    }

    /// Fail the turn if the caller cancelled before the next state boundary.
    fn checkpoint(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            self.advance(TurnState::Failed(ErrorKind::Cancelled));
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Answers chat turns from retrieved series context.
pub struct RetrievalOrchestrator {
    engine: Arc<AnalysisEngine>,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    repo: Arc<dyn Repository>,
    config: ChatConfig,
    sessions: DashMap<String, ChatSession>,
}

impl RetrievalOrchestrator {
    pub fn new(
        engine: Arc<AnalysisEngine>,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        repo: Arc<dyn Repository>,
        config: ChatConfig,
    ) -> Self {
        Self {
            engine,
            index,
            embedder,
            generator,
            repo,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Run one chat turn for `session_id`, creating the session if needed.
    ///
    /// Provider failures do not fail the call: the turn is recorded with the
    /// fallback response and the failure kind. Errors are returned for
    /// cancellation before generation (nothing recorded), for caller misuse
    /// such as a query dimension that does not match the index (recorded, then
    /// returned), and for storage failures.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        user_input: &str,
        cancel: &CancellationToken,
    ) -> Result<ChatTurn> {
        let mut turn = Turn::new(session_id);
        let history = self.history_window(session_id)?;
        turn.checkpoint(cancel)?;

        // Embedding
        turn.advance(TurnState::Embedding);
        let embed_policy = CallPolicy {
            timeout: self.config.embed_timeout(),
            retries: self.config.provider_retries,
        };
        let embedder = self.embedder.as_ref();
        let embedding = call_with_retry("embed", embed_policy, move || embedder.embed(user_input));
        let embedded = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = embedding => Some(result),
        };
        let query = match embedded {
            None => {
                turn.advance(TurnState::Failed(ErrorKind::Cancelled));
                return Err(Error::Cancelled);
            }
            Some(Ok(query)) => query,
            Some(Err(e)) => {
                tracing::warn!(session_id, error = %e, "Embedding provider unavailable");
                return self.fail(&mut turn, user_input, Vec::new(), ErrorKind::EmbeddingUnavailable);
            }
        };
        turn.checkpoint(cancel)?;

        // Retrieving
        turn.advance(TurnState::Retrieving);
        let hits = match self.index.search(&query, self.config.top_k) {
            Ok(hits) => hits,
            Err(Error::EmptyIndex) => {
                tracing::info!(session_id, "Vector index is empty, answering without context");
                Vec::new()
            }
            Err(e) => {
                self.fail(&mut turn, user_input, Vec::new(), e.kind())?;
                return Err(e);
            }
        };
        turn.checkpoint(cancel)?;

        // Composing
        turn.advance(TurnState::Composing);
        let blocks = self.context_blocks(hits).await;
        let composed = compose(blocks, self.config.context_budget_chars);
        turn.checkpoint(cancel)?;

        // Generating
        turn.advance(TurnState::Generating);
        let request = GenerationRequest {
            context: composed.text,
            user_input: user_input.to_string(),
            history,
        };
        let generate_policy = CallPolicy {
            timeout: self.config.generate_timeout(),
            retries: self.config.provider_retries,
        };
        let generator = self.generator.as_ref();
        let request = &request;
        let generation =
            call_with_retry("generate", generate_policy, move || generator.generate(request));
        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = generation => result,
        };

        match generated {
            Ok(response) => {
                turn.advance(TurnState::Completed);
                self.append(session_id, user_input, composed.references, response, None)
            }
            Err(Error::Cancelled) => {
                tracing::info!(session_id, "Chat turn cancelled during generation");
                self.fail(&mut turn, user_input, composed.references, ErrorKind::Cancelled)
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Generation provider unavailable");
                self.fail(
                    &mut turn,
                    user_input,
                    composed.references,
                    ErrorKind::GenerationUnavailable,
                )
            }
        }
    }

    /// Current state of a session.
    pub fn session(&self, session_id: &str) -> Result<ChatSession> {
        if let Some(session) = self.sessions.get(session_id) {
            if !session.turns.is_empty() {
                return Ok(session.clone());
            }
        }
        self.repo
            .find_session(session_id)?
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    /// Ids of every persisted session.
    pub fn session_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .repo
            .find_all_sessions()?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    /// Last successful turns of the session, oldest first.
    fn history_window(&self, session_id: &str) -> Result<Vec<ChatTurn>> {
        let cached = self.sessions.get(session_id).map(|s| s.clone());
        let session = match cached {
            Some(session) => session,
            None => {
                let loaded = self
                    .repo
                    .find_session(session_id)?
                    .unwrap_or_else(|| ChatSession::new(session_id));
                self.sessions
                    .entry(session_id.to_string())
                    .or_insert(loaded)
                    .clone()
            }
        };

        let successful: Vec<ChatTurn> = session
            .turns
            .into_iter()
            .filter(|t| t.failure.is_none())
            .collect();
        let skip = successful.len().saturating_sub(self.config.history_turns);
        Ok(successful.into_iter().skip(skip).collect())
    }

    async fn context_blocks(&self, hits: Vec<SearchHit>) -> Vec<ContextBlock> {
        let mut blocks = Vec::with_capacity(hits.len());
        for hit in hits {
            let series_id = hit.entry.series_id.clone();
            let summary = self.engine.analyze(&series_id, ReportKind::Summary).await;
            let (report_id, body) = match summary {
                Ok(report) => (
                    Some(report.id.clone()),
                    report.summary_text().unwrap_or_default().to_string(),
                ),
                Err(e) => {
                    tracing::debug!(
                        series_id = %series_id,
                        error = %e,
                        "No summary for retrieved series"
                    );
                    (None, format!("analysis unavailable ({})", e.kind()))
                }
            };
            blocks.push(ContextBlock::new(
                ContextRef {
                    series_id,
                    report_id,
                    similarity: hit.similarity,
                },
                &body,
            ));
        }
        blocks
    }

    /// Record the fallback response for a failed turn.
    fn fail(
        &self,
        turn: &mut Turn<'_>,
        user_input: &str,
        context: Vec<ContextRef>,
        kind: ErrorKind,
    ) -> Result<ChatTurn> {
        turn.advance(TurnState::Failed(kind));
        self.append(
            turn.session_id,
            user_input,
            context,
            self.config.fallback_response.clone(),
            Some(kind),
        )
    }

    fn append(
        &self,
        session_id: &str,
        user_input: &str,
        context: Vec<ContextRef>,
        response: String,
        failure: Option<ErrorKind>,
    ) -> Result<ChatTurn> {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ChatSession::new(session_id));

        let now = Utc::now();
        let timestamp = match session.last_timestamp() {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };

        let turn = ChatTurn {
            user_input: user_input.to_string(),
            context,
            response,
            failure,
            timestamp,
        };
        self.repo.append_turn(session_id, &turn)?;
        session.turns.push(turn.clone());

        tracing::info!(
            session_id,
            turn = session.turns.len(),
            context = turn.context.len(),
            failure = ?turn.failure,
            "Recorded chat turn"
        );
        Ok(turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use crate::providers::HashingEmbedder;
    use crate::store::SeriesStore;
    use crate::types::Observation;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const DIM: usize = 64;

    /// Echoes the request and remembers it.
    #[derive(Default)]
    struct RecordingGenerator {
        requests: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl GenerationProvider for RecordingGenerator {
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(format!("answer to: {}", request.user_input))
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl GenerationProvider for FailingGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            Err(Error::Provider("503 service unavailable".to_string()))
        }
    }

    /// Cancels the turn's token once dispatched, then never finishes in time.
    struct CancellingGenerator {
        token: CancellationToken,
    }

    #[async_trait]
    impl GenerationProvider for CancellingGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            self.token.cancel();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }
    }

    #[derive(Default)]
    struct FailingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Provider("connection reset".to_string()))
        }
    }

    struct Fixture {
        store: Arc<SeriesStore>,
        repo: Arc<MemoryRepository>,
        engine: Arc<AnalysisEngine>,
        index: Arc<VectorIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(SeriesStore::new());
            let repo = Arc::new(MemoryRepository::new());
            let engine = Arc::new(AnalysisEngine::new(Arc::clone(&store), repo.clone()));
            Self {
                store,
                repo,
                engine,
                index: Arc::new(VectorIndex::new()),
            }
        }

        fn add_series(&self, id: &str, description: &str, values: &[f64]) {
            let observations = values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    Observation::new(Utc.timestamp_opt(i as i64 * 86_400, 0).unwrap(), *v)
                })
                .collect();
            self.store.ingest(id, observations).unwrap();
            let embedding = HashingEmbedder::new(DIM).embed_text(description);
            self.index.upsert(id, embedding).unwrap();
        }

        fn orchestrator(
            &self,
            embedder: Arc<dyn EmbeddingProvider>,
            generator: Arc<dyn GenerationProvider>,
        ) -> RetrievalOrchestrator {
            RetrievalOrchestrator::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.index),
                embedder,
                generator,
                self.repo.clone(),
                ChatConfig {
                    embed_timeout_ms: 500,
                    generate_timeout_ms: 500,
                    ..ChatConfig::default()
                },
            )
        }
    }

    fn hashing() -> Arc<dyn EmbeddingProvider> {
        Arc::new(HashingEmbedder::new(DIM))
    }

    #[tokio::test]
    async fn test_empty_index_completes_with_empty_context() {
        let fixture = Fixture::new();
        let generator = Arc::new(RecordingGenerator::default());
        let chat = fixture.orchestrator(hashing(), generator.clone());

        let turn = chat
            .submit_turn("s1", "what is inflation doing?", &CancellationToken::new())
            .await
            .unwrap();

        assert!(turn.context.is_empty());
        assert_eq!(turn.failure, None);
        assert_eq!(turn.response, "answer to: what is inflation doing?");
        assert!(generator.requests.lock().unwrap()[0].context.is_empty());
        assert_eq!(fixture.repo.find_session("s1").unwrap().unwrap().turns.len(), 1);
    }

    #[tokio::test]
    async fn test_context_cites_retrieved_summaries() {
        let fixture = Fixture::new();
        fixture.add_series("UNRATE", "UNRATE unemployment rate civilian labor", &[3.5, 3.6, 4.4, 14.7]);
        fixture.add_series("HOUST", "HOUST housing starts new privately owned", &[1.2, 1.3, 1.1, 0.9]);
        let generator = Arc::new(RecordingGenerator::default());
        let chat = fixture.orchestrator(hashing(), generator.clone());

        let turn = chat
            .submit_turn("s1", "how is the unemployment rate?", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.context[0].series_id, "UNRATE");
        let report_id = turn.context[0].report_id.clone().unwrap();
        let report = fixture.repo.find_report(&report_id).unwrap().unwrap();
        assert_eq!(report.kind, ReportKind::Summary);
        assert!(turn.context.windows(2).all(|w| w[0].similarity >= w[1].similarity));

        let requests = generator.requests.lock().unwrap();
        assert!(requests[0].context.starts_with("[UNRATE]"));
        assert!(requests[0].context.contains(report.summary_text().unwrap()));
    }

    #[tokio::test]
    async fn test_series_without_summary_still_in_context() {
        let fixture = Fixture::new();
        fixture.add_series("NEWSERIES", "brand new series", &[1.0]);
        let generator = Arc::new(RecordingGenerator::default());
        let chat = fixture.orchestrator(hashing(), generator.clone());

        let turn = chat
            .submit_turn("s1", "brand new series", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.context.len(), 1);
        assert_eq!(turn.context[0].report_id, None);
        assert!(generator.requests.lock().unwrap()[0]
            .context
            .contains("analysis unavailable (insufficient_data)"));
    }

    #[tokio::test]
    async fn test_generation_failure_records_fallback() {
        let fixture = Fixture::new();
        fixture.add_series("GDP", "GDP gross domestic product", &[1.0, 2.0, 3.0]);
        let chat = fixture.orchestrator(hashing(), Arc::new(FailingGenerator));

        let turn = chat
            .submit_turn("s1", "gross domestic product", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.response, chat.config().fallback_response);
        assert_eq!(turn.failure, Some(ErrorKind::GenerationUnavailable));
        assert_eq!(turn.context_series_ids(), vec!["GDP"]);

        let stored = fixture.repo.find_session("s1").unwrap().unwrap();
        assert_eq!(stored.turns[0], turn);
    }

    #[tokio::test]
    async fn test_embedding_failure_retries_then_records_fallback() {
        let fixture = Fixture::new();
        let embedder = Arc::new(FailingEmbedder::default());
        let chat = fixture.orchestrator(embedder.clone(), Arc::new(RecordingGenerator::default()));

        let turn = chat
            .submit_turn("s1", "anything", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.failure, Some(ErrorKind::EmbeddingUnavailable));
        assert!(turn.context.is_empty());
        assert_eq!(
            embedder.calls.load(Ordering::SeqCst),
            chat.config().provider_retries + 1
        );
    }

    #[tokio::test]
    async fn test_cancel_before_generation_records_nothing() {
        let fixture = Fixture::new();
        let chat = fixture.orchestrator(hashing(), Arc::new(RecordingGenerator::default()));
        let token = CancellationToken::new();
        token.cancel();

        let err = chat.submit_turn("s1", "hello", &token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(fixture.repo.find_session("s1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_generation_records_fallback() {
        let fixture = Fixture::new();
        let token = CancellationToken::new();
        let generator = Arc::new(CancellingGenerator {
            token: token.clone(),
        });
        let chat = fixture.orchestrator(hashing(), generator);

        let turn = chat.submit_turn("s1", "hello", &token).await.unwrap();
        assert_eq!(turn.failure, Some(ErrorKind::Cancelled));
        assert_eq!(turn.response, chat.config().fallback_response);
        assert_eq!(fixture.repo.find_session("s1").unwrap().unwrap().turns.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_surfaced() {
        let fixture = Fixture::new();
        fixture.add_series("GDP", "gross domestic product", &[1.0, 2.0]);
        let chat = fixture.orchestrator(
            Arc::new(HashingEmbedder::new(DIM + 1)),
            Arc::new(RecordingGenerator::default()),
        );

        let err = chat
            .submit_turn("s1", "gdp", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);

        let session = chat.session("s1").unwrap();
        assert_eq!(session.turns[0].failure, Some(ErrorKind::DimensionMismatch));
    }

    #[tokio::test]
    async fn test_turns_are_ordered_and_carry_history() {
        let fixture = Fixture::new();
        let generator = Arc::new(RecordingGenerator::default());
        let chat = fixture.orchestrator(hashing(), generator.clone());
        let token = CancellationToken::new();

        for input in ["first", "second", "third"] {
            chat.submit_turn("s1", input, &token).await.unwrap();
        }

        let session = chat.session("s1").unwrap();
        assert_eq!(session.turns.len(), 3);
        assert!(session
            .turns
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));

        let requests = generator.requests.lock().unwrap();
        assert!(requests[0].history.is_empty());
        let prior: Vec<_> = requests[2]
            .history
            .iter()
            .map(|t| t.user_input.as_str())
            .collect();
        assert_eq!(prior, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_history_window_is_bounded() {
        let fixture = Fixture::new();
        let generator = Arc::new(RecordingGenerator::default());
        let chat = RetrievalOrchestrator::new(
            Arc::clone(&fixture.engine),
            Arc::clone(&fixture.index),
            hashing(),
            generator.clone(),
            fixture.repo.clone(),
            ChatConfig {
                history_turns: 1,
                ..ChatConfig::default()
            },
        );
        let token = CancellationToken::new();
        for input in ["a", "b", "c"] {
            chat.submit_turn("s1", input, &token).await.unwrap();
        }

        let requests = generator.requests.lock().unwrap();
        assert_eq!(requests[2].history.len(), 1);
        assert_eq!(requests[2].history[0].user_input, "b");
    }

    #[tokio::test]
    async fn test_session_lookup() {
        let fixture = Fixture::new();
        let chat = fixture.orchestrator(hashing(), Arc::new(RecordingGenerator::default()));
        assert_eq!(chat.session("nope").unwrap_err().kind(), ErrorKind::NotFound);

        chat.submit_turn("s1", "hi", &CancellationToken::new())
            .await
            .unwrap();

        // A fresh orchestrator over the same repository sees the persisted session
        let reloaded = fixture.orchestrator(hashing(), Arc::new(RecordingGenerator::default()));
        assert_eq!(reloaded.session("s1").unwrap().turns.len(), 1);
        assert_eq!(reloaded.session_ids().unwrap(), vec!["s1".to_string()]);
    }
}
