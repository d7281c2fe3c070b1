//! External collaborators
//!
//! The core consumes three providers through async traits:
//!
//! | Trait | Built-in implementations |
//! |-------|--------------------------|
//! | [`SeriesProvider`] | [`FileSeriesProvider`] |
//! | [`EmbeddingProvider`] | [`HashingEmbedder`] |
//! | [`GenerationProvider`] | [`LlmClient`], [`UnavailableGenerator`] |
//!
//! Calls made from the core go through [`call_with_retry`], which bounds each
//! attempt with a timeout and retries transient failures.

pub mod file;
pub mod hashing;
pub mod llm;

pub use file::FileSeriesProvider;
pub use hashing::HashingEmbedder;
pub use llm::{LlmClient, UnavailableGenerator};

use crate::error::{Error, Result};
use crate::types::{ChatTurn, Observation};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Source of raw series observations.
#[async_trait]
pub trait SeriesProvider: Send + Sync {
    /// Fetch all observations for a series, in any order.
    async fn fetch(&self, series_id: &str) -> Result<Vec<Observation>>;
}

/// Text embedding provider.
///
/// Every call on one provider must return vectors of the same dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Text generation provider.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Input to a generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Retrieved context, one block per series
    pub context: String,
    pub user_input: String,
    /// Earlier turns of the same session, oldest first
    pub history: Vec<ChatTurn>,
}

/// Timeout and retry bound for one provider operation.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    /// Attempts after the first one
    pub retries: usize,
}

/// Run `call` under `policy`.
///
/// Each attempt is bounded by the policy timeout; an expired attempt counts as
/// a transient failure. Non-transient errors are returned immediately.
pub async fn call_with_retry<T, F, Fut>(
    operation: &'static str,
    policy: CallPolicy,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout_ms: policy.timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.retries => {
                attempt += 1;
                tracing::warn!(
                    operation,
                    attempt,
                    max_retries = policy.retries,
                    error = %e,
                    "Transient provider failure, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(retries: usize) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(50),
            retries,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures_up_to_bound() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = call_with_retry("embed", policy(2), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Provider("503".to_string()))
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Provider);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = call_with_retry("embed", policy(1), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Provider("reset".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = call_with_retry("generate", policy(3), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::GenerationUnavailable("not configured".to_string()))
        })
        .await;

        assert_eq!(
            result.unwrap_err().kind(),
            ErrorKind::GenerationUnavailable
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = call_with_retry("generate", policy(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
