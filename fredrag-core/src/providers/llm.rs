//! HTTP generation providers
//!
//! [`LlmClient`] speaks the chat APIs of the providers in [`LlmProvider`]:
//! Ollama `/api/chat`, Anthropic `/v1/messages` and OpenAI
//! `/v1/chat/completions`. Network failures, 429 and 5xx responses map to
//! [`Error::Provider`] so the caller may retry them; other failures are
//! reported as [`Error::GenerationUnavailable`].

use super::{GenerationProvider, GenerationRequest};
use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are an economic data analyst. Answer using the \
provided series context. Cite series identifiers in square brackets exactly as \
given, e.g. [UNRATE]. If the context does not cover the question, say so.";

const MAX_TOKENS: u32 = 1024;

/// Generation provider backed by a remote or local LLM.
pub struct LlmClient {
    model: String,
    provider: LlmProvider,
    endpoint: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| config.provider.default_endpoint().to_string())
            .trim_end_matches('/')
            .to_string();
        let api_key = config.api_key.clone().or_else(|| {
            config
                .provider
                .api_key_env()
                .and_then(|var| std::env::var(var).ok())
        });

        if config.provider.api_key_env().is_some() && api_key.is_none() {
            return Err(Error::Config(
                "llm.api_key (or provider env var) is required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model: config.model.clone(),
            provider: config.provider,
            endpoint,
            api_key,
            http,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    fn url(&self) -> String {
        match self.provider {
            LlmProvider::Ollama => format!("{}/api/chat", self.endpoint),
            LlmProvider::Claude => format!("{}/v1/messages", self.endpoint),
            LlmProvider::OpenAI => format!("{}/v1/chat/completions", self.endpoint),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = self.api_key.as_deref().unwrap_or_default();
        match self.provider {
            LlmProvider::Ollama => {}
            LlmProvider::Claude => {
                headers.insert(
                    "x-api-key",
                    HeaderValue::from_str(key)
                        .map_err(|e| Error::Config(format!("invalid claude api key header: {e}")))?,
                );
                headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
            }
            LlmProvider::OpenAI => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", key))
                        .map_err(|e| Error::Config(format!("invalid auth header: {e}")))?,
                );
            }
        }
        Ok(headers)
    }

    fn body(&self, request: &GenerationRequest) -> Value {
        let messages = conversation(request);
        match self.provider {
            LlmProvider::Ollama => json!({
                "model": self.model,
                "stream": false,
                "messages": with_system(messages),
            }),
            LlmProvider::Claude => json!({
                "model": self.model,
                "max_tokens": MAX_TOKENS,
                "temperature": 0.4,
                "system": SYSTEM_PROMPT,
                "messages": messages,
            }),
            LlmProvider::OpenAI => json!({
                "model": self.model,
                "temperature": 0.4,
                "messages": with_system(messages),
            }),
        }
    }
}

#[async_trait]
impl GenerationProvider for LlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let name = self.provider.as_str();
        let resp = self
            .http
            .post(self.url())
            .headers(self.headers()?)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{name} request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Provider(format!("{name} read body failed: {e}")))?;

        if !status.is_success() {
            let message = format!("{name} returned {}: {}", status.as_u16(), body);
            return Err(if is_retryable_status(status) {
                Error::Provider(message)
            } else {
                Error::GenerationUnavailable(message)
            });
        }

        let json: Value = serde_json::from_str(&body)?;
        extract_text(self.provider, &json).ok_or_else(|| {
            Error::GenerationUnavailable(format!("{name} response missing message text"))
        })
    }
}

/// Generation provider used when no LLM is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableGenerator;

#[async_trait]
impl GenerationProvider for UnavailableGenerator {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Err(Error::GenerationUnavailable(
            "no [llm] provider configured".to_string(),
        ))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Prior turns followed by the current question with its context.
fn conversation(request: &GenerationRequest) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.history.len() * 2 + 1);
    for turn in &request.history {
        messages.push(json!({ "role": "user", "content": turn.user_input }));
        messages.push(json!({ "role": "assistant", "content": turn.response }));
    }

    let context = if request.context.is_empty() {
        "No series matched this question.".to_string()
    } else {
        request.context.clone()
    };
    messages.push(json!({
        "role": "user",
        "content": format!(
            "Relevant series (cite the identifiers in brackets):\n{}\n\nQuestion: {}",
            context, request.user_input
        ),
    }));
    messages
}

fn with_system(mut messages: Vec<Value>) -> Vec<Value> {
    messages.insert(0, json!({ "role": "system", "content": SYSTEM_PROMPT }));
    messages
}

fn extract_text(provider: LlmProvider, json: &Value) -> Option<String> {
    let text = match provider {
        LlmProvider::Ollama => json.get("message")?.get("content")?.as_str(),
        LlmProvider::Claude => json.get("content")?.as_array()?.first()?.get("text")?.as_str(),
        LlmProvider::OpenAI => json
            .get("choices")?
            .as_array()?
            .first()?
            .get("message")?
            .get("content")?
            .as_str(),
    };
    text.map(ToString::to_string)
}
