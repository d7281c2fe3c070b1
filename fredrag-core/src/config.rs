//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/fredrag/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/fredrag/` (~/.config/fredrag/)
//! - Data: `$XDG_DATA_HOME/fredrag/` (~/.local/share/fredrag/)
//! - State/Logs: `$XDG_STATE_HOME/fredrag/` (~/.local/state/fredrag/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Generation provider (optional; chat falls back without it)
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// LLM provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Provider type
    pub provider: LlmProvider,
    /// Model to use
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// HTTP request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

/// Supported LLM providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Claude,
    OpenAI,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::Claude => "claude",
            LlmProvider::OpenAI => "openai",
        }
    }

    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "http://localhost:11434",
            LlmProvider::Claude => "https://api.anthropic.com",
            LlmProvider::OpenAI => "https://api.openai.com",
        }
    }

    /// Environment variable consulted when no `api_key` is configured
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Ollama => None,
            LlmProvider::Claude => Some("ANTHROPIC_API_KEY"),
            LlmProvider::OpenAI => Some("OPENAI_API_KEY"),
        }
    }
}

fn default_llm_timeout() -> u64 {
    60
}

/// Time-series analysis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// |z| above which an observation is flagged as anomalous
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: default_anomaly_threshold(),
        }
    }
}

fn default_anomaly_threshold() -> f64 {
    2.0
}

/// Vector index configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Output dimension of the built-in hashing embedder
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

fn default_embedding_dimensions() -> usize {
    256
}

/// Retrieval-augmented chat configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Number of series retrieved per turn
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Maximum size of the composed context, in characters
    #[serde(default = "default_context_budget")]
    pub context_budget_chars: usize,

    /// Prior turns of the session passed to the generation provider
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    #[serde(default = "default_embed_timeout")]
    pub embed_timeout_ms: u64,

    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_ms: u64,

    /// Retries after a failed or timed-out provider call
    #[serde(default = "default_provider_retries")]
    pub provider_retries: usize,

    /// Response recorded when generation is unavailable
    #[serde(default = "default_fallback_response")]
    pub fallback_response: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            context_budget_chars: default_context_budget(),
            history_turns: default_history_turns(),
            embed_timeout_ms: default_embed_timeout(),
            generate_timeout_ms: default_generate_timeout(),
            provider_retries: default_provider_retries(),
            fallback_response: default_fallback_response(),
        }
    }
}

impl ChatConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_millis(self.generate_timeout_ms)
    }
}

fn default_top_k() -> usize {
    5
}

fn default_context_budget() -> usize {
    4000
}

fn default_history_turns() -> usize {
    6
}

fn default_embed_timeout() -> u64 {
    10_000
}

fn default_generate_timeout() -> u64 {
    30_000
}

fn default_provider_retries() -> usize {
    1
}

fn default_fallback_response() -> String {
    "unable to generate a response at this time".to_string()
}

/// Series ingestion configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Directory holding `<SERIES_ID>.json` observation files
    pub data_dir: Option<PathBuf>,

    /// Max retry attempts for transient fetch failures
    #[serde(default = "default_ingest_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_retries: default_ingest_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_ingest_max_retries() -> usize {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Also echo events at this level to stderr (off when unset)
    #[serde(default)]
    pub stderr_level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stderr_level: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let threshold = self.analysis.anomaly_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::Config(
                "analysis.anomaly_threshold must be a positive number".to_string(),
            ));
        }
        if self.index.embedding_dimensions == 0 {
            return Err(Error::Config(
                "index.embedding_dimensions must be at least 1".to_string(),
            ));
        }
        if self.chat.top_k == 0 {
            return Err(Error::Config("chat.top_k must be at least 1".to_string()));
        }
        if self.chat.context_budget_chars == 0 {
            return Err(Error::Config(
                "chat.context_budget_chars must be at least 1".to_string(),
            ));
        }
        if self.chat.embed_timeout_ms == 0 || self.chat.generate_timeout_ms == 0 {
            return Err(Error::Config(
                "chat provider timeouts must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/fredrag/config.toml` (~/.config/fredrag/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("fredrag").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/fredrag/` (~/.local/share/fredrag/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("fredrag")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/fredrag/` (~/.local/state/fredrag/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("fredrag")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/fredrag/data.db` (~/.local/share/fredrag/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    /// Returns today's log file path
    ///
    /// `$XDG_STATE_HOME/fredrag/fredrag.YYYY-MM-DD.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join(crate::logging::current_file_name())
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.llm.is_none());
        assert_eq!(config.analysis.anomaly_threshold, 2.0);
        assert_eq!(config.chat.top_k, 5);
        assert_eq!(config.chat.provider_retries, 1);
        assert_eq!(
            config.chat.fallback_response,
            "unable to generate a response at this time"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[llm]
provider = "ollama"
model = "llama3.2"

[analysis]
anomaly_threshold = 3.0

[chat]
top_k = 8
context_budget_chars = 1200

[logging]
level = "debug"
stderr_level = "warn"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        let llm = config.llm.unwrap();
        assert_eq!(llm.provider, LlmProvider::Ollama);
        assert_eq!(llm.model, "llama3.2");
        assert_eq!(llm.timeout_secs, 60);
        assert_eq!(config.analysis.anomaly_threshold, 3.0);
        assert_eq!(config.chat.top_k, 8);
        assert_eq!(config.chat.context_budget_chars, 1200);
        assert_eq!(config.chat.history_turns, 6);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.stderr_level.as_deref(), Some("warn"));
        assert_eq!(Config::default().logging.stderr_level, None);
    }

    #[test]
    fn test_llm_provider_endpoints() {
        assert_eq!(
            LlmProvider::Ollama.default_endpoint(),
            "http://localhost:11434"
        );
        assert_eq!(
            LlmProvider::Claude.default_endpoint(),
            "https://api.anthropic.com"
        );
        assert_eq!(LlmProvider::Ollama.api_key_env(), None);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.chat.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.anomaly_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.index.embedding_dimensions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ingest]\ndata_dir = \"/tmp/fred\"\nmax_retries = 1\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.ingest.data_dir, Some(PathBuf::from("/tmp/fred")));
        assert_eq!(config.ingest.max_retries, 1);
        assert_eq!(config.ingest.initial_backoff_ms, 500);
    }

    #[test]
    fn test_load_from_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chat]\ntop_k = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }
}
