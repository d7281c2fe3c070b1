//! Error types for fredrag-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an [`Error`].
///
/// Kinds are stable and serializable so they can be recorded alongside
/// persisted chat turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidSeries,
    InsufficientData,
    DimensionMismatch,
    InvalidVector,
    EmptyIndex,
    EmbeddingUnavailable,
    GenerationUnavailable,
    Timeout,
    Provider,
    Cancelled,
    Storage,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidSeries => "invalid_series",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::DimensionMismatch => "dimension_mismatch",
            ErrorKind::InvalidVector => "invalid_vector",
            ErrorKind::EmptyIndex => "empty_index",
            ErrorKind::EmbeddingUnavailable => "embedding_unavailable",
            ErrorKind::GenerationUnavailable => "generation_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Provider => "provider",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(ErrorKind::NotFound),
            "invalid_series" => Ok(ErrorKind::InvalidSeries),
            "insufficient_data" => Ok(ErrorKind::InsufficientData),
            "dimension_mismatch" => Ok(ErrorKind::DimensionMismatch),
            "invalid_vector" => Ok(ErrorKind::InvalidVector),
            "empty_index" => Ok(ErrorKind::EmptyIndex),
            "embedding_unavailable" => Ok(ErrorKind::EmbeddingUnavailable),
            "generation_unavailable" => Ok(ErrorKind::GenerationUnavailable),
            "timeout" => Ok(ErrorKind::Timeout),
            "provider" => Ok(ErrorKind::Provider),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "storage" => Ok(ErrorKind::Storage),
            "config" => Ok(ErrorKind::Config),
            _ => Err(format!("unknown error kind: {}", s)),
        }
    }
}

/// Main error type for the fredrag-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage constraint violated outside of SQLite
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Entity lookup failed
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Observations rejected on ingest
    #[error("invalid series {series_id}: {reason}")]
    InvalidSeries { series_id: String, reason: String },

    /// Too few observations for the requested analysis
    #[error("insufficient data for {series_id}: need {required} observations, have {actual}")]
    InsufficientData {
        series_id: String,
        required: usize,
        actual: usize,
    },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector contains no components or non-finite components
    #[error("invalid vector for {series_id}: {reason}")]
    InvalidVector { series_id: String, reason: String },

    #[error("vector index is empty")]
    EmptyIndex,

    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("generation provider unavailable: {0}")]
    GenerationUnavailable(String),

    /// External call exceeded its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Raw failure reported by an external provider
    #[error("provider error: {0}")]
    Provider(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Database(_) | Error::Io(_) | Error::Json(_) | Error::Storage(_) => {
                ErrorKind::Storage
            }
            Error::Config(_) => ErrorKind::Config,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidSeries { .. } => ErrorKind::InvalidSeries,
            Error::InsufficientData { .. } => ErrorKind::InsufficientData,
            Error::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Error::InvalidVector { .. } => ErrorKind::InvalidVector,
            Error::EmptyIndex => ErrorKind::EmptyIndex,
            Error::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            Error::GenerationUnavailable(_) => ErrorKind::GenerationUnavailable,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Provider(_) => ErrorKind::Provider,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Provider(_))
    }
}

/// Result type alias for fredrag-core
pub type Result<T> = std::result::Result<T, Error>;
