//! # fredrag-core
//!
//! Core library for fredrag - economic time-series analysis with
//! retrieval-augmented chat.
//!
//! This library provides:
//! - [`SeriesStore`]: the current version of every ingested series
//! - [`AnalysisEngine`]: memoized trend, volatility, anomaly and summary reports
//! - [`VectorIndex`]: cosine k-nearest-neighbour search over series embeddings
//! - [`RetrievalOrchestrator`]: chat turns grounded in retrieved series
//! - Persistence behind the [`Repository`] trait (SQLite or in-memory)
//! - Configuration and logging infrastructure
//!
//! ## Architecture
//!
//! Data flows leaves-first:
//! - **Ingest:** provider observations → `SeriesStore` → description → embedding → `VectorIndex`
//! - **Analyze:** `SeriesStore` → `AnalysisEngine` (cached per fetched version) → `AnalysisReport`
//! - **Chat:** query → embedding → `VectorIndex::search` → summary reports → generation → `ChatTurn`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fredrag_core::{Config, Database, Services};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let services = Services::with_defaults(config, Arc::new(db)).expect("invalid config");
//! services.restore().expect("failed to restore state");
//! ```

// Re-export commonly used items at the crate root
pub use analytics::AnalysisEngine;
pub use cancel::CancellationToken;
pub use chat::{RetrievalOrchestrator, TurnState};
pub use config::Config;
pub use db::{Database, MemoryRepository, Repository};
pub use error::{Error, ErrorKind, Result};
pub use index::VectorIndex;
pub use ingest::{IngestCoordinator, IngestOutcome, IngestSummary};
pub use services::{RestoreStats, Services};
pub use store::SeriesStore;
pub use types::*;

// Public modules
pub mod analytics;
pub mod cancel;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod providers;
pub mod services;
pub mod store;
pub mod types;
