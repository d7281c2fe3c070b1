//! Time-series analytics
//!
//! - [`stats`]: pure statistical primitives (regression, volatility, z-scores)
//! - [`engine`]: the memoizing [`AnalysisEngine`] that turns a stored series
//!   into persisted [`AnalysisReport`](crate::types::AnalysisReport)s

pub mod engine;
pub mod stats;

pub use engine::{AnalysisEngine, DEFAULT_ANOMALY_THRESHOLD};
