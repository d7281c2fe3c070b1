//! Core domain types for fredrag
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Series** | An economic time series (e.g. `FEDFUNDS`) as a sorted list of observations |
//! | **Observation** | A single `(timestamp, value)` point of a series |
//! | **Report** | The output of one analysis kind over one fetched version of a series |
//! | **Vector entry** | The embedding of a series description, keyed by series id |
//! | **Session** | An append-only conversation with the chat agent |
//! | **Turn** | One user input, the context retrieved for it, and the response |
//!
//! Reports are immutable: re-analysis after a re-ingest creates a new report and
//! the previous one becomes history.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Series
// ============================================

/// A single point of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Observation {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// An ingested time series.
///
/// Observations are sorted by strictly increasing timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Series identifier (e.g. "UNRATE")
    pub id: String,
    pub observations: Vec<Observation>,
    /// When this version of the series was ingested
    pub fetched_at: DateTime<Utc>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observation values in timestamp order
    pub fn values(&self) -> Vec<f64> {
        self.observations.iter().map(|o| o.value).collect()
    }

    pub fn first(&self) -> Option<&Observation> {
        self.observations.first()
    }

    pub fn latest(&self) -> Option<&Observation> {
        self.observations.last()
    }
}

// ============================================
// Analysis reports
// ============================================

/// Kind of analysis a report holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Trend,
    Volatility,
    Anomaly,
    Summary,
}

impl ReportKind {
    pub const ALL: [ReportKind; 4] = [
        ReportKind::Trend,
        ReportKind::Volatility,
        ReportKind::Anomaly,
        ReportKind::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Trend => "trend",
            ReportKind::Volatility => "volatility",
            ReportKind::Anomaly => "anomaly",
            ReportKind::Summary => "summary",
        }
    }

    /// Fewest observations this kind can be computed from.
    ///
    /// Regression needs two points; summary includes the regression.
    pub fn min_observations(&self) -> usize {
        match self {
            ReportKind::Trend | ReportKind::Summary => 2,
            ReportKind::Volatility | ReportKind::Anomaly => 1,
        }
    }
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trend" => Ok(ReportKind::Trend),
            "volatility" => Ok(ReportKind::Volatility),
            "anomaly" => Ok(ReportKind::Anomaly),
            "summary" => Ok(ReportKind::Summary),
            _ => Err(format!("unknown report kind: {}", s)),
        }
    }
}

/// Straight line `y = slope * x + intercept` fitted by least squares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl std::fmt::Display for LinearFit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "y = {:.4}x {}", self.slope, signed(self.intercept))
    }
}

/// Polynomial fitted by least squares; `coefficients[i]` multiplies `x^i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialFit {
    pub order: usize,
    pub coefficients: Vec<f64>,
    pub r_squared: f64,
}

impl std::fmt::Display for PolynomialFit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("y =")?;
        for (power, c) in self.coefficients.iter().enumerate().rev() {
            let sign = if c.is_sign_negative() { '-' } else { '+' };
            let magnitude = c.abs();
            match (power, power == self.order) {
                (0, _) => write!(f, " {} {:.4e}", sign, magnitude)?,
                (1, true) => write!(f, " {:.4e}x", c)?,
                (1, false) => write!(f, " {} {:.4e}x", sign, magnitude)?,
                (p, true) => write!(f, " {:.4e}x^{}", c, p)?,
                (p, false) => write!(f, " {} {:.4e}x^{}", sign, magnitude, p)?,
            }
        }
        Ok(())
    }
}

/// Curve `y = a + b * ln(x + 1)` fitted by least squares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogarithmicFit {
    pub a: f64,
    pub b: f64,
    pub r_squared: f64,
}

impl std::fmt::Display for LogarithmicFit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "y = {:.4} {} ln(x + 1)", self.a, signed(self.b))
    }
}

fn signed(value: f64) -> String {
    if value.is_sign_negative() {
        format!("- {:.4}", value.abs())
    } else {
        format!("+ {:.4}", value)
    }
}

/// Trend fits of value against zero-based observation index `x`.
///
/// `slope`, `intercept` and `r_squared` describe the linear fit. R² is 0 when
/// the series is constant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination; 0 when the series is constant
    pub r_squared: f64,
    /// Fits of order 2 and up, for orders the series has enough points for
    #[serde(default)]
    pub polynomial: Vec<PolynomialFit>,
    #[serde(default)]
    pub logarithmic: Option<LogarithmicFit>,
    /// Linear fit of the period-over-period percent changes against their index
    #[serde(default)]
    pub percent_change: Option<LinearFit>,
}

impl TrendResult {
    pub fn linear(&self) -> LinearFit {
        LinearFit {
            slope: self.slope,
            intercept: self.intercept,
            r_squared: self.r_squared,
        }
    }

    /// Polynomial fit with the highest R², lowest order on ties
    pub fn best_polynomial(&self) -> Option<&PolynomialFit> {
        self.polynomial.iter().fold(None, |best, fit| match best {
            Some(b) if b.r_squared >= fit.r_squared => Some(b),
            _ => Some(fit),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityResult {
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Mean period-over-period percent change, if any period had a non-zero base
    pub mean_pct_change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub threshold: f64,
    /// z-score of every observation, in observation order
    pub z_scores: Vec<f64>,
    /// Positions of observations with |z| > threshold
    pub flagged: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub text: String,
    pub trend: TrendResult,
    pub volatility: VolatilityResult,
    pub anomaly_count: usize,
}

/// Structured result of an analysis, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportPayload {
    Trend(TrendResult),
    Volatility(VolatilityResult),
    Anomaly(AnomalyResult),
    Summary(SummaryResult),
}

impl ReportPayload {
    pub fn kind(&self) -> ReportKind {
        match self {
            ReportPayload::Trend(_) => ReportKind::Trend,
            ReportPayload::Volatility(_) => ReportKind::Volatility,
            ReportPayload::Anomaly(_) => ReportKind::Anomaly,
            ReportPayload::Summary(_) => ReportKind::Summary,
        }
    }
}

/// An immutable analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Unique report id (UUID)
    pub id: String,
    pub series_id: String,
    pub kind: ReportKind,
    pub payload: ReportPayload,
    /// `fetched_at` of the series version this report was computed from
    pub series_fetched_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisReport {
    /// Summary text, if this is a summary report
    pub fn summary_text(&self) -> Option<&str> {
        match &self.payload {
            ReportPayload::Summary(s) => Some(&s.text),
            _ => None,
        }
    }
}

// ============================================
// Vector entries
// ============================================

/// Embedding of a series, keyed by series id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub series_id: String,
    pub embedding: Vec<f32>,
    pub upserted_at: DateTime<Utc>,
}

/// A search result: an entry and its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: std::sync::Arc<VectorEntry>,
    pub similarity: f32,
}

// ============================================
// Chat
// ============================================

/// A series that was placed in the context of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub series_id: String,
    /// Summary report used, when one could be produced
    pub report_id: Option<String>,
    pub similarity: f32,
}

/// One exchange within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user_input: String,
    /// Series used as context, highest similarity first
    pub context: Vec<ContextRef>,
    /// Generated response, or the fallback response on failure
    pub response: String,
    /// Kind of the error that moved the turn to `Failed`, if any
    pub failure: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn context_series_ids(&self) -> Vec<&str> {
        self.context.iter().map(|c| c.series_id.as_str()).collect()
    }

    pub fn is_fallback(&self) -> bool {
        self.failure.is_some()
    }
}

/// An append-only conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub turns: Vec<ChatTurn>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
        }
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.turns.last().map(|t| t.timestamp)
    }
}
