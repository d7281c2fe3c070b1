//! Retrieval-augmented chat
//!
//! - [`orchestrator`]: per-turn state machine and session bookkeeping
//! - [`context`]: budgeted context composition

pub mod context;
pub mod orchestrator;

pub use orchestrator::{RetrievalOrchestrator, TurnState};
