//! Core orchestration logic.
//!
//! This module contains:
//! - Stage: The Leaf/Sequential/Parallel/Loop stage tree
//! - Callbacks: Before/after hooks that can short-circuit a turn
//! - Executor: Walks a stage tree against session state
//! - Escalation: The leaf that ends generation loops
//! - Safety: Safety limits and enforcement
//! - EventStore: Append-only turn log
//! - Orchestrator: Runs one user turn end to end

pub mod callbacks;
pub mod escalation;
pub mod event_store;
pub mod executor;
pub mod orchestrator;
pub mod safety;
pub mod stage;

// Re-export commonly used types
pub use callbacks::{
    Callback, Chain, FinalResponse, RejectOnInvalid, ResponseKind, SkipIfRejected, Verdict,
};
pub use escalation::EscalationChecker;
pub use event_store::{hash_code, submission_key, EventSink, MemorySink, NullSink, TurnLog};
pub use executor::{ExecutionResult, ExecutionStats, Executor};
pub use orchestrator::{Orchestrator, TurnOutcome, TurnStatus, GENERIC_ERROR_RESPONSE};
pub use safety::{SafetyLimits, SafetyViolation};
pub use stage::{FnLeaf, Leaf, LeafOutput, Stage, StageKind};
