//! stagegraph - Stage-graph orchestrator for AI report pipelines
//!
//! Composes independent processing stages (fetchers, code-generated charts,
//! plan approval, report assembly) into one controlled execution tree.
//!
//! # Architecture
//!
//! - A turn runs a tree of `Leaf`, `Sequential`, `Parallel` and `Loop` stages
//!   against one explicit `SessionState`
//! - Before/after hooks can short-circuit the rest of the turn
//! - Loops end on an escalation signal or their iteration cap, never hang
//! - Generated code reaches the sandbox exactly once per artifact
//! - The main pipeline is gated on a user-approved plan
//!
//! # Modules
//!
//! - `domain`: Data structures (SessionState, Artifact, Plan, Event)
//! - `core`: Stage tree, executor, callbacks, safety, turn log, orchestrator
//! - `sandbox`: Code extraction and the exactly-once execution hook
//! - `hitl`: Plan approval state machine, planning stage and gate
//! - `adapters`: Collaborator traits and local implementations
//! - `report`: Template assembly with embedded artifacts
//! - `pipelines`: Chart loop and rejection-guard builders
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a generated chart script once and persist its output
//! stagegraph exec chart.py --filename chart_1.png
//!
//! # Inspect a session's turn log
//! stagegraph log <session-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod hitl;
pub mod pipelines;
pub mod report;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use crate::core::{
    Callback, ExecutionResult, Executor, FinalResponse, Orchestrator, SafetyLimits, Stage,
    TurnOutcome, TurnStatus,
};
pub use crate::domain::{Artifact, ArtifactStatus, Event, EventType, Plan, PlanState, SessionState};
pub use crate::hitl::{hitl_pipeline, ApprovalMachine, PlanningStage};
pub use crate::sandbox::{CodeExecutionPipeline, SandboxError};
