//! Domain types for the stagegraph orchestrator.
//!
//! This module contains the core data structures:
//! - SessionState: The turn-scoped key/value store shared by stages
//! - Artifact: Binary outputs of sandboxed code execution
//! - Plan: HITL plans and their approval state
//! - Events: Audit records of what a turn did

pub mod artifact;
pub mod events;
pub mod plan;
pub mod state;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactStatus};
pub use events::{Event, EventType};
pub use plan::{Plan, PlanEdit, PlanEntry, PlanError, PlanState};
pub use state::{SessionState, StateFork};
