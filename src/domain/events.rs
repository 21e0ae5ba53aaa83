//! Audit events emitted while a turn executes.
//!
//! Events are an append-only trail of what the engine did; they are never
//! replayed into session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in a session's turn log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The session this event belongs to
    pub session_id: Uuid,

    /// Turn number within the session
    pub turn: u64,

    /// Stage name (if applicable)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO payloads)
    pub summary: String,

    /// Time taken in milliseconds (for finished stages and turns)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        session_id: Uuid,
        turn: u64,
        stage: Option<String>,
        event_type: EventType,
        summary: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id,
            turn,
            stage,
            event_type,
            summary,
            duration_ms: None,
            error: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A turn entered the stage tree
    TurnStarted,

    /// The whole tree ran to completion
    TurnCompleted,

    /// A callback short-circuited the turn
    TurnTerminated,

    /// An engine-internal error aborted the turn
    TurnFailed,

    StageStarted,
    StageCompleted,

    /// A stage's hook (or a descendant) returned a final response
    StageTerminated,

    /// One repetition of a loop body finished
    LoopIteration,

    /// A loop stopped early on an escalate signal
    LoopEscalated,

    /// A loop ran to its iteration cap
    LoopExhausted,

    /// Code was submitted to the sandbox
    CodeSubmitted,

    /// An artifact was extracted and persisted
    ArtifactSaved,

    /// An artifact could not be produced
    ArtifactFailed,

    /// The plan approval state changed
    PlanTransition,
}
