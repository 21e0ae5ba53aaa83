//! Human-in-the-loop plan approval.
//!
//! The main pipeline only runs once the user has approved a plan:
//!
//! ```text
//! None --plan generated--> Pending --approve--> Approved
//!                          Pending --refine---> Pending (plan edited)
//!                          Pending --start over--> None (plan cleared)
//! Approved --new request--> None
//! ```
//!
//! Plan state and the plan live in session state between turns, which is the
//! only way a pipeline suspends across turns.

pub mod intent;
pub mod stages;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::domain::{PlanError, PlanState, SessionState};

pub use intent::{
    IntentClassifier, KeywordClassifier, ModelIntentClassifier, ModelPlanEditor, ModelPlanner,
    PlanEditor, Planner, UserIntent,
};
pub use stages::{approval_gate, hitl_pipeline, present_plan, PlanningStage};

/// Turn-scoped list of `{from, event, to}` records
pub const PLAN_TRANSITIONS_KEY: &str = "temp:plan_transitions";

/// Turn-scoped note shown above a re-presented plan
pub const PLAN_NOTICE_KEY: &str = "temp:plan_notice";

/// Something that moves the plan state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEvent {
    PlanGenerated,
    Approve,
    Refine,
    StartOver,
    NewRequest,
}

impl PlanEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanGenerated => "plan_generated",
            Self::Approve => "approve",
            Self::Refine => "refine",
            Self::StartOver => "start_over",
            Self::NewRequest => "new_request",
        }
    }
}

impl fmt::Display for PlanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The approval transition table
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalMachine;

impl ApprovalMachine {
    /// Next state for `event` in state `from`, or `InvalidTransition`
    pub fn transition(from: PlanState, event: PlanEvent) -> Result<PlanState, PlanError> {
        use PlanEvent::*;
        use PlanState::{Approved, None as NoPlan, Pending};

        match (from, event) {
            (NoPlan, PlanGenerated) => Ok(Pending),
            (Pending, Approve) => Ok(Approved),
            (Pending, Refine) => Ok(Pending),
            (Pending, StartOver) => Ok(NoPlan),
            (Approved, NewRequest) => Ok(NoPlan),
            (from, event) => Err(PlanError::InvalidTransition {
                from,
                event: event.to_string(),
            }),
        }
    }

    /// Validate and apply a transition to `state`, recording it for the turn
    pub fn apply(state: &mut SessionState, event: PlanEvent) -> Result<PlanState, PlanError> {
        let from = state.plan_state();
        let to = Self::transition(from, event)?;

        if to == PlanState::None {
            state.reset_plan();
        } else {
            state.set_plan_state(to);
        }

        info!(%from, %event, %to, "Plan transition");
        state.push(
            PLAN_TRANSITIONS_KEY,
            json!({ "from": from.as_str(), "event": event.as_str(), "to": to.as_str() }),
        );
        Ok(to)
    }
}
