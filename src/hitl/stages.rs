//! The planning stage and the hooks that gate the main pipeline on approval.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::intent::{IntentClassifier, PlanEditor, Planner, UserIntent};
use super::{ApprovalMachine, PlanEvent, PLAN_NOTICE_KEY};
use crate::core::callbacks::{Callback, Chain, FinalResponse, ResponseKind};
use crate::core::event_store::{EventSink, NullSink};
use crate::core::stage::{Leaf, LeafOutput, Stage};
use crate::domain::state::{PLAN_KEY, USER_MESSAGE_KEY};
use crate::domain::{Event, EventType, Plan, PlanState, SessionState};

/// Leaf that routes one user turn through the approval machine
pub struct PlanningStage {
    planner: Arc<dyn Planner>,
    classifier: Arc<dyn IntentClassifier>,
    editor: Arc<dyn PlanEditor>,
    sink: Arc<dyn EventSink>,
}

impl PlanningStage {
    pub fn new(
        planner: Arc<dyn Planner>,
        classifier: Arc<dyn IntentClassifier>,
        editor: Arc<dyn PlanEditor>,
    ) -> Self {
        Self {
            planner,
            classifier,
            editor,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    async fn transition(&self, state: &mut SessionState, event: PlanEvent) -> Result<PlanState> {
        let from = state.plan_state();
        let to = ApprovalMachine::apply(state, event)?;

        let summary = format!("Plan {} -> {} on {}", from, to, event);
        let record = Event::new(state.session_id, state.turn, None, EventType::PlanTransition, summary);
        if let Err(e) = self.sink.record(record).await {
            warn!(error = %e, "Failed to record plan transition");
        }
        Ok(to)
    }

    /// Generate a fresh plan for `request` and present it
    async fn generate(&self, state: &mut SessionState, request: &str) -> Result<()> {
        let plan = self.planner.plan(request).await?;
        info!(title = %plan.title, entries = plan.len(), "Plan generated");
        state.set_as(PLAN_KEY, &plan)?;
        self.transition(state, PlanEvent::PlanGenerated).await?;
        Ok(())
    }

    async fn refine(&self, state: &mut SessionState, plan: Option<Plan>, feedback: &str) -> Result<()> {
        let Some(mut plan) = plan else {
            // Pending without a readable plan: regenerate from the feedback
            state.reset_plan();
            return self.generate(state, feedback).await;
        };

        // Either failure keeps the previous plan and says why the change was not made
        match self.editor.edits(&plan, feedback).await {
            Ok(edits) => match plan.apply_all(&edits) {
                Ok(()) => {
                    info!(edits = edits.len(), entries = plan.len(), "Plan refined");
                    state.set_as(PLAN_KEY, &plan)?;
                }
                Err(e) => {
                    warn!(error = %e, "Plan edit rejected");
                    state.set(PLAN_NOTICE_KEY, format!("I couldn't apply that change: {}.", e));
                }
            },
            Err(e) => {
                warn!(error = %e, "Plan editor failed");
                state.set(PLAN_NOTICE_KEY, format!("I couldn't apply that change: {:#}.", e));
            }
        }

        self.transition(state, PlanEvent::Refine).await?;
        Ok(())
    }
}

#[async_trait]
impl Leaf for PlanningStage {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        let message = state.get_str(USER_MESSAGE_KEY).unwrap_or_default().to_string();
        let plan: Option<Plan> = state.get_as(PLAN_KEY).unwrap_or_default();

        match state.plan_state() {
            PlanState::None => {
                self.generate(state, &message).await?;
            }
            PlanState::Pending => {
                match self.classifier.classify(&message, plan.as_ref()).await? {
                    UserIntent::Approve => {
                        self.transition(state, PlanEvent::Approve).await?;
                    }
                    UserIntent::Refine => {
                        self.refine(state, plan, &message).await?;
                    }
                    UserIntent::StartOver | UserIntent::NewRequest => {
                        self.transition(state, PlanEvent::StartOver).await?;
                    }
                }
            }
            PlanState::Approved => {
                let intent = self.classifier.classify(&message, plan.as_ref()).await?;
                if intent != UserIntent::Approve {
                    // A different request after approval starts a new plan
                    self.transition(state, PlanEvent::NewRequest).await?;
                    self.generate(state, &message).await?;
                }
            }
        }

        Ok(LeafOutput::message(format!("plan state: {}", state.plan_state())))
    }
}

/// After-hook on the planning stage: show the plan while it awaits approval
pub fn present_plan(state: &mut SessionState) -> Option<FinalResponse> {
    match state.plan_state() {
        PlanState::Approved => None,
        PlanState::Pending => {
            let body = match state.get_as::<Plan>(PLAN_KEY) {
                Ok(Some(plan)) => plan.render(),
                _ => "A plan is pending but could not be displayed. Please describe your request again."
                    .to_string(),
            };
            let text = match state.get_str(PLAN_NOTICE_KEY) {
                Some(notice) => format!("{}\n\n{}", notice, body),
                None => body,
            };
            Some(FinalResponse::new(ResponseKind::PlanPresented, text))
        }
        PlanState::None => Some(FinalResponse::info(
            "Okay, let's start over. What would you like me to work on?",
        )),
    }
}

/// Before-hook on the main pipeline: nothing runs unless the plan is approved
pub fn approval_gate(state: &mut SessionState) -> Option<FinalResponse> {
    let plan_state = state.plan_state();
    if plan_state == PlanState::Approved {
        return None;
    }
    Some(FinalResponse::new(
        ResponseKind::PendingApproval,
        format!(
            "The plan is not yet approved (current state: {}). Reply \"approve\" to run it \
             or describe the changes you want.",
            plan_state
        ),
    ))
}

/// Root stage: planning (presenting its plan) followed by the gated main pipeline.
///
/// An existing before-hook on `main` still runs, after the gate.
pub fn hitl_pipeline(planning: Stage, main: Stage) -> Stage {
    let planning = planning.with_after(present_plan);

    let gate: Arc<dyn Callback> = Arc::new(approval_gate);
    let mut main = main;
    main.before = Some(match main.before.take() {
        Some(existing) => Arc::new(Chain::new(vec![gate, existing])),
        None => gate,
    });

    Stage::sequential("hitl", vec![planning, main])
}
