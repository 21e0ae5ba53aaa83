//! Turn orchestration.
//!
//! Runs one inbound user turn through a stage tree, records turn events,
//! and maps the executor's result onto what the user sees. Engine-internal
//! errors become a generic error response instead of escaping the turn.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::callbacks::ResponseKind;
use super::event_store::{EventSink, NullSink};
use super::executor::{ExecutionResult, ExecutionStats, Executor};
use super::safety::SafetyLimits;
use super::stage::Stage;
use crate::domain::state::USER_MESSAGE_KEY;
use crate::domain::{Event, EventType, SessionState};

/// Response shown when the turn fails for an unexpected reason
pub const GENERIC_ERROR_RESPONSE: &str = "Something went wrong while processing your request.";

/// Default key read for the final response of a completed turn
pub const DEFAULT_FINAL_RESPONSE_KEY: &str = "final_report";

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TurnStatus {
    /// Every stage ran
    Completed,

    /// A callback short-circuited the turn
    Terminated { kind: ResponseKind },

    /// An engine-internal error aborted the turn
    Failed { error: String },
}

/// Result of one turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Turn number within the session
    pub turn: u64,

    pub status: TurnStatus,

    /// Text for the user
    pub response: String,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, TurnStatus::Completed)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.status, TurnStatus::Terminated { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TurnStatus::Failed { .. })
    }
}

/// Main turn orchestrator
pub struct Orchestrator {
    executor: Executor,
    sink: Arc<dyn EventSink>,
    final_response_key: String,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(SafetyLimits::default())
    }
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            executor: Executor::new(limits),
            sink: Arc::new(NullSink),
            final_response_key: DEFAULT_FINAL_RESPONSE_KEY.to_string(),
        }
    }

    /// Record turn and stage events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        let limits = self.executor.limits().clone();
        self.executor = Executor::new(limits).with_sink(Arc::clone(&sink));
        self.sink = sink;
        self
    }

    /// State key whose value is returned when the turn completes
    pub fn with_final_response_key(mut self, key: impl Into<String>) -> Self {
        self.final_response_key = key.into();
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Counters from the most recent turn
    pub fn stats(&self) -> ExecutionStats {
        self.executor.stats()
    }

    /// Run one user turn through `root`
    #[instrument(skip(self, root, state, message), fields(root = %root.name, session_id = %state.session_id))]
    pub async fn run_turn(
        &self,
        root: &Stage,
        state: &mut SessionState,
        message: &str,
    ) -> Result<TurnOutcome> {
        let turn = state.begin_turn();
        state.set(USER_MESSAGE_KEY, message);
        self.executor.reset_stats();
        info!(turn, "Starting turn");

        let started = Instant::now();
        self.record(
            Event::new(
                state.session_id,
                turn,
                None,
                EventType::TurnStarted,
                format!("Turn {} started at stage '{}'", turn, root.name),
            ),
        )
        .await;

        let result = self.executor.execute(root, state).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(ExecutionResult::Continue { .. }) => {
                info!(turn, duration_ms, "Turn completed");
                self.record(
                    Event::new(
                        state.session_id,
                        turn,
                        None,
                        EventType::TurnCompleted,
                        format!("Turn {} completed", turn),
                    )
                    .with_duration(duration_ms),
                )
                .await;

                let response = state
                    .get_str(&self.final_response_key)
                    .unwrap_or_default()
                    .to_string();

                TurnOutcome {
                    turn,
                    status: TurnStatus::Completed,
                    response,
                }
            }
            Ok(ExecutionResult::Terminated(response)) => {
                info!(turn, kind = ?response.kind, "Turn short-circuited");
                self.record(
                    Event::new(
                        state.session_id,
                        turn,
                        None,
                        EventType::TurnTerminated,
                        format!("Turn {} terminated ({:?})", turn, response.kind),
                    )
                    .with_duration(duration_ms),
                )
                .await;

                TurnOutcome {
                    turn,
                    status: TurnStatus::Terminated {
                        kind: response.kind,
                    },
                    response: response.text,
                }
            }
            Err(e) => {
                let error_msg = format!("{:#}", e);
                error!(turn, %error_msg, "Turn failed");
                self.record(
                    Event::new(
                        state.session_id,
                        turn,
                        None,
                        EventType::TurnFailed,
                        format!("Turn {} failed", turn),
                    )
                    .with_duration(duration_ms)
                    .with_error(error_msg.clone()),
                )
                .await;

                TurnOutcome {
                    turn,
                    status: TurnStatus::Failed { error: error_msg },
                    response: GENERIC_ERROR_RESPONSE.to_string(),
                }
            }
        };

        Ok(outcome)
    }

    async fn record(&self, event: Event) {
        if let Err(e) = self.sink.record(event).await {
            warn!(error = %e, "Failed to record turn event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::callbacks::FinalResponse;
    use crate::core::event_store::MemorySink;
    use crate::core::stage::LeafOutput;

    #[tokio::test]
    async fn test_completed_turn_returns_final_report() {
        let orchestrator = Orchestrator::default();
        let mut state = SessionState::new();
        let root = Stage::from_fn("report", |state| {
            let message = state.get_str(USER_MESSAGE_KEY).unwrap_or_default().to_string();
            state.set(DEFAULT_FINAL_RESPONSE_KEY, format!("Report on {}", message));
            Ok(LeafOutput::done())
        });

        let outcome = orchestrator
            .run_turn(&root, &mut state, "Q3 revenue")
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.turn, 1);
        assert_eq!(outcome.response, "Report on Q3 revenue");
    }

    #[tokio::test]
    async fn test_engine_error_becomes_generic_response() {
        let orchestrator = Orchestrator::default();
        let mut state = SessionState::new();
        let root = Stage::from_fn("broken", |_| anyhow::bail!("interface violation"));

        let outcome = orchestrator.run_turn(&root, &mut state, "hi").await.unwrap();
        assert!(outcome.is_failed());
        assert_eq!(outcome.response, GENERIC_ERROR_RESPONSE);
    }

    #[tokio::test]
    async fn test_turn_events_recorded() {
        let sink = Arc::new(MemorySink::new());
        let orchestrator = Orchestrator::default().with_sink(sink.clone());
        let mut state = SessionState::new();
        let root = Stage::from_fn("noop", |_| Ok(LeafOutput::done())).with_before(
            |_: &mut SessionState| -> Option<FinalResponse> { Some(FinalResponse::info("stop")) },
        );

        let outcome = orchestrator.run_turn(&root, &mut state, "hi").await.unwrap();
        assert!(outcome.is_terminated());
        assert_eq!(sink.count(EventType::TurnStarted), 1);
        assert_eq!(sink.count(EventType::StageTerminated), 1);
        assert_eq!(sink.count(EventType::TurnTerminated), 1);
        assert_eq!(sink.count(EventType::TurnCompleted), 0);
    }
}
