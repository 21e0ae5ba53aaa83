//! Stage executor.
//!
//! Walks a stage tree against a session state:
//! - `Sequential` runs children in order and stops at the first termination
//! - `Parallel` runs children concurrently on forked state, always joins
//!   all of them, then merges their writes back in declaration order
//! - `Loop` repeats its children until a repetition ends with an escalate
//!   signal or the iteration bound is reached

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::{debug, error, info, warn};

use super::callbacks::FinalResponse;
use super::event_store::{EventSink, NullSink};
use super::safety::SafetyLimits;
use super::stage::{Leaf, Stage, StageKind};
use crate::domain::{Event, EventType, SessionState, StateFork};

/// Outcome of executing one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Keep going; `escalate` asks an enclosing loop to stop iterating
    Continue { escalate: bool },

    /// A hook ended the turn with this response
    Terminated(FinalResponse),
}

impl ExecutionResult {
    pub fn proceed() -> Self {
        Self::Continue { escalate: false }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }

    pub fn escalated(&self) -> bool {
        matches!(self, Self::Continue { escalate: true })
    }

    pub fn response(&self) -> Option<&FinalResponse> {
        match self {
            Self::Terminated(response) => Some(response),
            Self::Continue { .. } => None,
        }
    }
}

/// Per-stage execution counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Stage name -> number of times its body or hooks were entered
    pub executions: BTreeMap<String, u32>,

    /// Loop name -> completed repetitions (last run)
    pub iterations: BTreeMap<String, u32>,
}

impl ExecutionStats {
    pub fn executions(&self, stage: &str) -> u32 {
        self.executions.get(stage).copied().unwrap_or(0)
    }

    pub fn iterations(&self, stage: &str) -> u32 {
        self.iterations.get(stage).copied().unwrap_or(0)
    }
}

/// Executes stage trees
pub struct Executor {
    limits: SafetyLimits,
    sink: Arc<dyn EventSink>,
    stats: Mutex<ExecutionStats>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(SafetyLimits::default())
    }
}

impl Executor {
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            sink: Arc::new(NullSink),
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Snapshot of the counters collected so far
    pub fn stats(&self) -> ExecutionStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = ExecutionStats::default();
        }
    }

    /// Execute `stage` (and its subtree) against `state`
    pub fn execute<'a>(
        &'a self,
        stage: &'a Stage,
        state: &'a mut SessionState,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        async move {
            let started = Instant::now();
            self.count_execution(&stage.name);
            debug!(stage = %stage.name, kind = stage.kind.label(), "Entering stage");
            self.emit(
                state,
                &stage.name,
                EventType::StageStarted,
                format!("Stage '{}' ({}) started", stage.name, stage.kind.label()),
            )
            .await;

            if let Some(hook) = &stage.before {
                let response = hook
                    .call(state)
                    .await
                    .with_context(|| format!("Before hook of stage '{}' failed", stage.name))?;
                if let Some(response) = response {
                    info!(stage = %stage.name, kind = ?response.kind, "Before hook ended the turn");
                    return Ok(self.terminated(state, stage, response, started).await);
                }
            }

            let result = match &stage.kind {
                StageKind::Leaf(leaf) => self.run_leaf(stage, leaf.as_ref(), state).await?,
                StageKind::Sequential(children) => self.run_sequential(children, state).await?,
                StageKind::Parallel(children) => self.run_parallel(stage, children, state).await?,
                StageKind::Loop {
                    children,
                    max_iterations,
                } => {
                    self.run_loop(stage, children, *max_iterations, state)
                        .await?
                }
            };

            if let ExecutionResult::Terminated(response) = result {
                return Ok(self.terminated(state, stage, response, started).await);
            }

            if let Some(hook) = &stage.after {
                let response = hook
                    .call(state)
                    .await
                    .with_context(|| format!("After hook of stage '{}' failed", stage.name))?;
                if let Some(response) = response {
                    info!(stage = %stage.name, kind = ?response.kind, "After hook ended the turn");
                    return Ok(self.terminated(state, stage, response, started).await);
                }
            }

            let duration_ms = started.elapsed().as_millis() as u64;
            self.emit_event(
                Event::new(
                    state.session_id,
                    state.turn,
                    Some(stage.name.clone()),
                    EventType::StageCompleted,
                    format!("Stage '{}' completed in {}ms", stage.name, duration_ms),
                )
                .with_duration(duration_ms),
            )
            .await;

            Ok(result)
        }
        .boxed()
    }

    async fn run_leaf(
        &self,
        stage: &Stage,
        leaf: &dyn Leaf,
        state: &mut SessionState,
    ) -> Result<ExecutionResult> {
        let output = leaf
            .run(state)
            .await
            .with_context(|| format!("Stage '{}' failed", stage.name))?;

        if let Some(message) = &output.message {
            debug!(stage = %stage.name, escalate = output.escalate, %message, "Leaf finished");
        }

        Ok(ExecutionResult::Continue {
            escalate: output.escalate,
        })
    }

    /// Children in order; the result carries the last child's escalate flag
    async fn run_sequential(
        &self,
        children: &[Stage],
        state: &mut SessionState,
    ) -> Result<ExecutionResult> {
        let mut escalate = false;

        for child in children {
            match self.execute(child, state).await? {
                ExecutionResult::Continue { escalate: child_escalate } => {
                    escalate = child_escalate;
                }
                terminated => return Ok(terminated),
            }
        }

        Ok(ExecutionResult::Continue { escalate })
    }

    async fn run_parallel(
        &self,
        stage: &Stage,
        children: &[Stage],
        state: &mut SessionState,
    ) -> Result<ExecutionResult> {
        if children.is_empty() {
            return Ok(ExecutionResult::proceed());
        }

        let mut forks: Vec<StateFork> = children.iter().map(|_| state.fork()).collect();

        let branches = children
            .iter()
            .zip(forks.iter_mut())
            .map(|(child, fork)| async move {
                let before = fork.snapshot();
                let result = self.execute(child, fork.state_mut()).await;
                fork.settle(&before);
                result
            });

        // Join every branch; a failing or terminating child never cancels its siblings.
        let results = join_all(branches).await;

        let mut claimed = BTreeSet::new();
        for (child, fork) in children.iter().zip(forks) {
            let keys = state.merge(fork, &mut claimed);
            debug!(stage = %stage.name, child = %child.name, ?keys, "Merged parallel branch");
        }

        let mut escalate = false;
        let mut terminated = None;
        let mut first_error = None;

        for (child, result) in children.iter().zip(results) {
            match result {
                Ok(ExecutionResult::Continue { escalate: child_escalate }) => {
                    escalate |= child_escalate;
                }
                Ok(ExecutionResult::Terminated(response)) => {
                    if terminated.is_none() {
                        terminated = Some(response);
                    }
                }
                Err(e) => {
                    error!(stage = %stage.name, child = %child.name, error = %e, "Parallel branch failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if let Some(response) = terminated {
            return Ok(ExecutionResult::Terminated(response));
        }

        Ok(ExecutionResult::Continue { escalate })
    }

    async fn run_loop(
        &self,
        stage: &Stage,
        children: &[Stage],
        max_iterations: u32,
        state: &mut SessionState,
    ) -> Result<ExecutionResult> {
        let bound = match self.limits.loop_bound(max_iterations) {
            Ok(bound) => bound,
            Err(violation) => {
                warn!(stage = %stage.name, %violation, "Clamping loop iterations");
                self.limits.max_loop_iterations
            }
        };

        for iteration in 1..=bound {
            let result = self.run_sequential(children, state).await?;
            self.record_iteration(&stage.name, iteration);

            let escalate = match result {
                ExecutionResult::Terminated(response) => {
                    return Ok(ExecutionResult::Terminated(response));
                }
                ExecutionResult::Continue { escalate } => escalate,
            };

            self.emit(
                state,
                &stage.name,
                EventType::LoopIteration,
                format!("Loop '{}' iteration {}/{}", stage.name, iteration, bound),
            )
            .await;

            if escalate {
                info!(stage = %stage.name, iteration, "Loop escalated");
                self.emit(
                    state,
                    &stage.name,
                    EventType::LoopEscalated,
                    format!("Loop '{}' escalated after {} iterations", stage.name, iteration),
                )
                .await;
                return Ok(ExecutionResult::proceed());
            }
        }

        if bound > 0 {
            warn!(stage = %stage.name, bound, "Loop reached its iteration cap without escalating");
        }
        self.emit(
            state,
            &stage.name,
            EventType::LoopExhausted,
            format!("Loop '{}' stopped at its cap of {} iterations", stage.name, bound),
        )
        .await;

        // Escalation only ends iteration; it never propagates past the loop.
        Ok(ExecutionResult::proceed())
    }

    async fn terminated(
        &self,
        state: &SessionState,
        stage: &Stage,
        response: FinalResponse,
        started: Instant,
    ) -> ExecutionResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit_event(
            Event::new(
                state.session_id,
                state.turn,
                Some(stage.name.clone()),
                EventType::StageTerminated,
                format!("Stage '{}' terminated the turn ({:?})", stage.name, response.kind),
            )
            .with_duration(duration_ms),
        )
        .await;
        ExecutionResult::Terminated(response)
    }

    async fn emit(&self, state: &SessionState, stage: &str, event_type: EventType, summary: String) {
        self.emit_event(Event::new(
            state.session_id,
            state.turn,
            Some(stage.to_string()),
            event_type,
            summary,
        ))
        .await;
    }

    async fn emit_event(&self, event: Event) {
        if let Err(e) = self.sink.record(event).await {
            warn!(error = %e, "Failed to record turn event");
        }
    }

    fn count_execution(&self, stage: &str) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats.executions.entry(stage.to_string()).or_insert(0) += 1;
        }
    }

    fn record_iteration(&self, stage: &str, iteration: u32) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.iterations.insert(stage.to_string(), iteration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::LeafOutput;

    fn counter(name: &str, key: &'static str) -> Stage {
        Stage::from_fn(name, move |state| {
            let n = state.get_u64(key).unwrap_or(0);
            state.set(key, n + 1);
            Ok(LeafOutput::done())
        })
    }

    #[tokio::test]
    async fn test_empty_composites_are_noops() {
        let executor = Executor::default();
        let mut state = SessionState::new();

        for stage in [
            Stage::sequential("seq", vec![]),
            Stage::parallel("par", vec![]),
        ] {
            let result = executor.execute(&stage, &mut state).await.unwrap();
            assert_eq!(result, ExecutionResult::proceed());
        }
    }

    #[tokio::test]
    async fn test_loop_without_escalation_runs_to_cap() {
        let executor = Executor::default();
        let mut state = SessionState::new();
        let stage = Stage::looped("loop", vec![counter("tick", "ticks")], 4);

        let result = executor.execute(&stage, &mut state).await.unwrap();
        assert_eq!(result, ExecutionResult::proceed());
        assert_eq!(state.get_u64("ticks"), Some(4));
        assert_eq!(executor.stats().iterations("loop"), 4);
    }

    #[tokio::test]
    async fn test_loop_bound_is_clamped() {
        let executor = Executor::new(SafetyLimits {
            max_loop_iterations: 3,
            ..Default::default()
        });
        let mut state = SessionState::new();
        let stage = Stage::looped("loop", vec![counter("tick", "ticks")], 1_000);

        executor.execute(&stage, &mut state).await.unwrap();
        assert_eq!(state.get_u64("ticks"), Some(3));
    }

    #[tokio::test]
    async fn test_zero_iteration_loop() {
        let executor = Executor::default();
        let mut state = SessionState::new();
        let stage = Stage::looped("loop", vec![counter("tick", "ticks")], 0);

        executor.execute(&stage, &mut state).await.unwrap();
        assert!(!state.contains("ticks"));
    }

    #[tokio::test]
    async fn test_sequential_carries_last_escalate() {
        let executor = Executor::default();
        let mut state = SessionState::new();
        let stage = Stage::sequential(
            "seq",
            vec![
                Stage::from_fn("first", |_| Ok(LeafOutput::escalate("early"))),
                Stage::from_fn("last", |_| Ok(LeafOutput::done())),
            ],
        );

        let result = executor.execute(&stage, &mut state).await.unwrap();
        assert!(!result.escalated());
    }

    #[tokio::test]
    async fn test_leaf_error_propagates_with_context() {
        let executor = Executor::default();
        let mut state = SessionState::new();
        let stage = Stage::from_fn("broken", |_| anyhow::bail!("collaborator contract violated"));

        let err = executor.execute(&stage, &mut state).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Stage 'broken' failed"));
    }
}
