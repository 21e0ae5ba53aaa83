//! Executor Integration Tests
//!
//! Short-circuit correctness, parallel fan-out and loop bounds.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use stagegraph::core::{
    ExecutionResult, Executor, FinalResponse, Leaf, LeafOutput, ResponseKind, SafetyLimits, Stage,
};
use stagegraph::domain::SessionState;
use tokio::sync::Barrier;

/// Leaf that marks itself as having run
fn mark(name: &'static str) -> Stage {
    Stage::from_fn(name, move |state| {
        state.set(format!("ran:{}", name), true);
        Ok(LeafOutput::done())
    })
}

#[tokio::test]
async fn test_before_hook_short_circuits_rest_of_chain() {
    let executor = Executor::default();
    let mut state = SessionState::new();

    let stages: Vec<Stage> = (1..=5)
        .map(|k| {
            let name: &'static str = ["s1", "s2", "s3", "s4", "s5"][k - 1];
            let stage = mark(name);
            if k == 3 {
                stage.with_before(|_: &mut SessionState| -> Option<FinalResponse> {
                    Some(FinalResponse::rejection("stopped at s3"))
                })
            } else {
                stage
            }
        })
        .collect();
    let root = Stage::sequential("chain", stages);

    let result = executor.execute(&root, &mut state).await.unwrap();

    assert_eq!(
        result.response(),
        Some(&FinalResponse::rejection("stopped at s3"))
    );
    assert!(state.get_bool("ran:s1"));
    assert!(state.get_bool("ran:s2"));
    for skipped in ["s3", "s4", "s5"] {
        assert!(!state.contains(&format!("ran:{}", skipped)));
    }
    let stats = executor.stats();
    assert_eq!(stats.executions("s4"), 0);
    assert_eq!(stats.executions("s5"), 0);
}

#[tokio::test]
async fn test_after_hook_overrides_output_and_stops_siblings() {
    let executor = Executor::default();
    let mut state = SessionState::new();

    let root = Stage::sequential(
        "chain",
        vec![
            mark("first").with_after(|state: &mut SessionState| -> Option<FinalResponse> {
                state
                    .get_bool("ran:first")
                    .then(|| FinalResponse::info("first is enough"))
            }),
            mark("second"),
        ],
    );

    let result = executor.execute(&root, &mut state).await.unwrap();
    assert_eq!(result.response().map(|r| r.text.as_str()), Some("first is enough"));
    assert!(!state.contains("ran:second"));
}

#[tokio::test]
async fn test_termination_inside_nested_tree_stops_everything() {
    let executor = Executor::default();
    let mut state = SessionState::new();

    let root = Stage::sequential(
        "root",
        vec![
            Stage::sequential(
                "inner",
                vec![mark("a").with_after(|_: &mut SessionState| -> Option<FinalResponse> {
                    Some(FinalResponse::new(ResponseKind::PendingApproval, "wait"))
                })],
            ),
            mark("b"),
        ],
    );

    let result = executor.execute(&root, &mut state).await.unwrap();
    assert!(result.is_terminated());
    assert!(!state.contains("ran:b"));
}

/// Fetcher that waits for all siblings, then writes its own key
struct Fetcher {
    index: usize,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl Leaf for Fetcher {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        // Every sibling must be in flight for the barrier to open
        self.barrier.wait().await;

        let saw_sibling = (0..4)
            .filter(|i| *i != self.index)
            .any(|i| state.contains(&format!("fetch_{}", i)));
        state.set(format!("fetch_{}", self.index), format!("result {}", self.index));
        state.set(format!("saw_sibling_{}", self.index), saw_sibling);
        Ok(LeafOutput::done())
    }
}

#[tokio::test]
async fn test_parallel_fetchers_run_concurrently_on_disjoint_keys() {
    let executor = Executor::default();
    let mut state = SessionState::new();
    let barrier = Arc::new(Barrier::new(4));

    let fetchers = (0..4)
        .map(|index| {
            Stage::leaf(
                format!("fetcher_{}", index),
                Fetcher {
                    index,
                    barrier: Arc::clone(&barrier),
                },
            )
        })
        .collect();
    let root = Stage::parallel("fetch", fetchers);

    let result = tokio::time::timeout(Duration::from_secs(5), executor.execute(&root, &mut state))
        .await
        .expect("parallel children did not run concurrently")
        .unwrap();

    assert_eq!(result, ExecutionResult::proceed());
    for index in 0..4 {
        assert_eq!(
            state.get_str(&format!("fetch_{}", index)),
            Some(format!("result {}", index).as_str())
        );
        assert!(!state.get_bool(&format!("saw_sibling_{}", index)));
    }
}

#[tokio::test]
async fn test_parallel_write_sets_are_disjoint() {
    let state = SessionState::new();
    let mut merged = state.clone();

    let mut forks: Vec<_> = (0..4).map(|_| state.fork()).collect();
    for (index, fork) in forks.iter_mut().enumerate() {
        fork.track(|s| {
            s.set(format!("fetch_{}", index), index as u64);
            s.set(format!("fetch_{}_source", index), "search");
        });
    }

    let touched: Vec<BTreeSet<String>> = forks.iter().map(|f| f.touched()).collect();
    for i in 0..touched.len() {
        for j in (i + 1)..touched.len() {
            assert!(
                touched[i].is_disjoint(&touched[j]),
                "fetchers {} and {} wrote the same key",
                i,
                j
            );
        }
    }

    let mut claimed = BTreeSet::new();
    for fork in forks {
        merged.merge(fork, &mut claimed);
    }
    assert_eq!(claimed.len(), 8);
    assert_eq!(merged.get_u64("fetch_3"), Some(3));
}

#[tokio::test]
async fn test_terminated_parallel_child_does_not_cancel_siblings() {
    let executor = Executor::default();
    let mut state = SessionState::new();

    let slow = Stage::leaf("slow", SlowWriter);
    let stopper = mark("stopper").with_before(|_: &mut SessionState| -> Option<FinalResponse> {
        Some(FinalResponse::rejection("no"))
    });
    let root = Stage::sequential(
        "root",
        vec![Stage::parallel("fan", vec![stopper, slow]), mark("after")],
    );

    let result = executor.execute(&root, &mut state).await.unwrap();
    assert!(result.is_terminated());
    // The sibling still finished and its write was merged
    assert_eq!(state.get_str("slow"), Some("done"));
    assert!(!state.contains("ran:after"));
}

struct SlowWriter;

#[async_trait]
impl Leaf for SlowWriter {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        state.set("slow", "done");
        Ok(LeafOutput::done())
    }
}

#[tokio::test]
async fn test_loop_stops_at_first_escalation() {
    let executor = Executor::default();
    let mut state = SessionState::new();

    let tick = Stage::from_fn("tick", |state| {
        let n = state.get_u64("ticks").unwrap_or(0) + 1;
        state.set("ticks", n);
        Ok(LeafOutput::done())
    });
    let check = Stage::from_fn("check", |state| {
        if state.get_u64("ticks").unwrap_or(0) >= 4 {
            Ok(LeafOutput::escalate("enough"))
        } else {
            Ok(LeafOutput::done())
        }
    });
    let root = Stage::sequential(
        "root",
        vec![Stage::looped("loop", vec![tick, check], 10), mark("next")],
    );

    let result = executor.execute(&root, &mut state).await.unwrap();

    // Escalation ends the loop but not the pipeline
    assert_eq!(result, ExecutionResult::proceed());
    assert_eq!(state.get_u64("ticks"), Some(4));
    assert_eq!(executor.stats().iterations("loop"), 4);
    assert!(state.get_bool("ran:next"));
}

#[tokio::test]
async fn test_loop_never_exceeds_safety_ceiling() {
    let executor = Executor::new(SafetyLimits {
        max_loop_iterations: 3,
        ..Default::default()
    });
    let mut state = SessionState::new();

    let root = Stage::looped(
        "runaway",
        vec![Stage::from_fn("spin", |state| {
            let n = state.get_u64("spins").unwrap_or(0) + 1;
            state.set("spins", n);
            Ok(LeafOutput::done())
        })],
        1_000,
    );

    executor.execute(&root, &mut state).await.unwrap();
    assert_eq!(state.get_u64("spins"), Some(3));
}
