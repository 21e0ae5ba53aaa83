//! Safety Limits Integration Tests
//!
//! Tests for loop ceilings, code and artifact size limits.

mod common;

use std::sync::Arc;

use common::{CountingSandbox, MemoryStore};
use stagegraph::core::{
    EscalationChecker, Executor, LeafOutput, MemorySink, SafetyLimits, SafetyViolation, Stage,
};
use stagegraph::domain::{ArtifactStatus, EventType, SessionState};
use stagegraph::sandbox::{ArtifactSpec, CodeExecutionPipeline};

#[test]
fn test_loop_bound_clamps_to_ceiling() {
    let limits = SafetyLimits {
        max_loop_iterations: 5,
        ..Default::default()
    };

    assert_eq!(limits.loop_bound(3), Ok(3));
    assert_eq!(limits.loop_bound(5), Ok(5));
    assert_eq!(
        limits.loop_bound(6),
        Err(SafetyViolation::MaxLoopIterations {
            requested: 6,
            limit: 5
        })
    );
}

#[test]
fn test_code_and_artifact_limits() {
    let limits = SafetyLimits {
        max_code_bytes: 10,
        max_artifact_bytes: 4,
        ..Default::default()
    };

    assert!(limits.validate_code("print(1)").is_ok());
    assert!(matches!(
        limits.validate_code("print('too long')"),
        Err(SafetyViolation::MaxCodeBytes { limit: 10, .. })
    ));
    assert!(limits.validate_artifact(b"png!").is_ok());
    assert!(matches!(
        limits.validate_artifact(b"png!!"),
        Err(SafetyViolation::MaxArtifactBytes { actual: 5, limit: 4 })
    ));
}

#[tokio::test]
async fn test_loop_without_plan_stops_at_cap() {
    let sink = Arc::new(MemorySink::new());
    let executor = Executor::default().with_sink(sink.clone());
    let mut state = SessionState::new();

    // Nothing planned: the checker never escalates
    let produce = Stage::from_fn("produce", |state| {
        state.push("items", "x");
        Ok(LeafOutput::done())
    });
    let root = Stage::looped(
        "bounded",
        vec![produce, Stage::leaf("check", EscalationChecker::new("items", "planned"))],
        4,
    );

    executor.execute(&root, &mut state).await.unwrap();

    assert_eq!(state.list_len("items"), 4);
    assert_eq!(executor.stats().iterations("bounded"), 4);
    assert_eq!(sink.count(EventType::LoopExhausted), 1);
    assert_eq!(sink.count(EventType::LoopEscalated), 0);
}

#[tokio::test]
async fn test_loop_terminates_for_any_plan_size() {
    for planned in 0..6u64 {
        for max in [1u32, 3, 8] {
            let executor = Executor::default();
            let mut state = SessionState::new();
            state.set("planned", planned);

            let produce = Stage::from_fn("produce", |state| {
                state.push("items", "x");
                Ok(LeafOutput::done())
            });
            let root = Stage::looped(
                "bounded",
                vec![produce, Stage::leaf("check", EscalationChecker::new("items", "planned"))],
                max,
            );
            executor.execute(&root, &mut state).await.unwrap();

            let expected = if planned == 0 {
                max as usize
            } else {
                (planned as usize).min(max as usize)
            };
            assert_eq!(
                state.list_len("items"),
                expected,
                "planned={} max={}",
                planned,
                max
            );
        }
    }
}

#[tokio::test]
async fn test_oversized_code_is_never_submitted() {
    let sandbox = Arc::new(CountingSandbox::default());
    let pipeline = CodeExecutionPipeline::new(
        sandbox.clone(),
        Arc::new(MemoryStore::default()),
        ArtifactSpec::charts(),
    )
    .with_limits(SafetyLimits {
        max_code_bytes: 16,
        ..Default::default()
    });

    let mut state = SessionState::new();
    state.begin_turn();
    state.set("chart_filename", "chart_1.png");
    state.set("chart_code", "plt.savefig('chart_1.png')  # far more than sixteen bytes");

    let artifact = pipeline.execute(&mut state).await.unwrap().unwrap();

    assert_eq!(sandbox.submissions(), 0);
    assert_eq!(artifact.status, ArtifactStatus::Failed);
    assert!(artifact
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Maximum code bytes exceeded"));
}

#[tokio::test]
async fn test_oversized_artifact_is_not_stored() {
    let store = Arc::new(MemoryStore::default());
    let pipeline = CodeExecutionPipeline::new(
        Arc::new(CountingSandbox::default()),
        store.clone(),
        ArtifactSpec::charts(),
    )
    .with_limits(SafetyLimits {
        max_artifact_bytes: 8,
        ..Default::default()
    });

    let mut state = SessionState::new();
    state.begin_turn();
    state.set("chart_filename", "chart_1.png");
    state.set("chart_code", "plt.savefig('chart_1.png')");

    // The counting sandbox writes "png:chart_1.png", which is 15 bytes
    let artifact = pipeline.execute(&mut state).await.unwrap().unwrap();

    assert_eq!(artifact.status, ArtifactStatus::Failed);
    assert!(store.saved().is_empty());
}
