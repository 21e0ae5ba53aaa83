//! Pipeline Scenario Tests
//!
//! Whole-turn runs of the composed pipelines: chart generation loop,
//! input rejection, and report assembly.

mod common;

use std::sync::Arc;

use common::{CountingSandbox, MemoryStore};
use serde_json::json;
use stagegraph::core::{
    FnLeaf, Leaf, LeafOutput, MemorySink, Orchestrator, ResponseKind, Stage, TurnStatus,
};
use stagegraph::domain::{Artifact, ArtifactStatus, EventType, SessionState};
use stagegraph::pipelines::{guarded_sequence, ChartLoop};
use stagegraph::report::ReportLeaf;

/// Writes plotting code for whatever file the loop asked for
fn chart_generator() -> impl Leaf {
    FnLeaf::new(|state: &mut SessionState| {
        let filename = state.get_str("chart_filename").unwrap_or_default().to_string();
        state.set(
            "chart_code",
            format!("```python\nimport matplotlib\nplt.savefig('{}')\n```", filename),
        );
        Ok(LeafOutput::done())
    })
}

#[tokio::test]
async fn test_chart_loop_stops_when_plan_is_met() {
    let sandbox = Arc::new(CountingSandbox::default());
    let store = Arc::new(MemoryStore::default());
    let sink = Arc::new(MemorySink::new());

    let chart_loop = ChartLoop::new(sandbox.clone(), store.clone(), "chart_plan")
        .with_max_iterations(10)
        .with_sink(sink.clone())
        .build(chart_generator());
    let orchestrator = Orchestrator::default().with_sink(sink.clone());

    let mut state = SessionState::with_seed([(
        "chart_plan",
        json!({"charts": ["revenue", "reach", "conversion"]}),
    )]);
    let outcome = orchestrator.run_turn(&chart_loop, &mut state, "build charts").await.unwrap();
    assert!(outcome.is_completed());

    assert_eq!(orchestrator.stats().iterations("chart_loop"), 3);
    assert_eq!(sandbox.submissions(), 3);
    assert_eq!(store.saved(), vec!["chart_1.png", "chart_2.png", "chart_3.png"]);

    let charts: Vec<Artifact> = state.get_as("charts_generated").unwrap().unwrap();
    let indexes: Vec<usize> = charts.iter().map(|c| c.index).collect();
    assert_eq!(indexes, vec![1, 2, 3]);
    assert!(charts.iter().all(|c| c.status == ArtifactStatus::ArtifactExtracted));
    assert_eq!(charts[1].filename, "chart_2.png");
    assert_eq!(charts[1].payload, b"png:chart_2.png".to_vec());

    // Every iteration cleared the stale file it was about to regenerate
    assert_eq!(sandbox.removed(), vec!["chart_1.png", "chart_2.png", "chart_3.png"]);
    assert_eq!(sink.count(EventType::LoopEscalated), 1);
    assert_eq!(sink.count(EventType::CodeSubmitted), 3);
}

#[tokio::test]
async fn test_chart_loop_counts_failures_toward_plan() {
    let sandbox = Arc::new(CountingSandbox::default());
    let chart_loop = ChartLoop::new(sandbox.clone(), Arc::new(MemoryStore::default()), "chart_plan")
        .with_max_iterations(10)
        .build(FnLeaf::new(|state: &mut SessionState| {
            // Never produces the requested file
            state.set("chart_code", "print('nothing to see')");
            Ok(LeafOutput::done())
        }));
    let orchestrator = Orchestrator::default();

    let mut state = SessionState::with_seed([("chart_plan", json!(2))]);
    let outcome = orchestrator.run_turn(&chart_loop, &mut state, "build charts").await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(orchestrator.stats().iterations("chart_loop"), 2);
    let charts: Vec<Artifact> = state.get_as("charts_generated").unwrap().unwrap();
    assert!(charts.iter().all(|c| c.status == ArtifactStatus::Failed));
    assert_eq!(state.list_len("charts_generated_diagnostics"), 2);
}

#[tokio::test]
async fn test_rejected_input_skips_downstream_stages() {
    let validator = Stage::from_fn("validate", |state| {
        let message = state.get_str("user_message").unwrap_or_default();
        let valid = message.contains("marketing");
        state.set(
            "validation",
            json!({"valid": valid, "reason": "it is not about marketing"}),
        );
        Ok(LeafOutput::done())
    });
    let classify = Stage::from_fn("classify", |state| {
        state.set("classification", "campaign_review");
        Ok(LeafOutput::done())
    });
    let report = Stage::from_fn("report", |state| {
        state.set("final_report", "# Marketing report");
        Ok(LeafOutput::done())
    });
    let root = guarded_sequence(
        "guarded",
        validator,
        "validation",
        "temp:rejected",
        vec![classify, report],
    );
    let orchestrator = Orchestrator::default();
    let mut state = SessionState::new();

    let outcome = orchestrator.run_turn(&root, &mut state, "What's the weather?").await.unwrap();
    assert_eq!(
        outcome.status,
        TurnStatus::Terminated {
            kind: ResponseKind::Rejection
        }
    );
    assert_eq!(
        outcome.response,
        "Sorry, I can't process this request: it is not about marketing"
    );
    assert!(!state.contains("classification"));
    assert!(!state.contains("final_report"));
    assert_eq!(orchestrator.stats().executions("classify"), 0);

    // The flag is turn-scoped, so a valid follow-up runs normally
    let outcome = orchestrator
        .run_turn(&root, &mut state, "Review our marketing funnel")
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.response, "# Marketing report");
    assert_eq!(state.get_str("classification"), Some("campaign_review"));
}

#[tokio::test]
async fn test_report_embeds_generated_charts() {
    let sandbox = Arc::new(CountingSandbox::default());
    let chart_loop = ChartLoop::new(sandbox, Arc::new(MemoryStore::default()), "chart_plan")
        .with_max_iterations(5)
        .build(chart_generator());
    let root = Stage::sequential(
        "report_pipeline",
        vec![
            chart_loop,
            Stage::leaf(
                "assemble_report",
                ReportLeaf::new("report_template", "charts_generated", "final_report"),
            ),
        ],
    );

    let mut state = SessionState::with_seed([
        ("chart_plan", json!(["revenue", "reach"])),
        (
            "report_template",
            json!("<h1>Q3</h1><img src=\"{{artifact_1}}\"><img src=\"{{artifact_2}}\">{{artifact_3}}"),
        ),
    ]);
    let outcome = Orchestrator::default()
        .run_turn(&root, &mut state, "Q3 report")
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert!(outcome.response.starts_with("<h1>Q3</h1><img src=\"data:image/png;base64,"));
    assert!(!outcome.response.contains("{{artifact_1}}"));
    assert!(!outcome.response.contains("{{artifact_2}}"));
    // Nothing was generated for the third slot
    assert!(outcome.response.ends_with("{{artifact_3}}"));
}
