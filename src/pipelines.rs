//! Builders for the stage compositions every application pipeline repeats.

use std::sync::Arc;

use crate::adapters::{ArtifactStore, SandboxClient};
use crate::core::callbacks::{Callback, Chain, RejectOnInvalid, SkipIfRejected};
use crate::core::escalation::EscalationChecker;
use crate::core::event_store::{EventSink, NullSink};
use crate::core::safety::SafetyLimits;
use crate::core::stage::{Leaf, Stage};
use crate::sandbox::{ArtifactSpec, CodeExecutionPipeline, PreCleanup};

/// Default cap for a chart loop
pub const DEFAULT_CHART_ITERATIONS: u32 = 10;

/// Builds `loop[ generate (+cleanup before, +execute after), check ]`.
///
/// Each iteration names the next artifact, clears the previous code,
/// generates new code, submits it once, then checks progress against the plan.
pub struct ChartLoop {
    sandbox: Arc<dyn SandboxClient>,
    store: Arc<dyn ArtifactStore>,
    spec: ArtifactSpec,
    planned_key: String,
    planned_field: String,
    stem: String,
    ext: String,
    max_iterations: u32,
    limits: SafetyLimits,
    sink: Arc<dyn EventSink>,
}

impl ChartLoop {
    pub fn new(
        sandbox: Arc<dyn SandboxClient>,
        store: Arc<dyn ArtifactStore>,
        planned_key: impl Into<String>,
    ) -> Self {
        Self {
            sandbox,
            store,
            spec: ArtifactSpec::charts(),
            planned_key: planned_key.into(),
            planned_field: "charts".to_string(),
            stem: "chart".to_string(),
            ext: "png".to_string(),
            max_iterations: DEFAULT_CHART_ITERATIONS,
            limits: SafetyLimits::default(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_spec(mut self, spec: ArtifactSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Array field holding planned items when the plan is an object
    pub fn with_planned_field(mut self, field: impl Into<String>) -> Self {
        self.planned_field = field.into();
        self
    }

    /// Artifact filenames become `{stem}_{n}.{ext}`
    pub fn with_naming(mut self, stem: impl Into<String>, ext: impl Into<String>) -> Self {
        self.stem = stem.into();
        self.ext = ext.into();
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Assemble the loop around a code-generation leaf
    pub fn build(self, generator: impl Leaf + 'static) -> Stage {
        let cleanup = PreCleanup::new(Arc::clone(&self.sandbox), self.spec.filename_key.clone())
            .with_naming(self.spec.records_key.clone(), self.stem, self.ext)
            .clearing(self.spec.code_key.clone());

        let checker = EscalationChecker::new(self.spec.records_key.clone(), self.planned_key)
            .with_planned_field(self.planned_field);

        let execute = CodeExecutionPipeline::new(self.sandbox, self.store, self.spec)
            .with_limits(self.limits)
            .with_sink(self.sink);

        let generate = Stage::leaf("generate_chart", generator)
            .with_before(cleanup)
            .with_after(execute);

        Stage::looped(
            "chart_loop",
            vec![generate, Stage::leaf("check_charts", checker)],
            self.max_iterations,
        )
    }
}

/// Sequence whose first stage validates the input.
///
/// The validator gets a [`RejectOnInvalid`] after-hook; every later stage
/// gets a [`SkipIfRejected`] before-hook (ahead of any hook it already had).
pub fn guarded_sequence(
    name: impl Into<String>,
    validator: Stage,
    verdict_key: &str,
    flag_key: &str,
    rest: Vec<Stage>,
) -> Stage {
    let mut children = vec![validator.with_after(RejectOnInvalid::new(verdict_key, flag_key))];

    for mut stage in rest {
        let skip: Arc<dyn Callback> = Arc::new(SkipIfRejected::new(
            flag_key,
            "This request was already declined.",
        ));
        stage.before = Some(match stage.before.take() {
            Some(existing) => Arc::new(Chain::new(vec![skip, existing])),
            None => skip,
        });
        children.push(stage);
    }

    Stage::sequential(name, children)
}
