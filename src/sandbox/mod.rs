//! Sandboxed code execution.
//!
//! Code generation and code execution are separate stages: a generation leaf
//! only writes code to state, and [`CodeExecutionPipeline`], attached as that
//! leaf's after-hook, makes the single sandbox submission. Each artifact
//! moves `CodeGenerated → Submitted → Executed → ArtifactExtracted`, or ends
//! `Failed`, and failures are recorded rather than raised.

pub mod extract;
pub mod pipeline;

use thiserror::Error;

use crate::core::safety::SafetyViolation;

pub use extract::{extract_code, match_output};
pub use pipeline::{
    next_artifact_filename, submission_ledger_key, CodeExecutionPipeline, PreCleanup,
    SUBMISSION_LEDGER_PREFIX,
};

/// Why one artifact could not be produced
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("No code found in generated output")]
    NoCode,

    #[error("Generated code could not be extracted: {0}")]
    MalformedCode(String),

    #[error("State key '{0}' is missing")]
    MissingKey(String),

    #[error("Artifact '{0}' was already submitted this turn")]
    AlreadySubmitted(String),

    #[error("Sandbox submission failed: {0}")]
    SubmissionFailed(String),

    #[error("No sandbox output matches '{0}'")]
    NoMatchingOutput(String),

    #[error("Failed to persist artifact '{filename}': {reason}")]
    PersistFailed { filename: String, reason: String },

    #[error(transparent)]
    Safety(#[from] SafetyViolation),
}

/// Where one code-execution step reads its inputs and records its results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    /// Key holding the generated (possibly wrapped) code
    pub code_key: String,

    /// Key holding the target artifact filename
    pub filename_key: String,

    /// Key holding a human-readable title (falls back to the filename)
    pub title_key: String,

    /// Report section the artifacts belong to
    pub section: String,

    /// List key collecting every attempted artifact
    pub records_key: String,

    /// List key collecting diagnostic strings for failures
    pub diagnostics_key: String,
}

impl ArtifactSpec {
    pub fn new(
        code_key: impl Into<String>,
        filename_key: impl Into<String>,
        records_key: impl Into<String>,
    ) -> Self {
        let records_key = records_key.into();
        Self {
            code_key: code_key.into(),
            filename_key: filename_key.into(),
            title_key: "artifact_title".to_string(),
            section: String::new(),
            diagnostics_key: format!("{}_diagnostics", records_key),
            records_key,
        }
    }

    /// Keys used by the chart generation loop
    pub fn charts() -> Self {
        Self::new("chart_code", "chart_filename", "charts_generated")
            .with_title_key("chart_title")
            .with_section("charts")
    }

    pub fn with_title_key(mut self, key: impl Into<String>) -> Self {
        self.title_key = key.into();
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }

    pub fn with_diagnostics_key(mut self, key: impl Into<String>) -> Self {
        self.diagnostics_key = key.into();
        self
    }
}
