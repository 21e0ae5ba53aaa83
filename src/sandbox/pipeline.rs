//! The post-generation hook that runs code exactly once per artifact.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::extract::{extract_code, match_output};
use super::{ArtifactSpec, SandboxError};
use crate::adapters::{mime_for, ArtifactStore, SandboxClient};
use crate::core::callbacks::{Callback, FinalResponse};
use crate::core::event_store::{hash_code, submission_key, EventSink, NullSink};
use crate::core::safety::SafetyLimits;
use crate::domain::{Artifact, ArtifactStatus, Event, EventType, SessionState};

/// Prefix of the turn-scoped ledger entries, one state key per submission
pub const SUBMISSION_LEDGER_PREFIX: &str = "temp:sandbox_submission:";

/// State key claiming one submission; holds the submitted code's hash.
///
/// Each claim lives under its own key so pipelines running in parallel
/// branches write disjoint keys and every claim survives the merge.
pub fn submission_ledger_key(state: &SessionState, filename: &str) -> String {
    format!(
        "{}{}",
        SUBMISSION_LEDGER_PREFIX,
        submission_key(state.session_id, state.turn, filename)
    )
}

/// `{stem}_{n}.{ext}` where `n` is one past the number of recorded artifacts
pub fn next_artifact_filename(state: &SessionState, records_key: &str, stem: &str, ext: &str) -> String {
    format!("{}_{}.{}", stem, state.list_len(records_key) + 1, ext)
}

/// Bytes that made it all the way through the sandbox and the store
struct Persisted {
    bytes: Vec<u8>,
    mime_type: String,
    version: u32,
}

/// After-hook submitting generated code to the sandbox and capturing its artifact
pub struct CodeExecutionPipeline {
    sandbox: Arc<dyn SandboxClient>,
    store: Arc<dyn ArtifactStore>,
    spec: ArtifactSpec,
    limits: SafetyLimits,
    sink: Arc<dyn EventSink>,
}

impl CodeExecutionPipeline {
    pub fn new(
        sandbox: Arc<dyn SandboxClient>,
        store: Arc<dyn ArtifactStore>,
        spec: ArtifactSpec,
    ) -> Self {
        Self {
            sandbox,
            store,
            spec,
            limits: SafetyLimits::default(),
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn spec(&self) -> &ArtifactSpec {
        &self.spec
    }

    /// Run the generated code for the current artifact.
    ///
    /// Returns the recorded artifact (extracted or failed), or `None` when
    /// the filename was already submitted this turn and nothing was recorded.
    /// Only state serialization problems are returned as errors.
    #[instrument(skip(self, state), fields(sandbox = %self.sandbox.name(), records = %self.spec.records_key))]
    pub async fn execute(&self, state: &mut SessionState) -> Result<Option<Artifact>> {
        let index = state.list_len(&self.spec.records_key) + 1;
        let filename = state
            .get_str(&self.spec.filename_key)
            .unwrap_or_default()
            .to_string();
        let title = state
            .get_str(&self.spec.title_key)
            .map(str::to_string)
            .unwrap_or_else(|| filename.clone());

        match self.produce(state, &filename).await {
            Ok(persisted) => {
                let artifact = Artifact::extracted(
                    index,
                    title,
                    filename.clone(),
                    persisted.bytes,
                    persisted.mime_type,
                    self.spec.section.clone(),
                )
                .with_version(persisted.version);
                debug!(file = %filename, status = ?ArtifactStatus::ArtifactExtracted, "Artifact transition");

                state.push(&self.spec.records_key, serde_json::to_value(&artifact)?);
                info!(file = %filename, index, version = persisted.version, "Artifact saved");
                self.record(
                    state,
                    EventType::ArtifactSaved,
                    format!("Saved {} (v{})", filename, persisted.version),
                    None,
                )
                .await;

                Ok(Some(artifact))
            }
            Err(SandboxError::AlreadySubmitted(key)) => {
                let err = SandboxError::AlreadySubmitted(filename.clone());
                warn!(submission = %key, "Refusing duplicate sandbox submission");
                state.push(&self.spec.diagnostics_key, format!("{}: {}", filename, err));
                Ok(None)
            }
            Err(err) => {
                let diagnostic = err.to_string();
                warn!(file = %filename, error = %diagnostic, status = ?ArtifactStatus::Failed, "Artifact failed");

                let artifact = Artifact::failed(
                    index,
                    title,
                    filename.clone(),
                    self.spec.section.clone(),
                    diagnostic.clone(),
                );
                state.push(&self.spec.records_key, serde_json::to_value(&artifact)?);
                state.push(
                    &self.spec.diagnostics_key,
                    format!("{}: {}", display_name(&filename), diagnostic),
                );
                self.record(
                    state,
                    EventType::ArtifactFailed,
                    format!("Artifact {} failed", display_name(&filename)),
                    Some(diagnostic),
                )
                .await;

                Ok(Some(artifact))
            }
        }
    }

    /// Walk one artifact through the state machine up to persistence
    async fn produce(&self, state: &mut SessionState, filename: &str) -> Result<Persisted, SandboxError> {
        if filename.is_empty() {
            return Err(SandboxError::MissingKey(self.spec.filename_key.clone()));
        }

        let raw = state
            .get_str(&self.spec.code_key)
            .ok_or_else(|| SandboxError::MissingKey(self.spec.code_key.clone()))?;
        let code = extract_code(raw)?;
        self.limits.validate_code(&code)?;
        debug!(file = %filename, status = ?ArtifactStatus::CodeGenerated, "Artifact transition");

        // Claim the submission before submitting so a failed run is never retried
        let key = submission_ledger_key(state, filename);
        if state.contains(&key) {
            return Err(SandboxError::AlreadySubmitted(key));
        }
        state.set(key, hash_code(&code));

        self.record(
            state,
            EventType::CodeSubmitted,
            format!("Submitted code for {} ({} bytes)", filename, code.len()),
            None,
        )
        .await;
        debug!(file = %filename, status = ?ArtifactStatus::Submitted, "Artifact transition");

        let response = self
            .sandbox
            .submit(&code)
            .await
            .map_err(|e| SandboxError::SubmissionFailed(format!("{:#}", e)))?;
        debug!(
            file = %filename,
            status = ?ArtifactStatus::Executed,
            outputs = response.outputs.len(),
            "Artifact transition"
        );

        let output = match_output(&response.outputs, filename)
            .ok_or_else(|| SandboxError::NoMatchingOutput(filename.to_string()))?;
        self.limits.validate_artifact(&output.bytes)?;

        let mime_type = if output.mime_type.is_empty() {
            mime_for(filename).to_string()
        } else {
            output.mime_type.clone()
        };

        let version = self
            .store
            .save(filename, &output.bytes, &mime_type)
            .await
            .map_err(|e| SandboxError::PersistFailed {
                filename: filename.to_string(),
                reason: format!("{:#}", e),
            })?;

        Ok(Persisted {
            bytes: output.bytes.clone(),
            mime_type,
            version,
        })
    }

    async fn record(&self, state: &SessionState, event_type: EventType, summary: String, error: Option<String>) {
        let mut event = Event::new(state.session_id, state.turn, None, event_type, summary);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        if let Err(e) = self.sink.record(event).await {
            warn!(error = %e, "Failed to record sandbox event");
        }
    }
}

fn display_name(filename: &str) -> &str {
    if filename.is_empty() {
        "<unnamed>"
    } else {
        filename
    }
}

#[async_trait]
impl Callback for CodeExecutionPipeline {
    async fn call(&self, state: &mut SessionState) -> Result<Option<FinalResponse>> {
        self.execute(state).await?;
        Ok(None)
    }
}

/// Before-hook run ahead of a generation leaf.
///
/// Optionally assigns the next artifact filename, clears stale inputs, and
/// removes any file with that name from the sandbox so an old artifact can
/// never be picked up by a failed run.
pub struct PreCleanup {
    sandbox: Arc<dyn SandboxClient>,
    filename_key: String,
    naming: Option<Naming>,
    cleared_keys: Vec<String>,
}

struct Naming {
    records_key: String,
    stem: String,
    ext: String,
}

impl PreCleanup {
    pub fn new(sandbox: Arc<dyn SandboxClient>, filename_key: impl Into<String>) -> Self {
        Self {
            sandbox,
            filename_key: filename_key.into(),
            naming: None,
            cleared_keys: Vec::new(),
        }
    }

    /// Write [`next_artifact_filename`] into the filename key first
    pub fn with_naming(
        mut self,
        records_key: impl Into<String>,
        stem: impl Into<String>,
        ext: impl Into<String>,
    ) -> Self {
        self.naming = Some(Naming {
            records_key: records_key.into(),
            stem: stem.into(),
            ext: ext.into(),
        });
        self
    }

    /// Remove a state key (e.g. last iteration's code) before generation
    pub fn clearing(mut self, key: impl Into<String>) -> Self {
        self.cleared_keys.push(key.into());
        self
    }
}

#[async_trait]
impl Callback for PreCleanup {
    async fn call(&self, state: &mut SessionState) -> Result<Option<FinalResponse>> {
        if let Some(naming) = &self.naming {
            let filename = next_artifact_filename(state, &naming.records_key, &naming.stem, &naming.ext);
            state.set(self.filename_key.clone(), filename);
        }

        for key in &self.cleared_keys {
            state.remove(key);
        }

        if let Some(filename) = state.get_str(&self.filename_key) {
            // A stale file that cannot be removed is logged, not fatal
            if let Err(e) = self.sandbox.remove_file(filename).await {
                warn!(file = %filename, error = %e, "Failed to remove stale sandbox file");
            }
        }

        Ok(None)
    }
}
