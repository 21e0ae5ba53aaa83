//! Adapter interfaces for external collaborators.
//!
//! The engine only talks to the outside world through these traits: a
//! generative model, a search backend, a code-execution sandbox, and an
//! artifact store. Concrete implementations live in submodules.

pub mod fs_store;
pub mod leaves;
pub mod process_sandbox;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use fs_store::FsArtifactStore;
pub use leaves::{render_instruction, strip_fences, ModelLeaf, SearchLeaf};
pub use process_sandbox::ProcessSandbox;

/// Output from a model invocation
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    /// Raw text returned by the model
    pub text: String,

    /// Parsed structured output (if the model returned one)
    pub structured: Option<Value>,

    /// Tokens used (if available)
    pub tokens_used: Option<u64>,
}

impl ModelOutput {
    /// Create a new model output with just text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
            tokens_used: None,
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            text: value.to_string(),
            structured: Some(value),
            tokens_used: None,
        }
    }
}

/// Hosted generative model
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Invoke the model with formatted instruction text and the state slices it refers to
    async fn invoke(&self, instruction: &str, bindings: &Map<String, Value>) -> Result<ModelOutput>;
}

/// One grounded search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,

    #[serde(default)]
    pub snippet: String,
}

/// Web/search backend
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// One binary output of a sandbox execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutput {
    pub mime_type: String,
    pub bytes: Vec<u8>,

    /// Free-form metadata; `filename` is used to match artifacts
    pub metadata: BTreeMap<String, String>,
}

impl SandboxOutput {
    pub fn file(filename: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), filename.into());
        Self {
            mime_type: mime_type.into(),
            bytes,
            metadata,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get("filename").map(String::as_str)
    }
}

/// Everything a sandbox returns for one submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxResponse {
    pub outputs: Vec<SandboxOutput>,
    pub stdout: String,
    pub stderr: String,
}

/// Code-execution sandbox
#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// Human-readable sandbox name
    fn name(&self) -> &str;

    /// Execute `code` once and return its outputs
    async fn submit(&self, code: &str) -> Result<SandboxResponse>;

    /// Remove a previously produced file (no-op for stateless sandboxes)
    async fn remove_file(&self, _filename: &str) -> Result<()> {
        Ok(())
    }
}

/// External storage for persisted artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Save bytes under `filename`, returning the new version number
    async fn save(&self, filename: &str, bytes: &[u8], mime_type: &str) -> Result<u32>;
}

/// Guess a MIME type from a filename extension
pub fn mime_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "txt" | "md" => "text/plain",
        _ => "application/octet-stream",
    }
}
