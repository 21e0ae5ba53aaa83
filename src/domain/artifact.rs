//! Binary artifacts produced by sandboxed code execution.
//!
//! Artifacts are recorded in session state (with a base64 copy of the payload
//! for later embedding) and referenced by index from the report stage.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chart, infographic, or other binary output of one code execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// 1-based position among the artifacts of its records list
    pub index: usize,

    /// Human-readable title
    pub title: String,

    /// Target filename (e.g. `chart_2.png`)
    pub filename: String,

    /// Raw bytes, base64-encoded when stored in state
    #[serde(with = "base64_payload", default)]
    pub payload: Vec<u8>,

    /// MIME type of the payload
    pub content_type: String,

    /// Report section this artifact belongs to
    #[serde(default)]
    pub section: String,

    /// Extraction outcome
    pub status: ArtifactStatus,

    /// Version returned by the artifact store (if persisted)
    #[serde(default)]
    pub version: Option<u32>,

    /// Diagnostic message for failed artifacts
    #[serde(default)]
    pub error: Option<String>,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// Size in bytes (for tracking)
    pub size_bytes: u64,
}

impl Artifact {
    /// Create a successfully extracted artifact
    pub fn extracted(
        index: usize,
        title: String,
        filename: String,
        payload: Vec<u8>,
        content_type: String,
        section: String,
    ) -> Self {
        let size_bytes = payload.len() as u64;
        Self {
            index,
            title,
            filename,
            payload,
            content_type,
            section,
            status: ArtifactStatus::ArtifactExtracted,
            version: None,
            error: None,
            created_at: Utc::now(),
            size_bytes,
        }
    }

    /// Create a placeholder for an artifact that could not be produced
    pub fn failed(
        index: usize,
        title: String,
        filename: String,
        section: String,
        error: String,
    ) -> Self {
        Self {
            index,
            title,
            filename,
            payload: Vec::new(),
            content_type: String::new(),
            section,
            status: ArtifactStatus::Failed,
            version: None,
            error: Some(error),
            created_at: Utc::now(),
            size_bytes: 0,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn is_extracted(&self) -> bool {
        self.status == ArtifactStatus::ArtifactExtracted
    }

    /// Base64 form of the payload
    pub fn encoded(&self) -> String {
        STANDARD.encode(&self.payload)
    }

    /// `data:` URI suitable for inline embedding in HTML/Markdown
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.content_type, self.encoded())
    }
}

/// Per-artifact lifecycle: `CodeGenerated → Submitted → Executed → ArtifactExtracted`,
/// or `Failed` at any transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    CodeGenerated,
    Submitted,
    Executed,
    ArtifactExtracted,
    Failed,
}

impl Default for ArtifactStatus {
    fn default() -> Self {
        Self::CodeGenerated
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_creation() {
        let artifact = Artifact::extracted(
            1,
            "Revenue by week".to_string(),
            "chart_1.png".to_string(),
            vec![0x89, 0x50, 0x4e, 0x47],
            "image/png".to_string(),
            "revenue".to_string(),
        );

        assert!(artifact.is_extracted());
        assert_eq!(artifact.size_bytes, 4);
        assert_eq!(artifact.data_uri(), "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn test_payload_is_base64_in_json() {
        let artifact = Artifact::extracted(
            2,
            "Reach".to_string(),
            "chart_2.png".to_string(),
            b"png-bytes".to_vec(),
            "image/png".to_string(),
            String::new(),
        );

        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["payload"], "cG5nLWJ5dGVz");
        assert_eq!(json["status"], "artifact_extracted");

        let parsed: Artifact = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.payload, b"png-bytes".to_vec());
    }

    #[test]
    fn test_failed_artifact() {
        let artifact = Artifact::failed(
            3,
            "Funnel".to_string(),
            "chart_3.png".to_string(),
            String::new(),
            "no output matched chart_3.png".to_string(),
        );

        assert!(!artifact.is_extracted());
        assert_eq!(artifact.status, ArtifactStatus::Failed);
        assert!(artifact.payload.is_empty());
    }
}
