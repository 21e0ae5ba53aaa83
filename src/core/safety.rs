//! Safety limits for stage execution.
//!
//! Bounds runaway work through configurable ceilings on:
//! - Loop iterations (a loop's own `max_iterations` is clamped to this)
//! - Generated code size submitted to the sandbox
//! - Artifact payload size kept in session state

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Safety limits for a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Hard ceiling for any loop's iteration count (default: 50)
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Maximum code size in bytes (default: 256KB)
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: u64,

    /// Maximum artifact size in bytes (default: 10MB)
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,
}

fn default_max_loop_iterations() -> u32 {
    50
}
fn default_max_code_bytes() -> u64 {
    256 * 1024
} // 256KB
fn default_max_artifact_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            max_code_bytes: default_max_code_bytes(),
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

impl SafetyLimits {
    /// Effective iteration bound for a loop asking for `requested`
    pub fn loop_bound(&self, requested: u32) -> Result<u32, SafetyViolation> {
        if requested > self.max_loop_iterations {
            return Err(SafetyViolation::MaxLoopIterations {
                requested,
                limit: self.max_loop_iterations,
            });
        }
        Ok(requested)
    }

    /// Validate generated code against the size limit
    pub fn validate_code(&self, code: &str) -> Result<(), SafetyViolation> {
        let size = code.len() as u64;
        if size > self.max_code_bytes {
            return Err(SafetyViolation::MaxCodeBytes {
                actual: size,
                limit: self.max_code_bytes,
            });
        }
        Ok(())
    }

    /// Validate an artifact payload against the size limit
    pub fn validate_artifact(&self, bytes: &[u8]) -> Result<(), SafetyViolation> {
        let size = bytes.len() as u64;
        if size > self.max_artifact_bytes {
            return Err(SafetyViolation::MaxArtifactBytes {
                actual: size,
                limit: self.max_artifact_bytes,
            });
        }
        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Loop requests {requested} iterations, ceiling is {limit}")]
    MaxLoopIterations { requested: u32, limit: u32 },

    #[error("Maximum code bytes exceeded: {actual} > {limit}")]
    MaxCodeBytes { actual: u64, limit: u64 },

    #[error("Maximum artifact bytes exceeded: {actual} > {limit}")]
    MaxArtifactBytes { actual: u64, limit: u64 },
}
