//! Deterministic collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use stagegraph::adapters::{ArtifactStore, SandboxClient, SandboxOutput, SandboxResponse};

/// Sandbox that "renders" every `*.png` name mentioned in the code
#[derive(Default)]
pub struct CountingSandbox {
    submissions: AtomicUsize,
    removed: Mutex<Vec<String>>,
}

impl CountingSandbox {
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SandboxClient for CountingSandbox {
    fn name(&self) -> &str {
        "counting"
    }

    async fn submit(&self, code: &str) -> Result<SandboxResponse> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let outputs = code
            .split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == '(' || c == ')')
            .filter(|word| word.ends_with(".png"))
            .map(|name| SandboxOutput::file(name, "image/png", format!("png:{}", name).into_bytes()))
            .collect();
        Ok(SandboxResponse {
            outputs,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn remove_file(&self, filename: &str) -> Result<()> {
        if let Ok(mut removed) = self.removed.lock() {
            removed.push(filename.to_string());
        }
        Ok(())
    }
}

/// Artifact store keeping filenames in memory
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn save(&self, filename: &str, _bytes: &[u8], _mime_type: &str) -> Result<u32> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        saved.push(filename.to_string());
        Ok(saved.iter().filter(|f| f.as_str() == filename).count() as u32)
    }
}
