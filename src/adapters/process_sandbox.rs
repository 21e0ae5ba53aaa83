//! Local subprocess sandbox for generated code.
//!
//! Pipes submitted code into an interpreter (default `python3 -`) running
//! inside a dedicated workspace directory. Files created or modified by the
//! run are returned as outputs. The workspace persists between submissions,
//! which is why stale files must be removed before regenerating them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{mime_for, SandboxClient, SandboxOutput, SandboxResponse};

/// Default per-submission timeout in seconds
pub const DEFAULT_SANDBOX_TIMEOUT_SECONDS: u64 = 120;

/// Sandbox running code through a local interpreter subprocess
pub struct ProcessSandbox {
    /// Interpreter binary (default: "python3")
    command: String,

    /// Interpreter arguments (default: ["-"], read program from stdin)
    args: Vec<String>,

    /// Directory the code runs in and writes its files to
    workspace: PathBuf,

    /// Per-submission timeout
    timeout: Duration,

    /// Keeps an owned temporary workspace alive
    _temp: Option<TempDir>,
}

impl ProcessSandbox {
    /// Create a sandbox with a fresh temporary workspace
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Result<Self> {
        let temp = TempDir::new().context("Failed to create sandbox workspace")?;
        Ok(Self {
            command: command.into(),
            args,
            workspace: temp.path().to_path_buf(),
            timeout: Duration::from_secs(DEFAULT_SANDBOX_TIMEOUT_SECONDS),
            _temp: Some(temp),
        })
    }

    /// Python sandbox reading the program from stdin
    pub fn python() -> Result<Self> {
        Self::new("python3", vec!["-".to_string()])
    }

    /// Use an existing directory as the workspace
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self._temp = None;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Filename -> modification time for every regular file in the workspace
    async fn snapshot(&self) -> Result<BTreeMap<String, (u64, Option<SystemTime>)>> {
        let mut files = BTreeMap::new();
        if !self.workspace.exists() {
            return Ok(files);
        }

        let mut entries = fs::read_dir(&self.workspace).await.with_context(|| {
            format!("Failed to list sandbox workspace: {}", self.workspace.display())
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.insert(name.to_string(), (metadata.len(), metadata.modified().ok()));
            }
        }

        Ok(files)
    }

    /// Run the interpreter with `code` on stdin
    async fn run_subprocess(&self, code: &str) -> Result<(String, String)> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn sandbox interpreter '{}'", self.command))?;

        // Feed stdin while draining the output pipes; the timeout covers both
        let stdin = child.stdin.take();
        let payload = code.as_bytes();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(payload).await {
                    // The interpreter exited without reading everything; its status tells why
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        debug!("Sandbox interpreter closed stdin early");
                    }
                    Err(e) => return Err(anyhow::Error::new(e).context("Failed to write code to sandbox stdin")),
                    Ok(()) => {}
                }
                // Dropping stdin signals EOF
            }
            Ok(())
        };
        let run = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output.context("Failed to wait for sandbox interpreter")
        };

        let output = timeout(self.timeout, run)
            .await
            .with_context(|| format!("Sandbox execution timed out after {:?}", self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Sandbox code failed with exit code {}: {}",
                exit_code,
                stderr.trim()
            );
        }

        Ok((stdout, stderr))
    }
}

#[async_trait]
impl SandboxClient for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    async fn submit(&self, code: &str) -> Result<SandboxResponse> {
        fs::create_dir_all(&self.workspace).await.with_context(|| {
            format!("Failed to create sandbox workspace: {}", self.workspace.display())
        })?;

        let before = self.snapshot().await?;
        let (stdout, stderr) = self.run_subprocess(code).await?;
        let after = self.snapshot().await?;

        let mut outputs = Vec::new();
        for (name, stamp) in after {
            if before.get(&name) == Some(&stamp) {
                continue;
            }
            let path = self.workspace.join(&name);
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("Failed to read sandbox output: {}", path.display()))?;
            debug!(file = %name, size = bytes.len(), "Sandbox produced file");
            outputs.push(SandboxOutput::file(name.clone(), mime_for(&name), bytes));
        }

        Ok(SandboxResponse {
            outputs,
            stdout,
            stderr,
        })
    }

    async fn remove_file(&self, filename: &str) -> Result<()> {
        // Only plain names inside the workspace
        if filename.contains('/') || filename.contains('\\') || filename == ".." {
            anyhow::bail!("Refusing to remove '{}' outside the sandbox workspace", filename);
        }

        let path = self.workspace.join(filename);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove sandbox file: {}", path.display()))?;
            debug!(file = %filename, "Removed stale sandbox file");
        }
        Ok(())
    }
}
