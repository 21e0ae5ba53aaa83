//! Filesystem-backed artifact store.
//!
//! The current version of an artifact lives at `<dir>/<filename>`. Saving
//! over an existing file first rotates it to `<filename>.v<N>`, so every
//! version stays on disk and the returned number counts from 1.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::ArtifactStore;

/// Artifact store writing into one directory
pub struct FsArtifactStore {
    dir: PathBuf,

    /// Serializes rotate-then-write so concurrent saves cannot share a version
    write_lock: Mutex<()>,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store rooted at the configured artifacts directory
    pub fn from_config() -> Result<Self> {
        let config = crate::config::config()?;
        Ok(Self::new(config.artifacts.clone()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the current version of `filename`
    pub fn artifact_path(&self, filename: &str) -> Result<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.starts_with('.')
        {
            anyhow::bail!("Invalid artifact filename: '{}'", filename);
        }
        Ok(self.dir.join(filename))
    }

    /// Latest stored version number (0 if never saved)
    pub async fn current_version(&self, filename: &str) -> Result<u32> {
        let path = self.artifact_path(filename)?;
        if !path.exists() {
            return Ok(0);
        }
        Ok(self.rotated_versions(filename).await? + 1)
    }

    /// Load the current version of an artifact
    pub async fn load(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        let path = self.artifact_path(filename)?;

        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", path.display()))?;

        Ok(Some(bytes))
    }

    /// List current artifact filenames (rotated versions excluded)
    pub async fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = BTreeSet::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.insert(name.to_string());
            }
        }

        // `report.v2` is only a rotation when `report` sits beside it
        Ok(names
            .iter()
            .filter(|name| match rotation_of(name) {
                Some((base, _)) => !names.contains(base),
                None => true,
            })
            .cloned()
            .collect())
    }

    /// How many `<filename>.v<N>` rotations exist, counting up from v1
    async fn rotated_versions(&self, filename: &str) -> Result<u32> {
        let mut count = 0;
        while fs::try_exists(self.dir.join(format!("{}.v{}", filename, count + 1))).await? {
            count += 1;
        }
        Ok(count)
    }
}

/// Base filename and version of a rotated name like `chart_1.png.v2`
fn rotation_of(name: &str) -> Option<(&str, u32)> {
    let (base, suffix) = name.rsplit_once(".v")?;
    if base.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((base, suffix.parse().ok()?))
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save(&self, filename: &str, bytes: &[u8], mime_type: &str) -> Result<u32> {
        let _guard = self.write_lock.lock().await;
        let path = self.artifact_path(filename)?;

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create artifact directory: {}", self.dir.display()))?;

        let previous = self.current_version(filename).await?;
        if previous > 0 {
            let rotated = self.dir.join(format!("{}.v{}", filename, previous));
            fs::rename(&path, &rotated)
                .await
                .with_context(|| format!("Failed to rotate artifact: {}", path.display()))?;
        }

        fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write artifact: {}", path.display()))?;

        let version = previous + 1;
        debug!(file = %filename, version, mime = %mime_type, size = bytes.len(), "Saved artifact");
        Ok(version)
    }
}
