//! Configuration for stagegraph.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STAGEGRAPH_HOME, STAGEGRAPH_ARTIFACTS)
//! 2. Config file (.stagegraph/config.yaml)
//! 3. Defaults (~/.stagegraph)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stagegraph/config.yaml
//! - `paths.home` is relative to the .stagegraph/ directory, `paths.artifacts`
//!   to the project root that contains it

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::process_sandbox::DEFAULT_SANDBOX_TIMEOUT_SECONDS;
use crate::core::safety::SafetyLimits;

/// Name of the per-project config directory
pub const CONFIG_DIR_NAME: &str = ".stagegraph";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
    #[serde(default)]
    pub limits: Option<LimitsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (turn logs)
    pub home: Option<String>,
    /// Directory persisted artifacts are written to
    pub artifacts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_loop_iterations: Option<u32>,
    pub max_artifact_bytes: Option<u64>,
    pub max_code_bytes: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to stagegraph home (engine state)
    pub home: PathBuf,
    /// Absolute path to the artifact directory
    pub artifacts: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Local sandbox interpreter settings
    pub sandbox: SandboxSettings,
    /// Execution limits
    pub limits: SafetyLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxSettings {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["-".to_string()],
            timeout_seconds: DEFAULT_SANDBOX_TIMEOUT_SECONDS,
        }
    }
}

impl SandboxSettings {
    fn merged(config: Option<&SandboxConfig>) -> Self {
        let defaults = Self::default();
        match config {
            Some(c) => Self {
                command: c.command.clone().unwrap_or(defaults.command),
                args: c.args.clone().unwrap_or(defaults.args),
                timeout_seconds: c.timeout_seconds.unwrap_or(defaults.timeout_seconds),
            },
            None => defaults,
        }
    }
}

fn merged_limits(config: Option<&LimitsConfig>) -> SafetyLimits {
    let defaults = SafetyLimits::default();
    match config {
        Some(c) => SafetyLimits {
            max_loop_iterations: c.max_loop_iterations.unwrap_or(defaults.max_loop_iterations),
            max_artifact_bytes: c.max_artifact_bytes.unwrap_or(defaults.max_artifact_bytes),
            max_code_bytes: c.max_code_bytes.unwrap_or(defaults.max_code_bytes),
        },
        None => defaults,
    }
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    artifacts: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("STAGEGRAPH_HOME").ok().map(PathBuf::from),
            artifacts: std::env::var("STAGEGRAPH_ARTIFACTS").ok().map(PathBuf::from),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file_from(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR_NAME).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge an optional config file with environment overrides and defaults
fn resolve(config_file: Option<PathBuf>, env: EnvOverrides, default_home: PathBuf) -> Result<ResolvedConfig> {
    let Some(config_path) = config_file else {
        let home = env.home.unwrap_or(default_home);
        let artifacts = env.artifacts.unwrap_or_else(|| home.join("artifacts"));
        return Ok(ResolvedConfig {
            home,
            artifacts,
            config_file: None,
            sandbox: SandboxSettings::default(),
            limits: SafetyLimits::default(),
        });
    };

    let config = load_config_file(&config_path)?;

    // .stagegraph/ and the project root above it
    let config_dir = config_path.parent().unwrap_or(Path::new("."));
    let base_dir = config_dir.parent().unwrap_or(Path::new("."));

    let home = match (env.home, &config.paths.home) {
        (Some(env_home), _) => env_home,
        (None, Some(home_path)) => resolve_path(config_dir, home_path),
        (None, None) => default_home,
    };

    let artifacts = match (env.artifacts, &config.paths.artifacts) {
        (Some(env_artifacts), _) => env_artifacts,
        (None, Some(artifacts_path)) => resolve_path(base_dir, artifacts_path),
        (None, None) => home.join("artifacts"),
    };

    Ok(ResolvedConfig {
        home,
        artifacts,
        sandbox: SandboxSettings::merged(config.sandbox.as_ref()),
        limits: merged_limits(config.limits.as_ref()),
        config_file: Some(config_path),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR_NAME);

    let config_file = std::env::current_dir()
        .ok()
        .and_then(|cwd| find_config_file_from(&cwd));

    resolve(config_file, EnvOverrides::from_env(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the stagegraph home directory (engine state).
pub fn stagegraph_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the sessions directory ($STAGEGRAPH_HOME/sessions)
pub fn sessions_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("sessions"))
}

/// Get the artifact directory.
pub fn artifacts_dir() -> Result<PathBuf> {
    Ok(config()?.artifacts.clone())
}
