//! Command-line interface for stagegraph.
//!
//! Operator commands around the engine: inspect the resolved configuration,
//! push one code file through the sandbox pipeline, and read turn logs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{FsArtifactStore, ProcessSandbox};
use crate::config;
use crate::core::TurnLog;
use crate::domain::{Artifact, SessionState};
use crate::sandbox::{ArtifactSpec, CodeExecutionPipeline};

/// stagegraph - Stage-graph orchestrator for AI report pipelines
#[derive(Parser, Debug)]
#[command(name = "stagegraph")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show resolved configuration (debug)
    Config,

    /// Run one code file through the sandbox and persist its artifact
    Exec {
        /// File containing the generated code (fences or <code> tags allowed)
        code_file: PathBuf,

        /// Artifact filename the code is expected to produce (e.g. chart_1.png)
        #[arg(short, long)]
        filename: String,

        /// Human-readable artifact title
        #[arg(short, long)]
        title: Option<String>,

        /// Write artifacts here instead of the configured directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print a session's turn log
    Log {
        /// Session ID (UUID)
        session_id: String,

        /// Only show events of this turn
        #[arg(short, long)]
        turn: Option<u64>,
    },

    /// List sessions with a turn log
    Sessions,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Config => show_config(),
            Commands::Exec {
                code_file,
                filename,
                title,
                out,
            } => exec_code(code_file, &filename, title, out).await,
            Commands::Log { session_id, turn } => show_log(&session_id, turn).await,
            Commands::Sessions => list_sessions().await,
        }
    }
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("stagegraph configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Sessions:            {}", cfg.home.join("sessions").display());
    println!("  Artifacts:           {}", cfg.artifacts.display());
    println!();
    println!("Sandbox:");
    println!("  Command: {} {}", cfg.sandbox.command, cfg.sandbox.args.join(" "));
    println!("  Timeout: {}s", cfg.sandbox.timeout_seconds);
    println!();
    println!("Safety limits:");
    println!("  Max loop iterations: {}", cfg.limits.max_loop_iterations);
    println!("  Max code size:       {} bytes", cfg.limits.max_code_bytes);
    println!("  Max artifact size:   {} bytes", cfg.limits.max_artifact_bytes);

    Ok(())
}

/// One-line report of a stored artifact, from the artifact's own record
fn saved_summary(artifact: &Artifact, dir: &Path) -> String {
    let version = match artifact.version {
        Some(version) => format!("v{}", version),
        None => "unversioned".to_string(),
    };
    format!(
        "Saved {} ({}, {} bytes, {}) to {}",
        artifact.filename,
        version,
        artifact.size_bytes,
        artifact.content_type,
        dir.display()
    )
}

/// Submit one code file exactly once and report the artifact
async fn exec_code(
    code_file: PathBuf,
    filename: &str,
    title: Option<String>,
    out: Option<PathBuf>,
) -> Result<()> {
    let cfg = config::config()?;

    let code = std::fs::read_to_string(&code_file)
        .with_context(|| format!("Failed to read code file: {}", code_file.display()))?;

    let sandbox = ProcessSandbox::new(cfg.sandbox.command.clone(), cfg.sandbox.args.clone())?
        .with_timeout(Duration::from_secs(cfg.sandbox.timeout_seconds));
    let artifacts_dir = out.unwrap_or_else(|| cfg.artifacts.clone());
    let store = FsArtifactStore::new(&artifacts_dir);

    let mut state = SessionState::new();
    state.begin_turn();
    let log = TurnLog::open(state.session_id).await?;

    let spec = ArtifactSpec::new("code", "filename", "artifacts").with_title_key("title");
    state.set("code", code);
    state.set("filename", filename);
    if let Some(title) = title {
        state.set("title", title);
    }

    let pipeline = CodeExecutionPipeline::new(Arc::new(sandbox), Arc::new(store), spec)
        .with_limits(cfg.limits.clone())
        .with_sink(Arc::new(log));

    match pipeline.execute(&mut state).await? {
        Some(artifact) if artifact.is_extracted() => {
            println!("{}", saved_summary(&artifact, &artifacts_dir));
            eprintln!("\n[Session {}]", state.session_id);
        }
        Some(artifact) => {
            eprintln!(
                "\n[Artifact {} failed: {}]",
                artifact.filename,
                artifact.error.unwrap_or_default()
            );
            eprintln!("[Session {}]", state.session_id);
            std::process::exit(1);
        }
        None => {
            eprintln!("\n[Artifact {} was not submitted]", filename);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Print a session's turn log
async fn show_log(session_id_str: &str, turn: Option<u64>) -> Result<()> {
    let session_id = Uuid::parse_str(session_id_str)
        .with_context(|| format!("Invalid session ID: {}", session_id_str))?;

    let log = TurnLog::open(session_id).await?;
    let events = match turn {
        Some(turn) => log.turn_events(turn).await?,
        None => log.replay().await?,
    };

    if events.is_empty() {
        println!("No events found");
        return Ok(());
    }

    println!("{:<8} {:<20} {:<20} {}", "TURN", "EVENT", "STAGE", "SUMMARY");
    println!("{}", "-".repeat(80));

    for event in events {
        let event_type = serde_json::to_value(event.event_type)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        println!(
            "{:<8} {:<20} {:<20} {}",
            event.turn,
            event_type,
            event.stage.as_deref().unwrap_or("-"),
            event.summary
        );
        if let Some(error) = event.error {
            println!("{:<8} error: {}", "", error);
        }
    }

    Ok(())
}

/// List sessions that have a turn log
async fn list_sessions() -> Result<()> {
    let sessions = TurnLog::list_sessions().await?;

    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    for session in sessions {
        println!("{}", session);
    }

    Ok(())
}
