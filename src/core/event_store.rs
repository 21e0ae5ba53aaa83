//! Append-only turn log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. The log is an audit trail only: session
//! state is never rebuilt from it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Event, EventType};

/// Destination for turn events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: Event) -> Result<()>;
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn record(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Keeps events in memory (tests, CLI one-shots)
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn record(&self, event: Event) -> Result<()> {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(_) => warn!("Memory sink lock poisoned, dropping event"),
        }
        Ok(())
    }
}

/// File-based turn log using JSONL format
pub struct TurnLog {
    /// Directory containing the session
    session_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Serialises appends from concurrently running stages
    write_lock: AsyncMutex<()>,
}

impl TurnLog {
    /// Create or open the turn log for a session
    pub async fn open(session_id: Uuid) -> Result<Self> {
        let base_dir = Self::base_directory()?;
        Self::open_in(&base_dir, session_id).await
    }

    /// Create or open a session's turn log under an explicit base directory
    pub async fn open_in(base_dir: &Path, session_id: Uuid) -> Result<Self> {
        let session_dir = base_dir.join(session_id.to_string());

        fs::create_dir_all(&session_dir)
            .await
            .with_context(|| format!("Failed to create session directory: {}", session_dir.display()))?;

        let events_path = session_dir.join("events.jsonl");

        Ok(Self {
            session_dir,
            events_path,
            write_lock: AsyncMutex::new(()),
        })
    }

    /// Get the base directory for all sessions (~/.stagegraph/sessions or $STAGEGRAPH_HOME/sessions)
    pub fn base_directory() -> Result<PathBuf> {
        crate::config::sessions_dir()
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the session directory
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Read all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Events belonging to one turn
    pub async fn turn_events(&self, turn: u64) -> Result<Vec<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().filter(|e| e.turn == turn).collect())
    }

    /// List all session IDs in the base directory
    pub async fn list_sessions() -> Result<Vec<Uuid>> {
        let base_dir = Self::base_directory()?;

        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        sessions.push(uuid);
                    }
                }
            }
        }

        Ok(sessions)
    }
}

#[async_trait]
impl EventSink for TurnLog {
    async fn record(&self, event: Event) -> Result<()> {
        self.append(&event).await
    }
}

/// Key identifying one artifact's sandbox submission within a turn.
///
/// Format: `{session_id}:{turn}:{filename}`
pub fn submission_key(session_id: Uuid, turn: u64, filename: &str) -> String {
    format!("{}:{}:{}", session_id, turn, filename)
}

/// Hash code content (first 16 hex chars of SHA256)
pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_log() -> (TurnLog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let log = TurnLog::open_in(temp_dir.path(), Uuid::new_v4())
            .await
            .unwrap();
        (log, temp_dir)
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let (log, _temp) = create_test_log().await;
        let session_id = Uuid::new_v4();

        let event1 = Event::new(
            session_id,
            1,
            None,
            EventType::TurnStarted,
            "Turn 1 started".to_string(),
        );
        let event2 = Event::new(
            session_id,
            1,
            Some("fetch".to_string()),
            EventType::StageStarted,
            "Stage 'fetch' started".to_string(),
        );

        log.append(&event1).await.unwrap();
        log.append(&event2).await.unwrap();

        let events = log.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::TurnStarted);
        assert_eq!(events[1].event_type, EventType::StageStarted);
    }

    #[tokio::test]
    async fn test_turn_events_filter() {
        let (log, _temp) = create_test_log().await;
        let session_id = Uuid::new_v4();

        for turn in 1..=3 {
            let event = Event::new(
                session_id,
                turn,
                None,
                EventType::TurnStarted,
                format!("Turn {} started", turn),
            );
            log.record(event).await.unwrap();
        }

        let events = log.turn_events(2).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].summary, "Turn 2 started");
    }

    #[tokio::test]
    async fn test_replay_missing_file_is_empty() {
        let (log, _temp) = create_test_log().await;
        assert!(log.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_sink_counts() {
        let sink = MemorySink::new();
        let session_id = Uuid::new_v4();
        for _ in 0..3 {
            sink.record(Event::new(
                session_id,
                1,
                Some("draw".to_string()),
                EventType::LoopIteration,
                "iteration".to_string(),
            ))
            .await
            .unwrap();
        }
        assert_eq!(sink.count(EventType::LoopIteration), 3);
        assert_eq!(sink.count(EventType::LoopEscalated), 0);
    }

    #[test]
    fn test_submission_key_format() {
        let session_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = submission_key(session_id, 4, "chart_2.png");
        assert_eq!(key, "550e8400-e29b-41d4-a716-446655440000:4:chart_2.png");
    }

    #[test]
    fn test_code_hash_consistency() {
        let hash1 = hash_code("plt.plot([1, 2])");
        let hash2 = hash_code("plt.plot([1, 2])");
        let hash3 = hash_code("plt.bar([1, 2])");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
        assert!(hash1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
