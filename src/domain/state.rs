//! Session state shared by every stage and callback in a turn.
//!
//! The state is an explicit value passed by `&mut` through the executor.
//! `Parallel` children each receive a [`StateFork`] (a snapshot plus a write
//! set) which is merged back once all children have finished.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::plan::PlanState;

/// Key holding the current [`PlanState`]
pub const PLAN_STATE_KEY: &str = "plan_state";

/// Key holding the current plan
pub const PLAN_KEY: &str = "plan";

/// Key holding the latest user message
pub const USER_MESSAGE_KEY: &str = "user_message";

/// Keys with this prefix only live for one turn
pub const TURN_SCOPED_PREFIX: &str = "temp:";

/// Mutable key/value store scoped to one session
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session identifier
    pub session_id: Uuid,

    /// Turn counter (0 before the first turn)
    pub turn: u64,

    values: BTreeMap<String, Value>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Create a session with minimal seed defaults
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Create a session with a known id
    pub fn with_id(session_id: Uuid) -> Self {
        let mut values = BTreeMap::new();
        values.insert(
            PLAN_STATE_KEY.to_string(),
            Value::String(PlanState::None.as_str().to_string()),
        );

        Self {
            session_id,
            turn: 0,
            values,
        }
    }

    /// Create a session and seed extra keys on top of the defaults
    pub fn with_seed<I, K>(seed: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut state = Self::new();
        for (key, value) in seed {
            state.values.insert(key.into(), value);
        }
        state
    }

    /// Start a new turn: bump the counter and drop turn-scoped keys
    pub fn begin_turn(&mut self) -> u64 {
        self.turn += 1;
        self.clear_prefix(TURN_SCOPED_PREFIX);
        self.turn
    }

    /// Remove every key starting with `prefix`, returning how many were dropped
    pub fn clear_prefix(&mut self, prefix: &str) -> usize {
        let before = self.values.len();
        self.values.retain(|key, _| !key.starts_with(prefix));
        before - self.values.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    /// Length of a list-typed key (0 if missing or not a list)
    pub fn list_len(&self, key: &str) -> usize {
        self.values
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deserialize a key into a typed value
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("State key '{}' has an unexpected shape", key)),
            None => Ok(None),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Serialize a typed value into a key
    pub fn set_as<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let key = key.into();
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize value for state key '{}'", key))?;
        self.values.insert(key, value);
        Ok(())
    }

    /// Append to a list-typed key, creating it if needed.
    ///
    /// A non-list value under `key` is replaced by a one-element list.
    pub fn push(&mut self, key: &str, value: impl Into<Value>) {
        let entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            items.push(value.into());
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Current plan state (unknown values read as `None`)
    pub fn plan_state(&self) -> PlanState {
        self.get_str(PLAN_STATE_KEY)
            .and_then(PlanState::parse)
            .unwrap_or_default()
    }

    pub fn set_plan_state(&mut self, plan_state: PlanState) {
        self.set(PLAN_STATE_KEY, plan_state.as_str());
    }

    /// Explicit reset: clears the plan and returns to `PlanState::None`
    pub fn reset_plan(&mut self) {
        self.values.remove(PLAN_KEY);
        self.set_plan_state(PlanState::None);
    }

    /// Snapshot the state for one `Parallel` child
    pub fn fork(&self) -> StateFork {
        StateFork {
            state: self.clone(),
            written: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Apply a finished fork's writes and return the keys it touched.
    ///
    /// `claimed` collects keys already merged from earlier siblings; a key
    /// claimed twice is a caller error and is logged, with the later fork winning.
    pub fn merge(&mut self, fork: StateFork, claimed: &mut BTreeSet<String>) -> BTreeSet<String> {
        let StateFork {
            state,
            written,
            removed,
        } = fork;

        let mut touched = BTreeSet::new();
        for key in written.iter().chain(removed.iter()) {
            if !claimed.insert(key.clone()) {
                warn!(key = %key, "Parallel children wrote the same state key");
            }
            touched.insert(key.clone());
        }

        for key in removed {
            self.values.remove(&key);
        }
        for key in written {
            if let Some(value) = state.values.get(&key) {
                self.values.insert(key, value.clone());
            }
        }

        touched
    }
}

/// A `Parallel` child's view of the state: snapshot reads, tracked writes
#[derive(Debug, Clone)]
pub struct StateFork {
    state: SessionState,
    written: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl StateFork {
    /// Keys written or removed so far
    pub fn touched(&self) -> BTreeSet<String> {
        self.written.union(&self.removed).cloned().collect()
    }

    /// Run `f` against the forked state and record which keys changed
    pub fn track<R>(&mut self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let before = self.state.values.clone();
        let result = f(&mut self.state);
        self.record_diff(&before);
        result
    }

    /// Mutable access for async bodies; call [`StateFork::settle`] afterwards
    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Record the difference between `before` and the current fork state
    pub fn settle(&mut self, before: &BTreeMap<String, Value>) {
        self.record_diff(before);
    }

    /// Copy of the current values, to pass back to [`StateFork::settle`]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.state.values.clone()
    }

    fn record_diff(&mut self, before: &BTreeMap<String, Value>) {
        for (key, value) in &self.state.values {
            if before.get(key) != Some(value) {
                self.removed.remove(key);
                self.written.insert(key.clone());
            }
        }
        for key in before.keys() {
            if !self.state.values.contains_key(key) {
                self.written.remove(key);
                self.removed.insert(key.clone());
            }
        }
    }
}
