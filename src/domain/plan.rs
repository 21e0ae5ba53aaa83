//! Plans that must be approved by the user before the main pipeline runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Approval state of the session's plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    /// No plan yet (session start or after a reset)
    #[default]
    None,

    /// A plan was presented and awaits the user's answer
    Pending,

    /// The user approved the plan
    Approved,
}

impl PlanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            _ => None,
        }
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured execution plan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    /// What the plan is for
    pub title: String,

    /// Ordered plan entries (e.g. one per chart or report section)
    #[serde(default)]
    pub entries: Vec<PlanEntry>,
}

/// One named item in a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub name: String,

    #[serde(default)]
    pub description: String,
}

impl PlanEntry {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A single refinement applied to an existing plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum PlanEdit {
    /// Insert a new entry (at `position`, or at the end)
    Add {
        entry: PlanEntry,
        #[serde(default)]
        position: Option<usize>,
    },

    /// Remove exactly the named entry
    Remove { name: String },

    /// Replace the description of the named entry
    Modify { name: String, description: String },
}

/// Plan and plan-state errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Invalid plan transition from '{from}' on {event}")]
    InvalidTransition { from: PlanState, event: String },

    #[error("Plan has no entry named '{name}'")]
    UnknownEntry { name: String },

    #[error("Plan already has an entry named '{name}'")]
    DuplicateEntry { name: String },
}

impl Plan {
    pub fn new(title: impl Into<String>, entries: Vec<PlanEntry>) -> Self {
        Self {
            title: title.into(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Apply one edit; the plan is left untouched on error
    pub fn apply(&mut self, edit: &PlanEdit) -> Result<(), PlanError> {
        match edit {
            PlanEdit::Add { entry, position } => {
                if self.position(&entry.name).is_some() {
                    return Err(PlanError::DuplicateEntry {
                        name: entry.name.clone(),
                    });
                }
                let at = position.unwrap_or(self.entries.len()).min(self.entries.len());
                self.entries.insert(at, entry.clone());
            }
            PlanEdit::Remove { name } => {
                let idx = self
                    .position(name)
                    .ok_or_else(|| PlanError::UnknownEntry { name: name.clone() })?;
                self.entries.remove(idx);
            }
            PlanEdit::Modify { name, description } => {
                let idx = self
                    .position(name)
                    .ok_or_else(|| PlanError::UnknownEntry { name: name.clone() })?;
                self.entries[idx].description = description.clone();
            }
        }
        Ok(())
    }

    /// Apply edits in order, stopping at the first failure
    pub fn apply_all(&mut self, edits: &[PlanEdit]) -> Result<(), PlanError> {
        let mut staged = self.clone();
        for edit in edits {
            staged.apply(edit)?;
        }
        *self = staged;
        Ok(())
    }

    /// Markdown rendering shown to the user for approval
    pub fn render(&self) -> String {
        let mut out = format!("## Proposed plan: {}\n\n", self.title);
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.description.is_empty() {
                out.push_str(&format!("{}. **{}**\n", i + 1, entry.name));
            } else {
                out.push_str(&format!(
                    "{}. **{}**: {}\n",
                    i + 1,
                    entry.name,
                    entry.description
                ));
            }
        }
        out.push_str(
            "\nReply \"approve\" to run this plan, describe changes to refine it, \
             or say \"start over\" for a new request.",
        );
        out
    }
}
