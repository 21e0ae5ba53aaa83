//! Planning collaborators: who writes the plan, how a reply is classified,
//! and how refinement feedback becomes plan edits.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::adapters::{strip_fences, ModelClient};
use crate::domain::{Plan, PlanEdit};

/// What the user meant by their reply to a presented plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIntent {
    Approve,
    Refine,
    StartOver,
    NewRequest,
}

/// Produces a plan for a request
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &str) -> Result<Plan>;
}

/// Classifies a reply to a presented (or approved) plan
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, message: &str, plan: Option<&Plan>) -> Result<UserIntent>;
}

/// Turns refinement feedback into plan edits
#[async_trait]
pub trait PlanEditor: Send + Sync {
    async fn edits(&self, plan: &Plan, feedback: &str) -> Result<Vec<PlanEdit>>;
}

const APPROVE_PHRASES: &[&str] = &[
    "approve",
    "approved",
    "yes",
    "ok",
    "okay",
    "looks good",
    "go ahead",
    "lgtm",
    "proceed",
    "run it",
];

const START_OVER_PHRASES: &[&str] = &[
    "start over",
    "new topic",
    "reset",
    "restart",
    "never mind",
    "nevermind",
    "something else",
];

/// Words allowed ahead of a start-over phrase ("let's", "ok", "please just")
const LEADING_FILLER: &[&str] = &["let", "lets", "s", "please", "ok", "okay", "just", "actually", "so", "no"];

/// Deterministic phrase-based classifier.
///
/// Phrases match whole words only. A start-over phrase must open the reply
/// (after filler like "let's"), so "remove the preset chart" stays feedback.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn normalize(message: &str) -> String {
        message
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == ' ' { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn opens_with_start_over(text: &str) -> bool {
        let words: Vec<&str> = text
            .split(' ')
            .skip_while(|w| LEADING_FILLER.contains(w))
            .collect();

        START_OVER_PHRASES.iter().any(|phrase| {
            let phrase: Vec<&str> = phrase.split(' ').collect();
            words.starts_with(&phrase)
        })
    }

    pub fn classify_text(message: &str) -> UserIntent {
        let text = Self::normalize(message);

        if Self::opens_with_start_over(&text) {
            return UserIntent::StartOver;
        }
        if APPROVE_PHRASES.contains(&text.as_str()) || text.starts_with("approve ") {
            return UserIntent::Approve;
        }
        UserIntent::Refine
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, message: &str, _plan: Option<&Plan>) -> Result<UserIntent> {
        Ok(Self::classify_text(message))
    }
}

fn parse_reply<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(strip_fences(text)).with_context(|| format!("Model returned an unreadable {}", what))
}

/// Planner backed by a model returning `{"title", "entries": [{"name", "description"}]}`
pub struct ModelPlanner {
    client: Arc<dyn ModelClient>,
    instruction: String,
}

impl ModelPlanner {
    pub fn new(client: Arc<dyn ModelClient>, instruction: impl Into<String>) -> Self {
        Self {
            client,
            instruction: instruction.into(),
        }
    }
}

#[async_trait]
impl Planner for ModelPlanner {
    async fn plan(&self, request: &str) -> Result<Plan> {
        let mut bindings = Map::new();
        bindings.insert("request".to_string(), Value::String(request.to_string()));

        let output = self.client.invoke(&self.instruction, &bindings).await?;
        match output.structured {
            Some(value) => serde_json::from_value(value).context("Model returned an unreadable plan"),
            None => parse_reply(&output.text, "plan"),
        }
    }
}

/// Classifier backed by a model returning `{"intent": "approve|refine|start_over|new_request"}`
pub struct ModelIntentClassifier {
    client: Arc<dyn ModelClient>,
    instruction: String,
}

impl ModelIntentClassifier {
    pub fn new(client: Arc<dyn ModelClient>, instruction: impl Into<String>) -> Self {
        Self {
            client,
            instruction: instruction.into(),
        }
    }
}

#[derive(Deserialize)]
struct IntentReply {
    intent: UserIntent,
}

#[async_trait]
impl IntentClassifier for ModelIntentClassifier {
    async fn classify(&self, message: &str, plan: Option<&Plan>) -> Result<UserIntent> {
        let mut bindings = Map::new();
        bindings.insert("message".to_string(), Value::String(message.to_string()));
        if let Some(plan) = plan {
            bindings.insert("plan".to_string(), serde_json::to_value(plan)?);
        }

        let output = self.client.invoke(&self.instruction, &bindings).await?;
        let reply: IntentReply = match output.structured {
            Some(value) => serde_json::from_value(value).context("Model returned an unreadable intent")?,
            None => {
                // Accept a bare label as well as the JSON object
                let label = strip_fences(&output.text).trim_matches('"').to_lowercase();
                match serde_json::from_value(json!({ "intent": label })) {
                    Ok(reply) => reply,
                    Err(_) => parse_reply(&output.text, "intent")?,
                }
            }
        };
        Ok(reply.intent)
    }
}

/// Editor backed by a model returning `{"edits": [...]}` or a bare edit list
pub struct ModelPlanEditor {
    client: Arc<dyn ModelClient>,
    instruction: String,
}

impl ModelPlanEditor {
    pub fn new(client: Arc<dyn ModelClient>, instruction: impl Into<String>) -> Self {
        Self {
            client,
            instruction: instruction.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EditsReply {
    Wrapped { edits: Vec<PlanEdit> },
    Bare(Vec<PlanEdit>),
}

#[async_trait]
impl PlanEditor for ModelPlanEditor {
    async fn edits(&self, plan: &Plan, feedback: &str) -> Result<Vec<PlanEdit>> {
        let mut bindings = Map::new();
        bindings.insert("plan".to_string(), serde_json::to_value(plan)?);
        bindings.insert("feedback".to_string(), Value::String(feedback.to_string()));

        let output = self.client.invoke(&self.instruction, &bindings).await?;
        let reply: EditsReply = match output.structured {
            Some(value) => serde_json::from_value(value).context("Model returned unreadable plan edits")?,
            None => parse_reply(&output.text, "plan edit list")?,
        };

        Ok(match reply {
            EditsReply::Wrapped { edits } | EditsReply::Bare(edits) => edits,
        })
    }
}
