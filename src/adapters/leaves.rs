//! Leaves backed by model and search collaborators.
//!
//! These are the fetchers placed inside `Parallel` stages: each reads what it
//! needs from state and writes exactly one output key.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{ModelClient, SearchClient};
use crate::core::stage::{Leaf, LeafOutput};
use crate::domain::SessionState;

/// Fill `{key}` placeholders from state.
///
/// String values are inserted as-is, other values as compact JSON. Unknown
/// placeholders are left untouched. Returns the text plus the bindings used.
pub fn render_instruction(template: &str, state: &SessionState) -> (String, Map<String, Value>) {
    let mut out = String::with_capacity(template.len());
    let mut bindings = Map::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return (out, bindings);
        };

        let key = &after[..close];
        match state.get(key).filter(|_| is_placeholder_key(key)) {
            Some(value) => {
                match value {
                    Value::String(text) => out.push_str(text),
                    other => out.push_str(&other.to_string()),
                }
                bindings.insert(key.to_string(), value.clone());
            }
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    (out, bindings)
}

fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'))
}

/// Strip a surrounding Markdown code fence, if any
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line
    let body = body.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Leaf invoking a model with a templated instruction
pub struct ModelLeaf {
    client: Arc<dyn ModelClient>,
    instruction: String,
    output_key: String,

    /// Parse the reply as JSON before storing it
    expect_json: bool,
}

impl ModelLeaf {
    pub fn new(
        client: Arc<dyn ModelClient>,
        instruction: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            instruction: instruction.into(),
            output_key: output_key.into(),
            expect_json: false,
        }
    }

    /// Store the reply as structured JSON instead of text
    pub fn json(mut self) -> Self {
        self.expect_json = true;
        self
    }

    pub fn output_key(&self) -> &str {
        &self.output_key
    }
}

#[async_trait]
impl Leaf for ModelLeaf {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        let (instruction, bindings) = render_instruction(&self.instruction, state);
        debug!(output_key = %self.output_key, bindings = bindings.len(), "Invoking model");

        let output = self.client.invoke(&instruction, &bindings).await?;

        let value = match (self.expect_json, output.structured) {
            (_, Some(structured)) => structured,
            (true, None) => serde_json::from_str(strip_fences(&output.text)).with_context(|| {
                format!("Model reply for '{}' is not valid JSON", self.output_key)
            })?,
            (false, None) => Value::String(output.text),
        };

        state.set(self.output_key.clone(), value);
        Ok(LeafOutput::done())
    }
}

/// Leaf running one search and storing the results
pub struct SearchLeaf {
    client: Arc<dyn SearchClient>,
    query_key: String,
    output_key: String,
    max_results: usize,
}

impl SearchLeaf {
    pub fn new(
        client: Arc<dyn SearchClient>,
        query_key: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            query_key: query_key.into(),
            output_key: output_key.into(),
            max_results: 10,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

#[async_trait]
impl Leaf for SearchLeaf {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        let query = match state.get_str(&self.query_key) {
            Some(query) if !query.trim().is_empty() => query.to_string(),
            _ => anyhow::bail!("No search query under state key '{}'", self.query_key),
        };

        let mut results = self.client.search(&query).await?;
        results.truncate(self.max_results);
        info!(query = %query, results = results.len(), "Search completed");

        state.set_as(self.output_key.clone(), &results)?;
        Ok(LeafOutput::message(format!("{} results", results.len())))
    }
}
