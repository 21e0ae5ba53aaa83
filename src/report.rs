//! Report assembly: literal placeholder substitution into a template.
//!
//! Artifacts are embedded as `data:` URIs under `{{artifact_N}}` placeholders.
//! Placeholders left without a value stay in the text and are reported back,
//! which is a cosmetic defect rather than an error.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::stage::{Leaf, LeafOutput};
use crate::domain::{Artifact, SessionState};

/// Assembled report text plus the placeholders nothing filled
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assembly {
    pub text: String,
    pub unmatched: Vec<String>,
}

/// Replace each placeholder with its value, in order
pub fn assemble<P, V>(template: &str, substitutions: &[(P, V)]) -> Assembly
where
    P: AsRef<str>,
    V: AsRef<str>,
{
    let mut text = template.to_string();
    for (placeholder, value) in substitutions {
        let placeholder = placeholder.as_ref();
        if placeholder.is_empty() {
            continue;
        }
        text = text.replace(placeholder, value.as_ref());
    }

    let unmatched = unmatched_placeholders(&text);
    Assembly { text, unmatched }
}

/// Every `{{...}}` token still present, in order of first appearance
fn unmatched_placeholders(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        let token = format!("{{{{{}}}}}", &after[..close]);
        if !found.contains(&token) {
            found.push(token);
        }
        rest = &after[close + 2..];
    }

    found
}

/// Placeholder for the artifact at 1-based `index`
pub fn artifact_placeholder(index: usize) -> String {
    format!("{{{{artifact_{}}}}}", index)
}

/// `({{artifact_N}}, data URI)` pairs for successfully extracted artifacts
pub fn artifact_substitutions(artifacts: &[Artifact]) -> Vec<(String, String)> {
    artifacts
        .iter()
        .filter(|a| a.is_extracted())
        .map(|a| (artifact_placeholder(a.index), a.data_uri()))
        .collect()
}

/// Final leaf: fills the report template with the recorded artifacts
pub struct ReportLeaf {
    template_key: String,
    records_key: String,
    output_key: String,
}

impl ReportLeaf {
    pub fn new(
        template_key: impl Into<String>,
        records_key: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            template_key: template_key.into(),
            records_key: records_key.into(),
            output_key: output_key.into(),
        }
    }
}

#[async_trait]
impl Leaf for ReportLeaf {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        let template = match state.get_str(&self.template_key) {
            Some(template) => template.to_string(),
            None => anyhow::bail!("No report template under state key '{}'", self.template_key),
        };
        let artifacts: Vec<Artifact> = state.get_as(&self.records_key)?.unwrap_or_default();

        let assembly = assemble(&template, &artifact_substitutions(&artifacts));
        if !assembly.unmatched.is_empty() {
            warn!(unmatched = ?assembly.unmatched, "Report has unfilled placeholders");
        }
        info!(
            artifacts = artifacts.len(),
            bytes = assembly.text.len(),
            "Report assembled"
        );

        state.set(self.output_key.clone(), assembly.text);
        Ok(LeafOutput::message(format!(
            "{} placeholders unmatched",
            assembly.unmatched.len()
        )))
    }
}
