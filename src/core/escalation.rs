//! Escalation checker: the leaf that ends a generation loop.
//!
//! Compares how many items were produced (length of a list key) with how
//! many were planned and escalates once the plan is fulfilled. With nothing
//! planned it never escalates, so the loop falls back to its iteration cap.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::stage::{Leaf, LeafOutput};
use crate::domain::SessionState;

/// Leaf comparing produced vs planned item counts
#[derive(Debug, Clone)]
pub struct EscalationChecker {
    /// List-typed key holding produced items
    generated_key: String,

    /// Key holding the plan (number, list, or object)
    planned_key: String,

    /// Array field read when the plan is an object
    planned_field: String,
}

impl EscalationChecker {
    pub fn new(generated_key: impl Into<String>, planned_key: impl Into<String>) -> Self {
        Self {
            generated_key: generated_key.into(),
            planned_key: planned_key.into(),
            planned_field: "items".to_string(),
        }
    }

    /// Read the planned list from this field when the plan is an object
    pub fn with_planned_field(mut self, field: impl Into<String>) -> Self {
        self.planned_field = field.into();
        self
    }

    pub fn generated_count(&self, state: &SessionState) -> usize {
        state.list_len(&self.generated_key)
    }

    /// Planned item count; anything unreadable counts as nothing planned
    pub fn planned_count(&self, state: &SessionState) -> usize {
        match state.get(&self.planned_key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
            Some(Value::Array(items)) => items.len(),
            Some(Value::Object(fields)) => fields
                .get(&self.planned_field)
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// `(message, escalate)` where escalate is `generated >= planned > 0`
    pub fn check(&self, state: &SessionState) -> (String, bool) {
        let generated = self.generated_count(state);
        let planned = self.planned_count(state);
        let escalate = planned > 0 && generated >= planned;

        let message = if escalate {
            format!("All {} planned items generated", planned)
        } else if planned == 0 {
            format!("{} items generated, nothing planned", generated)
        } else {
            format!("{} of {} planned items generated", generated, planned)
        };

        (message, escalate)
    }
}

#[async_trait]
impl Leaf for EscalationChecker {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        let (message, escalate) = self.check(state);
        debug!(escalate, %message, "Escalation check");
        Ok(LeafOutput {
            message: Some(message),
            escalate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checker() -> EscalationChecker {
        EscalationChecker::new("charts_generated", "chart_plan").with_planned_field("charts")
    }

    #[test]
    fn test_escalates_when_plan_fulfilled() {
        let mut state = SessionState::new();
        state.set("chart_plan", json!({"charts": ["a", "b"]}));
        state.set("charts_generated", json!([{}, {}]));

        let (message, escalate) = checker().check(&state);
        assert!(escalate);
        assert_eq!(message, "All 2 planned items generated");
    }

    #[test]
    fn test_not_done_yet() {
        let mut state = SessionState::new();
        state.set("chart_plan", json!({"charts": ["a", "b", "c"]}));
        state.set("charts_generated", json!([{}]));

        let (message, escalate) = checker().check(&state);
        assert!(!escalate);
        assert_eq!(message, "1 of 3 planned items generated");
    }

    #[test]
    fn test_nothing_planned_never_escalates() {
        let mut state = SessionState::new();
        state.set("charts_generated", json!([{}, {}, {}]));
        assert!(!checker().check(&state).1);

        state.set("chart_plan", json!(0));
        assert!(!checker().check(&state).1);

        state.set("chart_plan", json!("three"));
        assert!(!checker().check(&state).1);
    }

    #[test]
    fn test_planned_count_shapes() {
        let mut state = SessionState::new();
        let checker = EscalationChecker::new("done", "plan");

        state.set("plan", json!(4));
        assert_eq!(checker.planned_count(&state), 4);

        state.set("plan", json!(["x", "y"]));
        assert_eq!(checker.planned_count(&state), 2);

        state.set("plan", json!({"items": ["x"]}));
        assert_eq!(checker.planned_count(&state), 1);
    }

    #[tokio::test]
    async fn test_leaf_reports_escalate() {
        let mut state = SessionState::new();
        state.set("plan", json!(1));
        state.set("done", json!(["chart_1.png"]));

        let output = EscalationChecker::new("done", "plan")
            .run(&mut state)
            .await
            .unwrap();
        assert!(output.escalate);
    }
}
