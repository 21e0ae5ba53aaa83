//! Before/after hooks attached to stages.
//!
//! A hook inspects (and may mutate) the session state. Returning a
//! [`FinalResponse`] short-circuits the rest of the turn: nothing further
//! down the stage tree runs. Rejection and approval gating live here, never
//! in stage bodies.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::SessionState;

/// Response that ends the current turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResponse {
    /// Text shown to the user
    pub text: String,

    /// Why the turn ended
    pub kind: ResponseKind,
}

impl FinalResponse {
    pub fn new(kind: ResponseKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }

    pub fn rejection(text: impl Into<String>) -> Self {
        Self::new(ResponseKind::Rejection, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(ResponseKind::Info, text)
    }
}

/// Classification of a terminating response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Input out of scope or invalid
    Rejection,

    /// The plan is awaiting approval
    PendingApproval,

    /// A (new or refined) plan is being shown for approval
    PlanPresented,

    /// Informational stop (e.g. "start over" acknowledged)
    Info,

    /// Generic engine error
    Error,
}

/// A stage-entry or stage-exit hook
#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, state: &mut SessionState) -> Result<Option<FinalResponse>>;
}

#[async_trait]
impl<F> Callback for F
where
    F: Fn(&mut SessionState) -> Option<FinalResponse> + Send + Sync,
{
    async fn call(&self, state: &mut SessionState) -> Result<Option<FinalResponse>> {
        Ok(self(state))
    }
}

/// Runs several hooks in order; the first response wins
pub struct Chain {
    hooks: Vec<Arc<dyn Callback>>,
}

impl Chain {
    pub fn new(hooks: Vec<Arc<dyn Callback>>) -> Self {
        Self { hooks }
    }
}

#[async_trait]
impl Callback for Chain {
    async fn call(&self, state: &mut SessionState) -> Result<Option<FinalResponse>> {
        for hook in &self.hooks {
            if let Some(response) = hook.call(state).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

/// Before-hook: stop the turn if an upstream stage already rejected it.
///
/// Safe to attach at every stage boundary; it only reads the flag.
pub struct SkipIfRejected {
    flag_key: String,
    message: String,
}

impl SkipIfRejected {
    pub fn new(flag_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            flag_key: flag_key.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Callback for SkipIfRejected {
    async fn call(&self, state: &mut SessionState) -> Result<Option<FinalResponse>> {
        if state.get_bool(&self.flag_key) {
            return Ok(Some(FinalResponse::rejection(self.message.clone())));
        }
        Ok(None)
    }
}

/// Validator verdict written by an input-validation leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,

    #[serde(default)]
    pub reason: String,
}

/// After-hook: turn an invalid verdict into a rejection.
///
/// Sets `flag_key` so later [`SkipIfRejected`] hooks see it, then
/// terminates with the verdict's reason. A missing verdict is not a rejection.
pub struct RejectOnInvalid {
    verdict_key: String,
    flag_key: String,
}

impl RejectOnInvalid {
    pub fn new(verdict_key: impl Into<String>, flag_key: impl Into<String>) -> Self {
        Self {
            verdict_key: verdict_key.into(),
            flag_key: flag_key.into(),
        }
    }
}

#[async_trait]
impl Callback for RejectOnInvalid {
    async fn call(&self, state: &mut SessionState) -> Result<Option<FinalResponse>> {
        let verdict: Option<Verdict> = state.get_as(&self.verdict_key)?;
        match verdict {
            Some(verdict) if !verdict.valid => {
                info!(reason = %verdict.reason, "Input rejected");
                state.set(self.flag_key.clone(), true);
                let reason = if verdict.reason.is_empty() {
                    "this request is outside what I can help with".to_string()
                } else {
                    verdict.reason
                };
                Ok(Some(FinalResponse::rejection(format!(
                    "Sorry, I can't process this request: {}",
                    reason
                ))))
            }
            _ => Ok(None),
        }
    }
}
