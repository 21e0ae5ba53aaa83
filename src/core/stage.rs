//! Stage definitions.
//!
//! A stage tree is built from four variants: `Leaf` (one unit of work),
//! `Sequential`, `Parallel`, and `Loop`. Any stage may carry a `before`
//! and an `after` hook.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::callbacks::Callback;
use crate::domain::SessionState;

/// What a leaf reports back to the executor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafOutput {
    /// Optional human-readable message (logged, not shown to the user)
    pub message: Option<String>,

    /// Ask the enclosing loop to stop iterating
    pub escalate: bool,
}

impl LeafOutput {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            escalate: false,
        }
    }

    pub fn escalate(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            escalate: true,
        }
    }
}

/// A unit of work that reads and writes session state
#[async_trait]
pub trait Leaf: Send + Sync {
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput>;
}

/// Leaf backed by a synchronous closure
pub struct FnLeaf<F> {
    f: F,
}

impl<F> FnLeaf<F>
where
    F: Fn(&mut SessionState) -> Result<LeafOutput> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Leaf for FnLeaf<F>
where
    F: Fn(&mut SessionState) -> Result<LeafOutput> + Send + Sync,
{
    async fn run(&self, state: &mut SessionState) -> Result<LeafOutput> {
        (self.f)(state)
    }
}

/// The four stage variants
#[derive(Clone)]
pub enum StageKind {
    Leaf(Arc<dyn Leaf>),

    /// Children run strictly in order
    Sequential(Vec<Stage>),

    /// Children run concurrently and are always joined
    Parallel(Vec<Stage>),

    /// Children run in order, repeated up to `max_iterations` times
    Loop {
        children: Vec<Stage>,
        max_iterations: u32,
    },
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "leaf",
            Self::Sequential(_) => "sequential",
            Self::Parallel(_) => "parallel",
            Self::Loop { .. } => "loop",
        }
    }
}

/// A node in the stage tree
#[derive(Clone)]
pub struct Stage {
    /// Stage name (used in logs and events)
    pub name: String,

    pub kind: StageKind,

    /// Runs before the body; a response skips the body and ends the turn
    pub before: Option<Arc<dyn Callback>>,

    /// Runs after the body; a response replaces its output and ends the turn
    pub after: Option<Arc<dyn Callback>>,
}

impl Stage {
    fn with_kind(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            before: None,
            after: None,
        }
    }

    pub fn leaf(name: impl Into<String>, leaf: impl Leaf + 'static) -> Self {
        Self::with_kind(name, StageKind::Leaf(Arc::new(leaf)))
    }

    /// Leaf from a closure
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut SessionState) -> Result<LeafOutput> + Send + Sync + 'static,
    {
        Self::leaf(name, FnLeaf::new(f))
    }

    pub fn sequential(name: impl Into<String>, children: Vec<Stage>) -> Self {
        Self::with_kind(name, StageKind::Sequential(children))
    }

    pub fn parallel(name: impl Into<String>, children: Vec<Stage>) -> Self {
        Self::with_kind(name, StageKind::Parallel(children))
    }

    pub fn looped(name: impl Into<String>, children: Vec<Stage>, max_iterations: u32) -> Self {
        Self::with_kind(
            name,
            StageKind::Loop {
                children,
                max_iterations,
            },
        )
    }

    pub fn with_before(mut self, hook: impl Callback + 'static) -> Self {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn with_after(mut self, hook: impl Callback + 'static) -> Self {
        self.after = Some(Arc::new(hook));
        self
    }

    /// Child stages (empty for leaves)
    pub fn children(&self) -> &[Stage] {
        match &self.kind {
            StageKind::Leaf(_) => &[],
            StageKind::Sequential(children) | StageKind::Parallel(children) => children,
            StageKind::Loop { children, .. } => children,
        }
    }

    /// Find a stage by name anywhere in the tree
    pub fn find(&self, name: &str) -> Option<&Stage> {
        if self.name == name {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(name))
    }

    /// Indented outline of the tree
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        let mut line = format!("{}{} [{}", "  ".repeat(depth), self.name, self.kind.label());
        if let StageKind::Loop { max_iterations, .. } = &self.kind {
            line.push_str(&format!(" x{}", max_iterations));
        }
        line.push(']');
        if self.before.is_some() {
            line.push_str(" +before");
        }
        if self.after.is_some() {
            line.push_str(" +after");
        }
        out.push_str(&line);
        out.push('\n');
        for child in self.children() {
            child.describe_into(out, depth + 1);
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("children", &self.children())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::callbacks::FinalResponse;

    fn noop(name: &str) -> Stage {
        Stage::from_fn(name, |_| Ok(LeafOutput::done()))
    }

    #[test]
    fn test_describe_tree() {
        let tree = Stage::sequential(
            "root",
            vec![
                Stage::parallel("fetch", vec![noop("news"), noop("stats")]),
                Stage::looped("charts", vec![noop("draw")], 5).with_after(
                    |_: &mut SessionState| -> Option<FinalResponse> { None },
                ),
            ],
        );

        let outline = tree.describe();
        assert!(outline.starts_with("root [sequential]\n"));
        assert!(outline.contains("  fetch [parallel]\n"));
        assert!(outline.contains("    news [leaf]\n"));
        assert!(outline.contains("  charts [loop x5] +after\n"));
    }

    #[test]
    fn test_find_stage() {
        let tree = Stage::sequential("root", vec![Stage::parallel("fetch", vec![noop("news")])]);
        assert!(tree.find("news").is_some());
        assert!(tree.find("missing").is_none());
        assert!(noop("leaf").children().is_empty());
    }

    #[tokio::test]
    async fn test_fn_leaf_runs_closure() {
        let leaf = FnLeaf::new(|state: &mut SessionState| {
            state.set("out", 42);
            Ok(LeafOutput::escalate("done"))
        });
        let mut state = SessionState::new();
        let output = leaf.run(&mut state).await.unwrap();
        assert!(output.escalate);
        assert_eq!(state.get_u64("out"), Some(42));
    }
}
