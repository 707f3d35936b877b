//! Dependency edges between commands

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CommandId;

/// Kind of ordering constraint an edge expresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Target waits for the source to finish, whatever the outcome
    Completion,
    /// Target waits for the source to succeed
    Success,
    /// Target consumes the source's output
    Data,
    /// Target runs only when the condition holds over the source's result
    Conditional,
}

impl DependencyKind {
    /// Whether the edge constrains declaration order in a sequential plan
    pub fn orders_execution(&self) -> bool {
        matches!(self, DependencyKind::Completion | DependencyKind::Success)
    }
}

/// Directed edge `from -> to`: `to` depends on `from`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Prerequisite command
    pub from: CommandId,
    /// Dependent command
    pub to: CommandId,
    /// What the dependent waits for
    pub kind: DependencyKind,
    /// Condition evaluated by the executor for conditional edges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

impl Dependency {
    /// Edge of any kind
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
            condition: None,
        }
    }

    /// Completion edge
    pub fn completion(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, DependencyKind::Completion)
    }

    /// Success edge
    pub fn success(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, DependencyKind::Success)
    }

    /// Conditional edge with its condition payload
    pub fn conditional(from: impl Into<String>, to: impl Into<String>, condition: Value) -> Self {
        Self {
            condition: Some(condition),
            ..Self::new(from, to, DependencyKind::Conditional)
        }
    }
}
