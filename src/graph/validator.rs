//! Structural validation of a batch definition
//!
//! Validation never mutates its input and collects every violation instead
//! of stopping at the first one, so an editor can surface all problems at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use super::CommandGraph;
use crate::model::{BatchConfiguration, Command, CommandId, Dependency, DependencyKind, ParameterViolation};

/// A single definition-time problem
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Configuration has no name
    #[error("batch name is required")]
    MissingName,

    /// Batch has no commands
    #[error("batch has no commands")]
    EmptyBatch,

    /// A command's parameters break its schema
    #[error("command #{index} ({command_id}) has invalid parameters: {violation}")]
    PerCommandInvalid {
        index: usize,
        command_id: CommandId,
        violation: ParameterViolation,
    },

    /// Two commands share an id
    #[error("command #{index} reuses id {command_id}")]
    DuplicateCommandId { index: usize, command_id: CommandId },

    /// Dependency refers to a command that does not exist
    #[error("dependency #{index} references unknown command {missing}")]
    DanglingDependency { index: usize, missing: CommandId },

    /// Conditional dependency without a condition
    #[error("conditional dependency #{index} has no condition")]
    MissingCondition { index: usize },

    /// Dependencies form a cycle
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<CommandId> },
}

/// Outcome of validating a batch definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Every problem found, in discovery order
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    /// True when no violations were found
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Whether a cycle was among the violations
    pub fn has_cycle(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, Violation::CyclicDependency { .. }))
    }

    /// Indices of dependencies with an unknown endpoint
    pub fn dangling_dependencies(&self) -> Vec<usize> {
        self.violations
            .iter()
            .filter_map(|v| match v {
                Violation::DanglingDependency { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Indices of commands failing their parameter schema
    pub fn invalid_commands(&self) -> Vec<usize> {
        self.violations
            .iter()
            .filter_map(|v| match v {
                Violation::PerCommandInvalid { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }
}

/// Per-command-type parameter check
pub trait ParameterValidator: Send + Sync {
    fn validate(&self, command: &Command) -> Result<(), ParameterViolation>;
}

/// Checks each command against its own type's schema
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl ParameterValidator for SchemaValidator {
    fn validate(&self, command: &Command) -> Result<(), ParameterViolation> {
        command.spec.check()
    }
}

/// Validates commands, dependencies and configuration together
#[derive(Clone)]
pub struct GraphValidator {
    parameter_validator: Arc<dyn ParameterValidator>,
}

impl std::fmt::Debug for GraphValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphValidator")
            .field("parameter_validator", &"dyn ParameterValidator")
            .finish()
    }
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphValidator {
    /// Validator using the built-in parameter schemas
    pub fn new() -> Self {
        Self {
            parameter_validator: Arc::new(SchemaValidator),
        }
    }

    /// Replace the per-type parameter validator
    pub fn with_parameter_validator(mut self, validator: Arc<dyn ParameterValidator>) -> Self {
        self.parameter_validator = validator;
        self
    }

    /// Validate a candidate batch
    #[instrument(skip_all, fields(batch = %configuration.name, commands = commands.len(), dependencies = dependencies.len()))]
    pub fn validate(
        &self,
        commands: &[Command],
        dependencies: &[Dependency],
        configuration: &BatchConfiguration,
    ) -> ValidationReport {
        let mut violations = Vec::new();

        if configuration.name.trim().is_empty() {
            violations.push(Violation::MissingName);
        }

        if commands.is_empty() {
            violations.push(Violation::EmptyBatch);
        }

        let mut seen = HashSet::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            if !seen.insert(command.id.as_str()) {
                violations.push(Violation::DuplicateCommandId {
                    index,
                    command_id: command.id.clone(),
                });
            }
            if let Err(violation) = self.parameter_validator.validate(command) {
                violations.push(Violation::PerCommandInvalid {
                    index,
                    command_id: command.id.clone(),
                    violation,
                });
            }
        }

        let (graph, dangling) = CommandGraph::build(commands, dependencies);

        for index in dangling {
            let dep = &dependencies[index];
            let missing = if graph.contains(&dep.from) { &dep.to } else { &dep.from };
            violations.push(Violation::DanglingDependency {
                index,
                missing: missing.clone(),
            });
        }

        for (index, dep) in dependencies.iter().enumerate() {
            if dep.kind == DependencyKind::Conditional && dep.condition.is_none() {
                violations.push(Violation::MissingCondition { index });
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            violations.push(Violation::CyclicDependency { cycle });
        }

        debug!(violations = violations.len(), "batch validation finished");
        ValidationReport { violations }
    }
}

/// Indices of ordering dependencies whose source is declared after its target.
///
/// Only `completion` and `success` edges constrain a sequential plan.
pub fn order_violations(commands: &[Command], dependencies: &[Dependency]) -> Vec<usize> {
    let position: HashMap<&str, usize> = commands
        .iter()
        .enumerate()
        .rev()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();

    dependencies
        .iter()
        .enumerate()
        .filter(|(_, dep)| dep.kind.orders_execution())
        .filter_map(|(index, dep)| {
            let from = position.get(dep.from.as_str())?;
            let to = position.get(dep.to.as_str())?;
            (from >= to).then_some(index)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Dependency};
    use serde_json::json;

    fn config() -> BatchConfiguration {
        BatchConfiguration::new("batch")
    }

    #[test]
    fn test_collects_all_violations() {
        let commands = vec![Command::shell("a", ""), Command::wait("a", 5)];
        let deps = vec![Dependency::completion("a", "ghost")];

        let report = GraphValidator::new().validate(&commands, &deps, &BatchConfiguration::default());

        assert!(report.violations.contains(&Violation::MissingName));
        assert_eq!(report.invalid_commands(), vec![0]);
        assert_eq!(report.dangling_dependencies(), vec![0]);
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, Violation::DuplicateCommandId { index: 1, .. })));
    }

    #[test]
    fn test_empty_batch() {
        let report = GraphValidator::new().validate(&[], &[], &config());
        assert_eq!(report.violations, vec![Violation::EmptyBatch]);
    }

    #[test]
    fn test_conditional_requires_condition() {
        let commands = vec![Command::wait("a", 5), Command::wait("b", 5)];
        let mut bare = Dependency::conditional("a", "b", json!({"exit_code": 0}));
        bare.condition = None;

        let report = GraphValidator::new().validate(&commands, &[bare], &config());
        assert_eq!(report.violations, vec![Violation::MissingCondition { index: 0 }]);
    }

    struct RejectAll;

    impl ParameterValidator for RejectAll {
        fn validate(&self, _command: &Command) -> Result<(), ParameterViolation> {
            Err(ParameterViolation::Missing("anything".into()))
        }
    }

    #[test]
    fn test_custom_parameter_validator() {
        let commands = vec![Command::wait("a", 5), Command::wait("b", 5)];
        let validator = GraphValidator::new().with_parameter_validator(Arc::new(RejectAll));

        let report = validator.validate(&commands, &[], &config());
        assert_eq!(report.invalid_commands(), vec![0, 1]);
    }

    #[test]
    fn test_order_violations() {
        let commands = vec![Command::wait("a", 1), Command::wait("b", 1), Command::wait("c", 1)];
        let deps = vec![
            Dependency::completion("a", "b"),
            Dependency::success("c", "a"),
            Dependency::new("c", "b", DependencyKind::Data),
        ];

        assert_eq!(order_violations(&commands, &deps), vec![1]);
    }
}
