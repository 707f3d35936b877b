//! Execution plan construction
//!
//! A plan is a pure function of the commands, their dependencies and the
//! requested execution mode. It can be rebuilt at any time before queuing.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{instrument, warn};

use super::{validator::order_violations, CommandGraph, GraphError};
use crate::model::{BatchConfiguration, Command, CommandId, Dependency, ExecutionMode};

/// Errors raised while building a plan
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// Levels cannot be computed for a cyclic graph
    #[error("cannot level a cyclic graph; unresolved commands: {}", .0.join(", "))]
    Cyclic(Vec<CommandId>),

    /// Graph construction failed
    #[error("graph error: {0}")]
    Graph(GraphError),
}

impl From<GraphError> for PlanError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CycleDetected(remaining) => PlanError::Cyclic(remaining),
            other => PlanError::Graph(other),
        }
    }
}

/// Non-fatal observations made while planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanWarning {
    /// A completion/success edge points backwards in declaration order
    OrderViolation {
        dependency_index: usize,
        from: CommandId,
        to: CommandId,
    },
    /// Parallel mode was requested but dependencies forced leveling
    DegradedToMixed { dependency_count: usize },
}

/// Commands with no ordering between them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Zero-based position in the plan
    pub index: usize,
    /// Commands that may start together
    pub commands: SmallVec<[CommandId; 8]>,
}

impl Stage {
    /// Number of commands in the stage
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the stage has no commands
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Split the stage into waves of at most `limit` commands
    pub fn waves(&self, limit: Option<usize>) -> Vec<&[CommandId]> {
        let size = limit.unwrap_or(self.commands.len()).max(1);
        self.commands.chunks(size).collect()
    }
}

/// Ordered stages handed to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Mode the configuration asked for
    pub requested_mode: ExecutionMode,
    /// Mode the plan was actually built with
    pub effective_mode: ExecutionMode,
    /// Stages in execution order
    pub stages: Vec<Stage>,
    /// Concurrency cap forwarded to the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_limit: Option<usize>,
    /// Planning notes, such as a mode fallback
    #[serde(default)]
    pub warnings: Vec<PlanWarning>,
}

impl ExecutionPlan {
    /// Total commands across all stages
    pub fn command_count(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    /// Stage index of a command
    pub fn stage_of(&self, id: &str) -> Option<usize> {
        self.stages
            .iter()
            .find(|s| s.commands.iter().any(|c| c == id))
            .map(|s| s.index)
    }

    /// Plain nested view of the stages
    pub fn levels(&self) -> Vec<Vec<CommandId>> {
        self.stages.iter().map(|s| s.commands.to_vec()).collect()
    }
}

/// Derives execution plans
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanBuilder;

impl PlanBuilder {
    /// Planner with default settings
    pub fn new() -> Self {
        Self
    }

    /// Build a plan honoring the configuration's mode and concurrency bound
    pub fn build_for(
        &self,
        commands: &[Command],
        dependencies: &[Dependency],
        configuration: &BatchConfiguration,
    ) -> Result<ExecutionPlan, PlanError> {
        let mut plan = self.build(commands, dependencies, configuration.execution_mode)?;
        if plan.effective_mode != ExecutionMode::Sequential {
            plan.parallel_limit = configuration.parallel_limit;
        }
        Ok(plan)
    }

    /// Build a plan for the given execution mode
    #[instrument(skip(self, commands, dependencies), fields(commands = commands.len()))]
    pub fn build(
        &self,
        commands: &[Command],
        dependencies: &[Dependency],
        mode: ExecutionMode,
    ) -> Result<ExecutionPlan, PlanError> {
        match mode {
            ExecutionMode::Sequential => Ok(Self::sequential(commands, dependencies)),
            ExecutionMode::Parallel if dependencies.is_empty() => Ok(ExecutionPlan {
                requested_mode: mode,
                effective_mode: ExecutionMode::Parallel,
                stages: if commands.is_empty() {
                    Vec::new()
                } else {
                    vec![Stage {
                        index: 0,
                        commands: commands.iter().map(|c| c.id.clone()).collect(),
                    }]
                },
                parallel_limit: None,
                warnings: Vec::new(),
            }),
            ExecutionMode::Parallel => {
                warn!(
                    dependencies = dependencies.len(),
                    "parallel mode with dependencies, leveling instead"
                );
                let mut plan = Self::leveled(commands, dependencies, mode)?;
                plan.warnings.push(PlanWarning::DegradedToMixed {
                    dependency_count: dependencies.len(),
                });
                Ok(plan)
            }
            ExecutionMode::Mixed => Self::leveled(commands, dependencies, mode),
        }
    }

    fn sequential(commands: &[Command], dependencies: &[Dependency]) -> ExecutionPlan {
        let warnings: Vec<PlanWarning> = order_violations(commands, dependencies)
            .into_iter()
            .map(|index| PlanWarning::OrderViolation {
                dependency_index: index,
                from: dependencies[index].from.clone(),
                to: dependencies[index].to.clone(),
            })
            .collect();

        if !warnings.is_empty() {
            warn!(count = warnings.len(), "declared order contradicts dependencies");
        }

        ExecutionPlan {
            requested_mode: ExecutionMode::Sequential,
            effective_mode: ExecutionMode::Sequential,
            stages: commands
                .iter()
                .enumerate()
                .map(|(index, c)| Stage {
                    index,
                    commands: SmallVec::from_elem(c.id.clone(), 1),
                })
                .collect(),
            parallel_limit: Some(1),
            warnings,
        }
    }

    fn leveled(
        commands: &[Command],
        dependencies: &[Dependency],
        requested: ExecutionMode,
    ) -> Result<ExecutionPlan, PlanError> {
        let (graph, _) = CommandGraph::build(commands, dependencies);
        let levels = graph.levels()?;

        Ok(ExecutionPlan {
            requested_mode: requested,
            effective_mode: ExecutionMode::Mixed,
            stages: levels
                .into_iter()
                .enumerate()
                .map(|(index, ids)| Stage {
                    index,
                    commands: SmallVec::from_vec(ids),
                })
                .collect(),
            parallel_limit: None,
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Dependency};

    fn abc() -> Vec<Command> {
        vec![Command::wait("A", 1), Command::wait("B", 1), Command::wait("C", 1)]
    }

    #[test]
    fn test_mixed_levels() {
        let plan = PlanBuilder::new()
            .build(&abc(), &[Dependency::completion("B", "C")], ExecutionMode::Mixed)
            .unwrap();

        assert_eq!(plan.levels(), vec![vec!["A".to_string(), "B".to_string()], vec!["C".to_string()]]);
        assert_eq!(plan.stage_of("C"), Some(1));
    }

    #[test]
    fn test_sequential_keeps_declaration_order() {
        let plan = PlanBuilder::new()
            .build(&abc(), &[Dependency::completion("C", "A")], ExecutionMode::Sequential)
            .unwrap();

        assert_eq!(plan.stages.len(), 3);
        assert_eq!(plan.stages[0].commands[0], "A");
        assert_eq!(
            plan.warnings,
            vec![PlanWarning::OrderViolation {
                dependency_index: 0,
                from: "C".into(),
                to: "A".into()
            }]
        );
    }

    #[test]
    fn test_parallel_without_dependencies_is_one_stage() {
        let plan = PlanBuilder::new().build(&abc(), &[], ExecutionMode::Parallel).unwrap();

        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.stages[0].len(), 3);
        assert_eq!(plan.effective_mode, ExecutionMode::Parallel);
    }

    #[test]
    fn test_parallel_with_dependencies_degrades() {
        let plan = PlanBuilder::new()
            .build(&abc(), &[Dependency::completion("A", "B")], ExecutionMode::Parallel)
            .unwrap();

        assert_eq!(plan.effective_mode, ExecutionMode::Mixed);
        assert_eq!(plan.stages.len(), 2);
        assert!(matches!(plan.warnings[0], PlanWarning::DegradedToMixed { dependency_count: 1 }));
    }

    #[test]
    fn test_cyclic_graph_is_rejected() {
        let deps = vec![Dependency::completion("A", "B"), Dependency::completion("B", "A")];
        let err = PlanBuilder::new().build(&abc(), &deps, ExecutionMode::Mixed).unwrap_err();

        assert!(matches!(err, PlanError::Cyclic(_)));
    }

    #[test]
    fn test_waves_respect_limit() {
        let plan = PlanBuilder::new().build(&abc(), &[], ExecutionMode::Parallel).unwrap();
        let waves = plan.stages[0].waves(Some(2));

        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 2);
        assert_eq!(waves[1].len(), 1);
    }

    #[test]
    fn test_build_for_carries_limit() {
        let config = BatchConfiguration::new("b")
            .with_execution_mode(ExecutionMode::Mixed)
            .with_parallel_limit(4);
        let plan = PlanBuilder::new().build_for(&abc(), &[], &config).unwrap();

        assert_eq!(plan.parallel_limit, Some(4));
    }
}
