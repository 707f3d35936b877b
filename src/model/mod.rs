//! Batch data model
//!
//! Commands, dependency edges and batch configuration, plus the
//! [`BatchDraft`] builder an operator edits before finalizing a batch.

pub mod command;
pub mod config;
pub mod dependency;

pub use command::{
    Command, CommandId, CommandMetadata, CommandSpec, CommandType, CustomParams,
    FileTransferParams, HttpRequestParams, ParameterViolation, Priority, ScriptParams,
    ShellParams, WaitParams,
};
pub use config::{BatchConfiguration, ExecutionMode, TransactionMode};
pub use dependency::{Dependency, DependencyKind};

use serde::{Deserialize, Serialize};

/// Mutable batch definition prior to finalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDraft {
    /// Commands in declaration order
    pub commands: Vec<Command>,
    /// Dependency edges
    pub dependencies: Vec<Dependency>,
    /// Batch policy
    pub configuration: BatchConfiguration,
}

impl BatchDraft {
    /// Start a draft with the given batch name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            commands: Vec::new(),
            dependencies: Vec::new(),
            configuration: BatchConfiguration::new(name),
        }
    }

    /// Append a command
    pub fn add_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Append a dependency edge
    pub fn add_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Append a completion edge `from -> to`
    pub fn depend(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_dependency(Dependency::completion(from, to))
    }

    /// Replace the configuration
    pub fn with_configuration(mut self, configuration: BatchConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Remove a command and every edge touching it
    pub fn remove_command(&mut self, id: &str) -> Option<Command> {
        let position = self.commands.iter().position(|c| c.id == id)?;
        self.dependencies.retain(|d| d.from != id && d.to != id);
        Some(self.commands.remove(position))
    }

    /// Command by id
    pub fn command(&self, id: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_command_drops_edges() {
        let mut draft = BatchDraft::new("deploy")
            .add_command(Command::wait("a", 1))
            .add_command(Command::wait("b", 1))
            .add_command(Command::wait("c", 1))
            .depend("a", "b")
            .depend("b", "c");

        let removed = draft.remove_command("b");

        assert!(removed.is_some());
        assert_eq!(draft.commands.len(), 2);
        assert!(draft.dependencies.is_empty());
    }
}
