//! # cmdbatch
//!
//! Planning and lifecycle core for batches of operator commands.
//!
//! A batch is a directed graph of commands joined by dependency edges plus a
//! configuration that picks an execution mode and a transaction policy. This
//! crate validates the graph, turns it into an ordered execution plan, tracks
//! the batch through its lifecycle as executor events arrive, and resolves
//! operator recovery actions for failed commands. Running the commands is left
//! to an external [`executor::BatchExecutor`].
//!
//! ## Quick Start
//!
//! ```rust
//! use cmdbatch::graph::{GraphValidator, PlanBuilder};
//! use cmdbatch::lifecycle::{Batch, BatchState};
//! use cmdbatch::executor::ExecutorEvent;
//! use cmdbatch::model::{BatchConfiguration, BatchDraft, Command, ExecutionMode};
//!
//! # fn example() -> cmdbatch::Result<()> {
//! let draft = BatchDraft::new("deploy")
//!     .add_command(Command::shell("build", "make"))
//!     .add_command(Command::wait("settle", 1_000))
//!     .depend("build", "settle")
//!     .with_configuration(BatchConfiguration::new("deploy").with_execution_mode(ExecutionMode::Mixed));
//!
//! let mut batch = Batch::new(draft);
//! let outcome = batch.queue(&GraphValidator::new(), &PlanBuilder::new())?;
//! assert!(outcome.is_queued());
//!
//! batch.apply_event(ExecutorEvent::succeeded("build"));
//! batch.apply_event(ExecutorEvent::succeeded("settle"));
//! assert_eq!(batch.state(), BatchState::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`model`]: commands, dependencies, configuration and the draft builder
//! - [`graph`]: dependency graph, validation and plan building
//! - [`lifecycle`]: batch state machine and event ingestion
//! - [`recovery`]: failure records, recovery actions and bulk auto-fix
//! - [`status`]: derived batch metrics
//! - [`executor`]: boundary to the external executor
//! - [`document`]: export/import documents and templates
//! - [`registry`]: concurrent map of live batches

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for batch operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Main error type for batch operations
#[derive(Error, Debug)]
pub enum BatchError {
    /// Definition rejected by validation
    #[error("Batch definition is invalid ({} violations)", .0.violations.len())]
    Definition(graph::ValidationReport),

    /// Graph-specific errors
    #[error("Graph error: {0}")]
    Graph(#[from] graph::GraphError),

    /// Plan construction errors
    #[error("Plan error: {0}")]
    Plan(#[from] graph::plan::PlanError),

    /// Invalid lifecycle operation
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] lifecycle::LifecycleError),

    /// Recovery action rejected
    #[error("Recovery error: {0}")]
    Recovery(#[from] recovery::RecoveryError),

    /// Executor reported a failure
    #[error("Executor error: {0}")]
    Executor(#[from] executor::ExecutorError),

    /// Document or template error
    #[error("Document error: {0}")]
    Document(#[from] document::DocumentError),

    /// Registry lookup error
    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rollback stopped partway; the batch needs manual resolution
    #[error("Rollback of batch {batch_id} is stuck: {reason}")]
    StuckRollback {
        batch_id: lifecycle::BatchId,
        reason: String,
    },
}

/// Batch data model
pub mod model;

/// Dependency graph, validation and planning
pub mod graph;

/// Batch lifecycle state machine
pub mod lifecycle;

/// Failure records and recovery actions
pub mod recovery;

/// Batch status aggregation
pub mod status;

/// External executor boundary
pub mod executor;

/// Document export/import and templates
pub mod document;

/// Registry of live batches
pub mod registry;

pub use graph::{ExecutionPlan, GraphValidator, PlanBuilder, ValidationReport};
pub use lifecycle::{Batch, BatchId, BatchState, CommandState};
pub use model::{BatchConfiguration, BatchDraft, Command, Dependency};
pub use recovery::{CommandError, RecoveryCoordinator};
pub use status::{BatchStatus, StatusAggregator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_errors_convert() {
        let err: BatchError = lifecycle::LifecycleError::AlreadyTerminal(BatchState::Completed).into();
        assert!(matches!(err, BatchError::Lifecycle(_)));
        assert_eq!(err.to_string(), "Lifecycle error: Batch is already completed");
    }

    #[test]
    fn test_definition_error_counts_violations() {
        let report = GraphValidator::new().validate(&[], &[], &BatchConfiguration::default());
        let err = BatchError::Definition(report);
        assert!(err.to_string().contains("2 violations"));
    }
}
