//! Batch lifecycle state machine
//!
//! A [`Batch`] owns its definition, its lifecycle state and its error
//! ledger. Executor events are applied idempotently and monotonically:
//! duplicates are ignored and no event moves a command out of a terminal
//! state. Every mutating operation returns the [`ExecutorRequest`]s the
//! caller should forward; the batch itself performs no I/O.
//!
//! [`ExecutorRequest`]: crate::executor::ExecutorRequest

use thiserror::Error;

pub mod batch;
pub mod state;

pub use batch::{Batch, BatchId, CommandRecord, QueueOutcome};
pub use state::{BatchState, CommandState};

/// Errors raised by lifecycle operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    /// The transition table forbids the move
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: BatchState, to: BatchState },

    /// The batch already finished
    #[error("Batch is already {0}")]
    AlreadyTerminal(BatchState),

    /// Recovery actions are not accepted in this state
    #[error("Batch in state {0} does not accept recovery actions")]
    NotRecoverable(BatchState),

    /// Id not present in the batch
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A command is not in the state the operation needs
    #[error("Command {command_id} is {actual}, expected {expected}")]
    UnexpectedCommandState {
        command_id: String,
        actual: &'static str,
        expected: &'static str,
    },
}
