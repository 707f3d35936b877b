//! Messages exchanged with the external executor

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::ExecutionPlan;
use crate::lifecycle::{BatchId, BatchState};
use crate::model::{BatchConfiguration, Command, CommandId, Dependency};
use crate::recovery::{CommandError, RecoveryActionKind, RecoveryOptions, Resubmission};

/// A validated batch handed over for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmission {
    /// Batch being submitted
    pub batch_id: BatchId,
    /// Every command of the batch
    pub commands: Vec<Command>,
    /// Dependency edges
    pub dependencies: Vec<Dependency>,
    /// Staged execution plan
    pub plan: ExecutionPlan,
    /// Policy the executor applies
    pub configuration: BatchConfiguration,
}

/// Operator or automatic recovery forwarded to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    /// Batch the request belongs to
    pub batch_id: BatchId,
    /// Action to perform
    pub action: RecoveryActionKind,
    /// Commands the action targets
    pub command_ids: Vec<CommandId>,
    /// Confirmation and backoff options
    #[serde(default)]
    pub options: RecoveryOptions,
    /// Retry/fix details, one per command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resubmissions: Vec<Resubmission>,
}

/// Ask the executor to stop the batch's in-flight commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Batch to stop
    pub batch_id: BatchId,
    /// Why the batch is cancelled
    pub reason: String,
}

/// Outbound message produced by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ExecutorRequest {
    /// Submit a queued batch
    Submit(BatchSubmission),
    /// Run a recovery action
    Recovery(RecoveryRequest),
    /// Stop a batch
    Cancel(CancelRequest),
}

impl ExecutorRequest {
    /// Batch targeted by the request
    pub fn batch_id(&self) -> BatchId {
        match self {
            ExecutorRequest::Submit(s) => s.batch_id,
            ExecutorRequest::Recovery(r) => r.batch_id,
            ExecutorRequest::Cancel(c) => c.batch_id,
        }
    }
}

/// Inbound event reported by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutorEvent {
    /// The executor accepted the submitted plan
    Accepted,
    /// A command began running
    CommandStarted { command_id: CommandId },
    /// Progress report for a running command
    CommandProgress { command_id: CommandId, percent: f64 },
    /// A command finished successfully
    CommandSucceeded {
        command_id: CommandId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    /// A command failed
    CommandFailed { error: CommandError },
    /// A command's effects were reversed
    CommandRolledBack { command_id: CommandId },
    /// Every pending reversal finished
    RollbackCompleted,
    /// Reversal could not finish
    RollbackFailed { reason: String },
    /// The executor stopped the batch
    CancelConfirmed,
    /// Batch-level status snapshot
    Status { state: BatchState },
}

impl ExecutorEvent {
    /// Command the event refers to, if any
    pub fn command_id(&self) -> Option<&str> {
        match self {
            ExecutorEvent::CommandStarted { command_id }
            | ExecutorEvent::CommandProgress { command_id, .. }
            | ExecutorEvent::CommandSucceeded { command_id, .. }
            | ExecutorEvent::CommandRolledBack { command_id } => Some(command_id),
            ExecutorEvent::CommandFailed { error } => Some(&error.command_id),
            _ => None,
        }
    }

    /// Success event without output
    pub fn succeeded(command_id: impl Into<String>) -> Self {
        ExecutorEvent::CommandSucceeded {
            command_id: command_id.into(),
            output: None,
        }
    }

    /// Failure event
    pub fn failed(error: CommandError) -> Self {
        ExecutorEvent::CommandFailed { error }
    }

    /// Reversal confirmation for one command
    pub fn rolled_back(command_id: impl Into<String>) -> Self {
        ExecutorEvent::CommandRolledBack {
            command_id: command_id.into(),
        }
    }
}
