//! Failed-command records and operator recovery actions
//!
//! The [`RecoveryCoordinator`] decides which actions a failure supports and
//! turns an operator's choice into a [`RecoveryEffect`] that the batch
//! applies locally and forwards to the executor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::lifecycle::BatchState;
use crate::model::{CommandId, CommandType};

pub mod auto_fix;
pub mod backoff;
pub mod coordinator;

pub use auto_fix::{AutoFixReport, FixProgress, FixProgressCallback};
pub use backoff::{BackoffStrategy, RecoveryConfig};
pub use coordinator::{RecoveryCoordinator, RecoveryEffect, RecoveryOutcome, Resubmission};

/// Remediation descriptor attached to a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedFix {
    /// Stable fix identifier
    pub fix_id: String,
    /// Human-readable description
    pub description: String,
    /// Top-level parameter values replaced when the fix is applied
    #[serde(default)]
    pub parameter_overrides: serde_json::Map<String, Value>,
}

impl SuggestedFix {
    /// Fix without overrides
    pub fn new(fix_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            fix_id: fix_id.into(),
            description: description.into(),
            parameter_overrides: serde_json::Map::new(),
        }
    }

    /// Add a parameter override
    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameter_overrides.insert(key.into(), value);
        self
    }
}

/// Failure record for a single command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    /// Failed command
    pub command_id: CommandId,
    /// Type of the failed command
    pub command_type: CommandType,
    /// Error message
    pub error: String,
    /// Executor error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Structured error details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    /// Executor stack trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// When the executor observed the failure
    pub timestamp: DateTime<Utc>,
    /// Retries issued before this failure
    #[serde(default)]
    pub retry_count: u32,
    /// Whether a retry may succeed
    pub can_retry: bool,
    /// Whether the command's effects can be reversed
    pub can_rollback: bool,
    /// Fix proposed by the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<SuggestedFix>,
}

impl CommandError {
    /// Failure that is neither retryable nor reversible
    pub fn new(command_id: impl Into<String>, command_type: CommandType, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            command_type,
            error: error.into(),
            error_code: None,
            error_details: None,
            stack_trace: None,
            timestamp: Utc::now(),
            retry_count: 0,
            can_retry: false,
            can_rollback: false,
            suggested_fix: None,
        }
    }

    /// Mark the failure retryable
    pub fn retryable(mut self, can_retry: bool) -> Self {
        self.can_retry = can_retry;
        self
    }

    /// Mark the failure reversible
    pub fn rollbackable(mut self, can_rollback: bool) -> Self {
        self.can_rollback = can_rollback;
        self
    }

    /// Attach an error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Attach a suggested fix
    pub fn with_fix(mut self, fix: SuggestedFix) -> Self {
        self.suggested_fix = Some(fix);
        self
    }
}

/// Recovery action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    /// Run the command again
    Retry,
    /// Mark the command skipped
    Skip,
    /// Reverse the command's effects
    Rollback,
    /// Stop the batch
    Abort,
    /// Run again with the suggested fix applied
    Fix,
}

impl RecoveryActionKind {
    /// Whether the operator must confirm the action first
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, RecoveryActionKind::Rollback | RecoveryActionKind::Abort)
    }
}

impl fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryActionKind::Retry => "retry",
            RecoveryActionKind::Skip => "skip",
            RecoveryActionKind::Rollback => "rollback",
            RecoveryActionKind::Abort => "abort",
            RecoveryActionKind::Fix => "fix",
        };
        f.write_str(name)
    }
}

/// An action offered for a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    /// Action offered
    pub kind: RecoveryActionKind,
    /// Whether the operator must confirm it
    pub requires_confirmation: bool,
    /// Fix applied by a `fix` action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_script: Option<SuggestedFix>,
}

impl RecoveryAction {
    /// Action without a fix
    pub fn new(kind: RecoveryActionKind) -> Self {
        Self {
            kind,
            requires_confirmation: kind.requires_confirmation(),
            fix_script: None,
        }
    }

    /// Fix action for a suggested fix
    pub fn fix(script: SuggestedFix) -> Self {
        Self {
            fix_script: Some(script),
            ..Self::new(RecoveryActionKind::Fix)
        }
    }
}

/// Operator options for an action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOptions {
    /// Delay resubmission with exponential backoff
    #[serde(default)]
    pub retry_with_backoff: bool,
    /// Operator confirmed an action that requires it
    #[serde(default)]
    pub confirmed: bool,
}

impl RecoveryOptions {
    /// Options with confirmation given
    pub fn confirmed() -> Self {
        Self {
            confirmed: true,
            ..Default::default()
        }
    }

    /// Request backoff delays
    pub fn with_backoff(mut self) -> Self {
        self.retry_with_backoff = true;
        self
    }
}

/// Precondition a command failed for the requested action
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// Command not in the batch
    #[error("command is not part of the batch")]
    UnknownCommand,

    /// Command has no active failure
    #[error("command has no active error")]
    NoActiveError,

    /// Command is not in the failed state
    #[error("command is not in the failed state")]
    NotFailed,

    /// The failure is not retryable
    #[error("error is not retryable")]
    NotRetryable,

    /// The failure is not reversible
    #[error("error does not support rollback")]
    NotRollbackable,

    /// The failure carries no suggested fix
    #[error("error has no suggested fix")]
    NoSuggestedFix,

    /// The suggested fix does not produce valid parameters
    #[error("suggested fix does not fit the command parameters: {0}")]
    InvalidFix(String),
}

/// A command that failed a precondition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionFailure {
    /// Command that failed the check
    pub command_id: CommandId,
    /// Precondition it did not meet
    pub unmet: Precondition,
}

impl fmt::Display for PreconditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.command_id, self.unmet)
    }
}

/// Recovery request rejected before any state changed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    /// No commands were given
    #[error("no commands selected for {0}")]
    NoCommands(RecoveryActionKind),

    /// The action needs explicit confirmation
    #[error("{0} requires operator confirmation")]
    ConfirmationRequired(RecoveryActionKind),

    /// Some commands did not meet the action's preconditions
    #[error("{action} rejected: {}", .failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    PreconditionFailed {
        action: RecoveryActionKind,
        failures: Vec<PreconditionFailure>,
    },

    /// The batch state does not allow recovery
    #[error("batch in state {0} does not accept recovery actions")]
    BatchNotRecoverable(BatchState),
}

impl RecoveryError {
    /// Commands listed as failing a precondition
    pub fn failed_commands(&self) -> Vec<&str> {
        match self {
            RecoveryError::PreconditionFailed { failures, .. } => {
                failures.iter().map(|f| f.command_id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}
