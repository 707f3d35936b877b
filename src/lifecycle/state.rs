//! Batch and command states with the allowed batch transitions

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Created, not yet validated
    Pending,
    /// Definition under validation
    Validating,
    /// Handed to the executor, not yet started
    Queued,
    /// Commands are running
    Executing,
    /// Every command succeeded or was skipped
    Completed,
    /// Settled with unresolved failures
    PartiallyCompleted,
    /// Stopped by a halting failure
    Failed,
    /// Cancel requested; waiting for the executor to stop in-flight commands
    Cancelling,
    /// Stopped before finishing
    Cancelled,
    /// Succeeded commands are being reversed
    RollingBack,
    /// Every reversal finished
    RolledBack,
    /// Rollback stopped partway; needs manual resolution
    RollbackFailed,
}

impl BatchState {
    /// No further automatic transition happens from a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed
                | BatchState::Failed
                | BatchState::Cancelled
                | BatchState::RolledBack
                | BatchState::RollbackFailed
        )
    }

    /// Whether commands may still be running on the executor
    pub fn has_work_in_flight(&self) -> bool {
        matches!(
            self,
            BatchState::Executing | BatchState::RollingBack | BatchState::Cancelling
        )
    }

    /// Whether the batch accepts `from -> to`
    pub fn can_transition_to(&self, to: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (*self, to),
            (Pending, Validating)
                | (Pending, Cancelled)
                | (Validating, Queued)
                | (Validating, Failed)
                | (Validating, Pending)
                | (Validating, Cancelled)
                | (Queued, Executing)
                | (Queued, Cancelled)
                | (Executing, Completed)
                | (Executing, PartiallyCompleted)
                | (Executing, Failed)
                | (Executing, RollingBack)
                | (Executing, RolledBack)
                | (Executing, RollbackFailed)
                | (Executing, Cancelling)
                | (Executing, Cancelled)
                | (PartiallyCompleted, Executing)
                | (PartiallyCompleted, Completed)
                | (PartiallyCompleted, RollingBack)
                | (PartiallyCompleted, RolledBack)
                | (PartiallyCompleted, RollbackFailed)
                | (PartiallyCompleted, Cancelled)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
                | (RollingBack, Cancelling)
                | (Cancelling, Cancelled)
        )
    }

    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "pending",
            BatchState::Validating => "validating",
            BatchState::Queued => "queued",
            BatchState::Executing => "executing",
            BatchState::Completed => "completed",
            BatchState::PartiallyCompleted => "partially_completed",
            BatchState::Failed => "failed",
            BatchState::Cancelling => "cancelling",
            BatchState::Cancelled => "cancelled",
            BatchState::RollingBack => "rolling_back",
            BatchState::RolledBack => "rolled_back",
            BatchState::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-command execution state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommandState {
    /// Waiting to run
    Pending,
    /// Running, with the last reported progress
    Running { percent: f64 },
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Skipped by the operator
    Skipped,
    /// Reversal requested, waiting for the executor
    RollingBack,
    /// Effects reversed
    RolledBack,
    /// Stopped before finishing
    Cancelled,
}

impl CommandState {
    /// Executor events never move a command out of a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            CommandState::Pending | CommandState::Running { .. } | CommandState::RollingBack
        )
    }

    /// Whether the executor is still working on the command
    pub fn is_in_flight(&self) -> bool {
        matches!(self, CommandState::Running { .. } | CommandState::RollingBack)
    }

    /// Wire name of the state
    pub fn name(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Running { .. } => "running",
            CommandState::Succeeded => "succeeded",
            CommandState::Failed => "failed",
            CommandState::Skipped => "skipped",
            CommandState::RollingBack => "rolling_back",
            CommandState::RolledBack => "rolled_back",
            CommandState::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            BatchState::Pending,
            BatchState::Validating,
            BatchState::Queued,
            BatchState::Executing,
            BatchState::Completed,
            BatchState::PartiallyCompleted,
            BatchState::Failed,
            BatchState::Cancelling,
            BatchState::Cancelled,
            BatchState::RollingBack,
            BatchState::RolledBack,
            BatchState::RollbackFailed,
        ];

        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in &all {
                assert!(!from.can_transition_to(*to), "{} -> {} should be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_main_path() {
        assert!(BatchState::Pending.can_transition_to(BatchState::Validating));
        assert!(BatchState::Validating.can_transition_to(BatchState::Queued));
        assert!(BatchState::Queued.can_transition_to(BatchState::Executing));
        assert!(BatchState::Executing.can_transition_to(BatchState::Completed));
        assert!(!BatchState::Pending.can_transition_to(BatchState::Executing));
        assert!(!BatchState::Queued.can_transition_to(BatchState::RollingBack));
    }

    #[test]
    fn test_command_rollback_failure_exits() {
        assert!(BatchState::Executing.can_transition_to(BatchState::RollbackFailed));
        assert!(BatchState::PartiallyCompleted.can_transition_to(BatchState::RollbackFailed));
        assert!(!BatchState::Queued.can_transition_to(BatchState::RollbackFailed));
        assert!(!BatchState::Cancelling.can_transition_to(BatchState::RollbackFailed));
    }

    #[test]
    fn test_command_state_terminality() {
        assert!(!CommandState::Running { percent: 10.0 }.is_terminal());
        assert!(!CommandState::RollingBack.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(CommandState::Skipped.is_terminal());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&BatchState::PartiallyCompleted).unwrap(),
            "\"partially_completed\""
        );
        assert_eq!(BatchState::RolledBack.to_string(), "rolled_back");
    }
}
