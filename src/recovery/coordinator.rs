//! Recovery action resolution

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{
    CommandError, Precondition, PreconditionFailure, RecoveryAction, RecoveryActionKind,
    RecoveryConfig, RecoveryError, RecoveryOptions,
};
use crate::executor::ExecutorRequest;
use crate::lifecycle::{Batch, BatchState, CommandState};
use crate::model::{CommandId, CommandSpec};

/// One command sent back to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resubmission {
    /// Command to run again
    pub command_id: CommandId,
    /// Retry number for this command, starting at 1
    pub attempt: u32,
    /// Wait before resubmitting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
    /// Replacement parameters when a fix was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_override: Option<CommandSpec>,
    /// Suggested fix that produced the override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_id: Option<String>,
}

/// Local consequence of an accepted recovery action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum RecoveryEffect {
    /// Retry or fix: run the commands again
    Resubmit {
        action: RecoveryActionKind,
        options: RecoveryOptions,
        resubmissions: Vec<Resubmission>,
    },
    /// Commands marked skipped
    Skip { command_ids: Vec<CommandId> },
    /// Commands whose effects are reversed
    Rollback { command_ids: Vec<CommandId> },
    /// Stop the whole batch
    Abort,
}

impl RecoveryEffect {
    /// Action that produced the effect
    pub fn action(&self) -> RecoveryActionKind {
        match self {
            RecoveryEffect::Resubmit { action, .. } => *action,
            RecoveryEffect::Skip { .. } => RecoveryActionKind::Skip,
            RecoveryEffect::Rollback { .. } => RecoveryActionKind::Rollback,
            RecoveryEffect::Abort => RecoveryActionKind::Abort,
        }
    }

    /// Commands the effect touches
    pub fn command_ids(&self) -> Vec<CommandId> {
        match self {
            RecoveryEffect::Resubmit { resubmissions, .. } => {
                resubmissions.iter().map(|r| r.command_id.clone()).collect()
            }
            RecoveryEffect::Skip { command_ids } | RecoveryEffect::Rollback { command_ids } => {
                command_ids.clone()
            }
            RecoveryEffect::Abort => Vec::new(),
        }
    }
}

/// An applied action and the requests to forward to the executor
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// What changed locally
    pub effect: RecoveryEffect,
    /// Requests to forward to the executor
    pub requests: Vec<ExecutorRequest>,
}

/// Resolves operator recovery choices against a batch
#[derive(Debug, Clone, Default)]
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
}

impl RecoveryCoordinator {
    /// Coordinator with the given tuning
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Recovery tuning in use
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Actions the failure supports; `skip` and `abort` are always offered
    pub fn available_actions(&self, error: &CommandError) -> Vec<RecoveryAction> {
        let mut actions = Vec::with_capacity(5);
        if error.can_retry {
            actions.push(RecoveryAction::new(RecoveryActionKind::Retry));
        }
        if let Some(fix) = &error.suggested_fix {
            actions.push(RecoveryAction::fix(fix.clone()));
        }
        actions.push(RecoveryAction::new(RecoveryActionKind::Skip));
        if error.can_rollback {
            actions.push(RecoveryAction::new(RecoveryActionKind::Rollback));
        }
        actions.push(RecoveryAction::new(RecoveryActionKind::Abort));
        actions
    }

    /// Check an action against every selected command.
    ///
    /// Either every command meets the action's preconditions or the whole
    /// request is rejected with the list of failing commands.
    pub fn plan(
        &self,
        batch: &Batch,
        action: RecoveryActionKind,
        command_ids: &[CommandId],
        options: RecoveryOptions,
    ) -> Result<RecoveryEffect, RecoveryError> {
        if !matches!(batch.state(), BatchState::Executing | BatchState::PartiallyCompleted) {
            return Err(RecoveryError::BatchNotRecoverable(batch.state()));
        }

        if action.requires_confirmation() && !options.confirmed {
            return Err(RecoveryError::ConfirmationRequired(action));
        }

        if action == RecoveryActionKind::Abort {
            return Ok(RecoveryEffect::Abort);
        }

        let mut seen = HashSet::new();
        let ids: Vec<&CommandId> = command_ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        if ids.is_empty() {
            return Err(RecoveryError::NoCommands(action));
        }

        let mut failures = Vec::new();
        let mut resubmissions = Vec::new();

        for id in &ids {
            match self.check(batch, action, id) {
                Ok(resubmission) => resubmissions.extend(resubmission),
                Err(unmet) => failures.push(PreconditionFailure {
                    command_id: (*id).clone(),
                    unmet,
                }),
            }
        }

        if !failures.is_empty() {
            warn!(%action, rejected = failures.len(), "recovery action rejected");
            return Err(RecoveryError::PreconditionFailed { action, failures });
        }

        let ids: Vec<CommandId> = ids.into_iter().cloned().collect();
        Ok(match action {
            RecoveryActionKind::Retry | RecoveryActionKind::Fix => {
                for resubmission in &mut resubmissions {
                    if options.retry_with_backoff {
                        resubmission.delay = Some(self.config.retry_delay(resubmission.attempt));
                    }
                }
                RecoveryEffect::Resubmit {
                    action,
                    options,
                    resubmissions,
                }
            }
            RecoveryActionKind::Skip => RecoveryEffect::Skip { command_ids: ids },
            RecoveryActionKind::Rollback => RecoveryEffect::Rollback { command_ids: ids },
            RecoveryActionKind::Abort => RecoveryEffect::Abort,
        })
    }

    fn check(
        &self,
        batch: &Batch,
        action: RecoveryActionKind,
        id: &str,
    ) -> Result<Option<Resubmission>, Precondition> {
        let command = batch.command(id).ok_or(Precondition::UnknownCommand)?;
        let error = batch.active_error(id).ok_or(Precondition::NoActiveError)?;
        if batch.command_state(id) != Some(CommandState::Failed) {
            return Err(Precondition::NotFailed);
        }

        match action {
            RecoveryActionKind::Retry => {
                if !error.can_retry {
                    return Err(Precondition::NotRetryable);
                }
                Ok(Some(Resubmission {
                    command_id: id.to_string(),
                    attempt: error.retry_count + 1,
                    delay: None,
                    parameter_override: None,
                    fix_id: None,
                }))
            }
            RecoveryActionKind::Fix => {
                let fix = error.suggested_fix.as_ref().ok_or(Precondition::NoSuggestedFix)?;
                let patched = command
                    .spec
                    .with_overrides(&fix.parameter_overrides)
                    .map_err(|e| Precondition::InvalidFix(e.to_string()))?;
                patched
                    .check()
                    .map_err(|e| Precondition::InvalidFix(e.to_string()))?;
                Ok(Some(Resubmission {
                    command_id: id.to_string(),
                    attempt: error.retry_count + 1,
                    delay: None,
                    parameter_override: Some(patched),
                    fix_id: Some(fix.fix_id.clone()),
                }))
            }
            RecoveryActionKind::Rollback => {
                if !error.can_rollback {
                    return Err(Precondition::NotRollbackable);
                }
                Ok(None)
            }
            RecoveryActionKind::Skip | RecoveryActionKind::Abort => Ok(None),
        }
    }

    /// Plan an action and apply it to the batch
    #[instrument(skip(self, batch, command_ids), fields(batch_id = %batch.id(), commands = command_ids.len()))]
    pub fn apply(
        &self,
        batch: &mut Batch,
        action: RecoveryActionKind,
        command_ids: &[CommandId],
        options: RecoveryOptions,
    ) -> crate::Result<RecoveryOutcome> {
        let effect = self.plan(batch, action, command_ids, options)?;
        let requests = batch.apply_recovery(&effect)?;
        info!(%action, state = %batch.state(), "recovery action applied");
        Ok(RecoveryOutcome { effect, requests })
    }
}
