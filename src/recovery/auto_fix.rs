//! Bulk application of suggested fixes

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{RecoveryActionKind, RecoveryCoordinator, RecoveryOptions};
use crate::executor::{BatchExecutor, ExecutorRequest};
use crate::lifecycle::{Batch, CommandState};
use crate::model::CommandId;
use crate::BatchError;

/// Progress notification emitted after each fix attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixProgress {
    /// Command the fix was applied to
    pub command_id: CommandId,
    /// Fixes applied so far, including this one
    pub completed: usize,
    /// Fixable commands when the run started
    pub total: usize,
    /// Whether the fixed command succeeded
    pub succeeded: bool,
}

impl FixProgress {
    /// Share of fixes applied so far, as a percentage
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}

/// Callback invoked with fix progress
pub type FixProgressCallback = Box<dyn Fn(FixProgress) + Send + Sync>;

/// Summary of an auto-fix run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoFixReport {
    /// Failures that carried a suggested fix when the run started
    pub total_fixable: usize,
    /// Fixes dispatched to the executor
    pub fixes_applied: usize,
    /// Fixed commands that then succeeded
    pub succeeded: Vec<CommandId>,
    /// Fixed commands that failed again
    pub failed: Vec<CommandId>,
    /// Fixes refused by precondition checks
    pub rejected: Vec<CommandId>,
    /// The run stopped on the interrupt flag
    pub interrupted: bool,
}

impl AutoFixReport {
    /// `fixes_applied / total_fixable` as a percentage
    pub fn progress(&self) -> f64 {
        if self.total_fixable == 0 {
            100.0
        } else {
            self.fixes_applied as f64 / self.total_fixable as f64 * 100.0
        }
    }
}

/// Commands whose active error carries a suggested fix
pub fn fixable_commands(batch: &Batch) -> Vec<CommandId> {
    batch
        .active_errors()
        .iter()
        .filter(|e| e.suggested_fix.is_some())
        .filter(|e| batch.command_state(&e.command_id) == Some(CommandState::Failed))
        .map(|e| e.command_id.clone())
        .collect()
}

/// Apply every suggested fix one at a time.
///
/// Each fix is dispatched and its reported events are applied before the
/// next one starts. Setting `interrupt` stops the run between fixes; fixes
/// already applied are kept.
#[instrument(skip_all, fields(batch_id = %batch.id()))]
pub async fn auto_fix_all(
    coordinator: &RecoveryCoordinator,
    batch: &mut Batch,
    executor: &dyn BatchExecutor,
    interrupt: Option<&AtomicBool>,
    progress: Option<&FixProgressCallback>,
) -> crate::Result<AutoFixReport> {
    let targets = fixable_commands(batch);
    let mut report = AutoFixReport {
        total_fixable: targets.len(),
        ..Default::default()
    };
    info!(fixable = targets.len(), "starting auto-fix");

    for (position, command_id) in targets.iter().enumerate() {
        if interrupt.map_or(false, |flag| flag.load(Ordering::SeqCst)) {
            warn!(remaining = targets.len() - position, "auto-fix interrupted");
            report.interrupted = true;
            break;
        }

        let outcome = match coordinator.apply(
            batch,
            RecoveryActionKind::Fix,
            std::slice::from_ref(command_id),
            RecoveryOptions::default(),
        ) {
            Ok(outcome) => outcome,
            Err(BatchError::Recovery(err)) => {
                debug!(command_id = %command_id, error = %err, "fix rejected");
                report.rejected.push(command_id.clone());
                continue;
            }
            Err(err) => return Err(err),
        };
        report.fixes_applied += 1;

        drive(batch, executor, outcome.requests).await?;

        let succeeded = batch.command_state(command_id) == Some(CommandState::Succeeded);
        if succeeded {
            report.succeeded.push(command_id.clone());
        } else {
            report.failed.push(command_id.clone());
        }

        if let Some(callback) = progress {
            callback(FixProgress {
                command_id: command_id.clone(),
                completed: report.fixes_applied,
                total: targets.len(),
                succeeded,
            });
        }
    }

    info!(
        applied = report.fixes_applied,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "auto-fix finished"
    );
    Ok(report)
}

/// Dispatch requests and feed the reported events back into the batch
async fn drive(
    batch: &mut Batch,
    executor: &dyn BatchExecutor,
    requests: Vec<ExecutorRequest>,
) -> crate::Result<()> {
    let mut queue: VecDeque<ExecutorRequest> = requests.into();
    while let Some(request) = queue.pop_front() {
        let events = executor.dispatch(request).await?;
        for event in events {
            queue.extend(batch.apply_event(event));
        }
    }
    Ok(())
}
