//! Batch-level metrics derived from per-command state

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::{Batch, BatchId, BatchState, CommandState};

/// Point-in-time summary of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Batch summarized
    pub batch_id: BatchId,
    /// Lifecycle state
    pub state: BatchState,
    /// Commands in the batch
    pub total_commands: usize,
    /// Commands that succeeded
    pub completed_commands: usize,
    /// Commands that failed
    pub failed_commands: usize,
    /// Commands skipped by the operator
    pub skipped_commands: usize,
    /// Commands whose effects were reversed
    pub rolled_back_commands: usize,
    /// Commands stopped before finishing
    pub cancelled_commands: usize,
    /// Running commands, including reversals in flight
    pub running_commands: usize,
    /// Commands not started yet
    pub pending_commands: usize,
    /// Percentage of processed commands, within `[0, 100]`
    pub progress: f64,
    /// Time since execution began
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<Duration>,
    /// Projected time to finish at the current rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<Duration>,
    /// Lowest stage with unfinished commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<usize>,
    /// Unresolved failures
    pub active_errors: usize,
    /// When execution began
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the batch settled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchStatus {
    /// Commands that reached a result: completed, failed, skipped or rolled back
    pub fn processed_commands(&self) -> usize {
        self.completed_commands + self.failed_commands + self.skipped_commands + self.rolled_back_commands
    }
}

/// Derives [`BatchStatus`] snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusAggregator;

impl StatusAggregator {
    /// New aggregator
    pub fn new() -> Self {
        Self
    }

    /// Summarize a batch now
    pub fn aggregate(&self, batch: &Batch) -> BatchStatus {
        self.aggregate_at(batch, Utc::now())
    }

    /// Summarize the batch as seen at `now`
    pub fn aggregate_at(&self, batch: &Batch, now: DateTime<Utc>) -> BatchStatus {
        let mut status = BatchStatus {
            batch_id: batch.id(),
            state: batch.state(),
            total_commands: batch.commands().len(),
            completed_commands: 0,
            failed_commands: 0,
            skipped_commands: 0,
            rolled_back_commands: 0,
            cancelled_commands: 0,
            running_commands: 0,
            pending_commands: 0,
            progress: 0.0,
            elapsed: None,
            estimated_time_remaining: None,
            current_stage: batch.current_stage(),
            active_errors: batch.active_errors().len(),
            started_at: batch.started_at(),
            completed_at: batch.completed_at(),
        };

        for (_, record) in batch.records() {
            match record.state {
                CommandState::Succeeded => status.completed_commands += 1,
                CommandState::Failed => status.failed_commands += 1,
                CommandState::Skipped => status.skipped_commands += 1,
                CommandState::RolledBack => status.rolled_back_commands += 1,
                CommandState::Cancelled => status.cancelled_commands += 1,
                CommandState::Running { .. } | CommandState::RollingBack => status.running_commands += 1,
                CommandState::Pending => status.pending_commands += 1,
            }
        }

        let processed = status.processed_commands();
        if status.total_commands > 0 {
            status.progress = (processed as f64 / status.total_commands as f64 * 100.0).clamp(0.0, 100.0);
        }

        status.elapsed = batch.started_at().map(|started| {
            let end = batch.completed_at().unwrap_or(now);
            (end - started).to_std().unwrap_or(Duration::ZERO)
        });

        status.estimated_time_remaining = match status.elapsed {
            _ if batch.is_terminal() => Some(Duration::ZERO),
            Some(elapsed) if processed > 0 => {
                let remaining = status.total_commands.saturating_sub(processed);
                Some(elapsed.mul_f64(remaining as f64 / processed as f64))
            }
            _ => None,
        };

        status
    }
}
