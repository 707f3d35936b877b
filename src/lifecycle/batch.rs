//! The batch aggregate and its event handling

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{BatchState, CommandState, LifecycleError};
use crate::executor::{BatchSubmission, CancelRequest, ExecutorEvent, ExecutorRequest, RecoveryRequest};
use crate::graph::plan::PlanError;
use crate::graph::{ExecutionPlan, GraphValidator, PlanBuilder, ValidationReport, Violation};
use crate::model::{BatchConfiguration, BatchDraft, Command, CommandId, Dependency, TransactionMode};
use crate::recovery::{
    CommandError, RecoveryActionKind, RecoveryConfig, RecoveryEffect, RecoveryOptions, Resubmission,
};
use crate::BatchError;

/// Identifier of a batch
pub type BatchId = Uuid;

/// Execution bookkeeping for one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Current state
    pub state: CommandState,
    /// Retries issued so far
    #[serde(default)]
    pub retries: u32,
    /// When the executor first reported it running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached its last result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Output reported on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Executor timestamp of the last failure handled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    fn new() -> Self {
        Self {
            state: CommandState::Pending,
            retries: 0,
            started_at: None,
            finished_at: None,
            output: None,
            last_failure_at: None,
        }
    }
}

/// Result of a queue request
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// Batch is queued; forward the submission to the executor
    Queued(BatchSubmission),
    /// Definition problems; the batch waits in `validating` for a revision
    Rejected(ValidationReport),
}

impl QueueOutcome {
    /// Whether the batch was queued
    pub fn is_queued(&self) -> bool {
        matches!(self, QueueOutcome::Queued(_))
    }

    /// The submission, or the rejection report as an error
    pub fn into_submission(self) -> crate::Result<BatchSubmission> {
        match self {
            QueueOutcome::Queued(submission) => Ok(submission),
            QueueOutcome::Rejected(report) => Err(BatchError::Definition(report)),
        }
    }

    /// Requests to forward, empty when rejected
    pub fn into_requests(self) -> Vec<ExecutorRequest> {
        match self {
            QueueOutcome::Queued(submission) => vec![ExecutorRequest::Submit(submission)],
            QueueOutcome::Rejected(_) => Vec::new(),
        }
    }
}

/// A finalized batch: definition, lifecycle state and error ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    id: BatchId,
    configuration: BatchConfiguration,
    commands: Vec<Command>,
    dependencies: Vec<Dependency>,
    state: BatchState,
    records: BTreeMap<CommandId, CommandRecord>,
    active_errors: Vec<CommandError>,
    error_log: Vec<CommandError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plan: Option<ExecutionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rollback_failure: Option<String>,
    #[serde(skip)]
    recovery_config: RecoveryConfig,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Finalize a draft into a pending batch
    pub fn new(draft: BatchDraft) -> Self {
        Self::with_id(Uuid::new_v4(), draft)
    }

    /// Finalize a draft under a known id
    pub fn with_id(id: BatchId, draft: BatchDraft) -> Self {
        let records = Self::fresh_records(&draft.commands);
        Self {
            id,
            configuration: draft.configuration,
            commands: draft.commands,
            dependencies: draft.dependencies,
            state: BatchState::Pending,
            records,
            active_errors: Vec::new(),
            error_log: Vec::new(),
            validation: None,
            plan: None,
            rollback_failure: None,
            recovery_config: RecoveryConfig::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Tune automatic retries
    pub fn with_recovery_config(mut self, config: RecoveryConfig) -> Self {
        self.recovery_config = config;
        self
    }

    fn fresh_records(commands: &[Command]) -> BTreeMap<CommandId, CommandRecord> {
        commands
            .iter()
            .map(|c| (c.id.clone(), CommandRecord::new()))
            .collect()
    }

    /// Batch id
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Batch policy
    pub fn configuration(&self) -> &BatchConfiguration {
        &self.configuration
    }

    /// Commands in declaration order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Dependency edges
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Command by id
    pub fn command(&self, id: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.id == id)
    }

    /// Execution record of a command
    pub fn record(&self, id: &str) -> Option<&CommandRecord> {
        self.records.get(id)
    }

    /// All execution records, ordered by command id
    pub fn records(&self) -> impl Iterator<Item = (&CommandId, &CommandRecord)> {
        self.records.iter()
    }

    /// State of a command, if it exists
    pub fn command_state(&self, id: &str) -> Option<CommandState> {
        self.records.get(id).map(|r| r.state)
    }

    /// Failures not yet resolved by success, skip or abort
    pub fn active_errors(&self) -> &[CommandError] {
        &self.active_errors
    }

    /// Active failure of a command
    pub fn active_error(&self, id: &str) -> Option<&CommandError> {
        self.active_errors.iter().find(|e| e.command_id == id)
    }

    /// Every failure ever reported, in arrival order
    pub fn error_log(&self) -> &[CommandError] {
        &self.error_log
    }

    /// Report from the last validation run
    pub fn validation(&self) -> Option<&ValidationReport> {
        self.validation.as_ref()
    }

    /// Plan built when the batch was queued
    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    /// Reason a rollback stopped partway, when in `rollback_failed`
    pub fn rollback_failure(&self) -> Option<&str> {
        self.rollback_failure.as_deref()
    }

    /// When the batch was finalized
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When execution began
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the batch reached a terminal or settled state
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Lowest plan stage that still has unfinished commands
    pub fn current_stage(&self) -> Option<usize> {
        let plan = self.plan.as_ref()?;
        plan.stages
            .iter()
            .find(|stage| {
                stage
                    .commands
                    .iter()
                    .any(|id| self.records.get(id).map_or(false, |r| !r.state.is_terminal()))
            })
            .map(|stage| stage.index)
    }

    /// Fails with a stuck-rollback error when the batch needs manual resolution
    pub fn ensure_resolvable(&self) -> crate::Result<()> {
        if self.state == BatchState::RollbackFailed {
            return Err(BatchError::StuckRollback {
                batch_id: self.id,
                reason: self.rollback_failure.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Replace the definition of a batch that has not been queued yet
    pub fn revise(&mut self, draft: BatchDraft) -> Result<(), LifecycleError> {
        match self.state {
            BatchState::Pending => {}
            BatchState::Validating => self.transition(BatchState::Pending, Utc::now())?,
            other => {
                return Err(LifecycleError::InvalidTransition {
                    from: other,
                    to: BatchState::Pending,
                })
            }
        }

        self.records = Self::fresh_records(&draft.commands);
        self.configuration = draft.configuration;
        self.commands = draft.commands;
        self.dependencies = draft.dependencies;
        self.validation = None;
        self.plan = None;
        debug!(batch_id = %self.id, "batch definition revised");
        Ok(())
    }

    /// Validate, plan and queue the batch
    #[instrument(skip(self, validator, planner), fields(batch_id = %self.id))]
    pub fn queue(
        &mut self,
        validator: &GraphValidator,
        planner: &PlanBuilder,
    ) -> Result<QueueOutcome, LifecycleError> {
        self.transition(BatchState::Validating, Utc::now())?;

        if self.configuration.validate_before_execution {
            let report = validator.validate(&self.commands, &self.dependencies, &self.configuration);
            if !report.is_valid() {
                warn!(violations = report.violations.len(), "batch failed validation");
                self.validation = Some(report.clone());
                return Ok(QueueOutcome::Rejected(report));
            }
            self.validation = Some(report);
        } else {
            debug!("validation skipped by configuration");
        }

        let plan = match planner.build_for(&self.commands, &self.dependencies, &self.configuration) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "batch could not be planned");
                let cycle = match err {
                    PlanError::Cyclic(ids) => ids,
                    PlanError::Graph(_) => Vec::new(),
                };
                let report = ValidationReport {
                    violations: vec![Violation::CyclicDependency { cycle }],
                };
                self.validation = Some(report.clone());
                return Ok(QueueOutcome::Rejected(report));
            }
        };

        self.plan = Some(plan.clone());
        self.transition(BatchState::Queued, Utc::now())?;

        Ok(QueueOutcome::Queued(BatchSubmission {
            batch_id: self.id,
            commands: self.commands.clone(),
            dependencies: self.dependencies.clone(),
            plan,
            configuration: self.configuration.clone(),
        }))
    }

    /// Give up on a definition that failed validation
    pub fn reject(&mut self) -> Result<(), LifecycleError> {
        self.transition(BatchState::Failed, Utc::now())
    }

    /// The executor accepted the plan
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        self.transition(BatchState::Executing, Utc::now())
    }

    /// Apply an executor event at the current time
    pub fn apply_event(&mut self, event: ExecutorEvent) -> Vec<ExecutorRequest> {
        self.apply_event_at(event, Utc::now())
    }

    /// Apply an executor event observed at `now`
    #[instrument(skip(self, event, now), fields(batch_id = %self.id, state = %self.state))]
    pub fn apply_event_at(&mut self, event: ExecutorEvent, now: DateTime<Utc>) -> Vec<ExecutorRequest> {
        if self.state.is_terminal() {
            debug!(?event, "event for terminal batch ignored");
            return Vec::new();
        }

        if event.command_id().is_some() {
            match self.state {
                // Command activity implies the executor took the plan
                BatchState::Queued => self.advance(BatchState::Executing, now),
                BatchState::Pending | BatchState::Validating => {
                    debug!(?event, "command event before queuing ignored");
                    return Vec::new();
                }
                _ => {}
            }
        }

        match event {
            ExecutorEvent::Accepted => {
                if self.state == BatchState::Queued {
                    self.advance(BatchState::Executing, now);
                }
                Vec::new()
            }
            ExecutorEvent::CommandStarted { command_id } => {
                if let Some(record) = self.live_record(&command_id) {
                    if record.state == CommandState::Pending {
                        record.state = CommandState::Running { percent: 0.0 };
                        record.started_at = Some(now);
                    }
                }
                Vec::new()
            }
            ExecutorEvent::CommandProgress { command_id, percent } => {
                if let Some(record) = self.live_record(&command_id) {
                    if matches!(record.state, CommandState::Pending | CommandState::Running { .. }) {
                        if record.started_at.is_none() {
                            record.started_at = Some(now);
                        }
                        record.state = CommandState::Running {
                            percent: percent.clamp(0.0, 100.0),
                        };
                    }
                }
                Vec::new()
            }
            ExecutorEvent::CommandSucceeded { command_id, output } => self.on_success(command_id, output, now),
            ExecutorEvent::CommandFailed { error } => self.on_failure(error, now),
            ExecutorEvent::CommandRolledBack { command_id } => self.on_rolled_back(command_id, now),
            ExecutorEvent::RollbackCompleted => {
                if self.state == BatchState::RollingBack {
                    for record in self.records.values_mut() {
                        if record.state == CommandState::RollingBack {
                            record.state = CommandState::RolledBack;
                            record.finished_at = Some(now);
                        }
                    }
                    self.advance(BatchState::RolledBack, now);
                }
                Vec::new()
            }
            ExecutorEvent::RollbackFailed { reason } => {
                let reversing = self.records.values().any(|r| r.state == CommandState::RollingBack);
                match self.state {
                    BatchState::RollingBack => self.fail_rollback(reason, now),
                    BatchState::Executing | BatchState::PartiallyCompleted if reversing => {
                        self.fail_rollback(reason, now)
                    }
                    _ => debug!(%reason, "rollback failure without a rollback in progress ignored"),
                }
                Vec::new()
            }
            ExecutorEvent::CancelConfirmed => {
                if self.state == BatchState::Cancelling {
                    self.finish_cancel(now);
                }
                Vec::new()
            }
            ExecutorEvent::Status { state } => {
                if state == self.state || !self.state.can_transition_to(state) {
                    debug!(reported = %state, "status snapshot ignored");
                } else if !self.records_support(state) {
                    debug!(reported = %state, "status snapshot ahead of command events ignored");
                } else if state == BatchState::Cancelled {
                    self.finish_cancel(now);
                } else {
                    self.advance(state, now);
                }
                Vec::new()
            }
        }
    }

    /// Whether the command records agree with a reported batch outcome
    fn records_support(&self, state: BatchState) -> bool {
        let mut records = self.records.values();
        match state {
            BatchState::Completed => {
                records.all(|r| matches!(r.state, CommandState::Succeeded | CommandState::Skipped))
            }
            BatchState::PartiallyCompleted | BatchState::Failed => records.all(|r| r.state.is_terminal()),
            BatchState::RolledBack => !records.any(|r| r.state.is_in_flight()),
            _ => true,
        }
    }

    /// Record of a known command, logging unknown ids
    fn live_record(&mut self, id: &str) -> Option<&mut CommandRecord> {
        let record = self.records.get_mut(id);
        if record.is_none() {
            warn!(command_id = id, "event for unknown command ignored");
        }
        record
    }

    fn on_success(&mut self, id: CommandId, output: Option<Value>, now: DateTime<Utc>) -> Vec<ExecutorRequest> {
        let rolling_back = self.state == BatchState::RollingBack;
        let Some(record) = self.live_record(&id) else {
            return Vec::new();
        };

        if !matches!(record.state, CommandState::Pending | CommandState::Running { .. }) {
            debug!(command_id = %id, state = record.state.name(), "duplicate or late success ignored");
            return Vec::new();
        }

        record.finished_at = Some(now);
        record.output = output;
        // Finished after the rollback began; reverse it too
        record.state = if rolling_back {
            CommandState::RollingBack
        } else {
            CommandState::Succeeded
        };
        self.active_errors.retain(|e| e.command_id != id);

        if rolling_back {
            return vec![self.rollback_request(vec![id])];
        }
        self.settle(now)
    }

    fn on_failure(&mut self, mut error: CommandError, now: DateTime<Utc>) -> Vec<ExecutorRequest> {
        let id = error.command_id.clone();
        let command_type = self.command(&id).map(|c| c.command_type());
        let Some(record) = self.live_record(&id) else {
            return Vec::new();
        };

        // A report no newer than the last one handled is a redelivery
        if record.last_failure_at.map_or(false, |seen| error.timestamp <= seen) {
            debug!(command_id = %id, "redelivered failure ignored");
            return Vec::new();
        }

        match record.state {
            CommandState::Pending | CommandState::Running { .. } => {}
            CommandState::RollingBack => {
                record.last_failure_at = Some(error.timestamp);
                let reason = format!("rollback of {} failed: {}", id, error.error);
                self.fail_rollback(reason, now);
                return Vec::new();
            }
            other => {
                debug!(command_id = %id, state = other.name(), "duplicate or late failure ignored");
                return Vec::new();
            }
        }

        record.state = CommandState::Failed;
        record.finished_at = Some(now);
        record.last_failure_at = Some(error.timestamp);
        let retries = record.retries;

        if let Some(command_type) = command_type {
            error.command_type = command_type;
        }
        error.retry_count = retries;
        warn!(command_id = %id, error = %error.error, retries, "command failed");

        self.error_log.push(error.clone());
        let can_retry = error.can_retry;
        self.upsert_active_error(error);

        match self.state {
            BatchState::Executing => {}
            BatchState::RollingBack => {
                self.check_rollback_done(now);
                return Vec::new();
            }
            _ => return Vec::new(),
        }

        if self.configuration.retry_failed_commands
            && can_retry
            && retries < self.recovery_config.max_automatic_retries
        {
            return self.auto_retry(id);
        }

        let reason = format!("command {} failed", id);
        match self.configuration.transaction_mode {
            TransactionMode::AllOrNothing if self.configuration.enable_rollback => self.begin_rollback(now),
            TransactionMode::AllOrNothing | TransactionMode::StopOnError => self.halt(reason, now),
            TransactionMode::BestEffort | TransactionMode::Isolated => self.settle(now),
        }
    }

    fn on_rolled_back(&mut self, id: CommandId, now: DateTime<Utc>) -> Vec<ExecutorRequest> {
        let Some(record) = self.live_record(&id) else {
            return Vec::new();
        };

        if record.state != CommandState::RollingBack {
            debug!(command_id = %id, state = record.state.name(), "unexpected rollback confirmation ignored");
            return Vec::new();
        }

        record.state = CommandState::RolledBack;
        record.finished_at = Some(now);

        if self.state == BatchState::RollingBack {
            self.check_rollback_done(now);
            Vec::new()
        } else {
            self.settle(now)
        }
    }

    fn upsert_active_error(&mut self, error: CommandError) {
        match self.active_errors.iter_mut().find(|e| e.command_id == error.command_id) {
            Some(existing) => *existing = error,
            None => self.active_errors.push(error),
        }
    }

    fn auto_retry(&mut self, id: CommandId) -> Vec<ExecutorRequest> {
        let attempt = match self.records.get_mut(&id) {
            Some(record) => {
                record.retries += 1;
                record.state = CommandState::Pending;
                record.retries
            }
            None => return Vec::new(),
        };
        if let Some(error) = self.active_errors.iter_mut().find(|e| e.command_id == id) {
            error.retry_count = attempt;
        }

        let delay = self.recovery_config.retry_delay(attempt);
        info!(command_id = %id, attempt, ?delay, "retrying failed command automatically");

        let options = RecoveryOptions::default().with_backoff();
        vec![ExecutorRequest::Recovery(RecoveryRequest {
            batch_id: self.id,
            action: RecoveryActionKind::Retry,
            command_ids: vec![id.clone()],
            options,
            resubmissions: vec![Resubmission {
                command_id: id,
                attempt,
                delay: Some(delay),
                parameter_override: None,
                fix_id: None,
            }],
        })]
    }

    /// Reverse every succeeded command and stop pending ones
    fn begin_rollback(&mut self, now: DateTime<Utc>) -> Vec<ExecutorRequest> {
        let mut to_reverse = Vec::new();
        for command in self.commands.iter().rev() {
            if let Some(record) = self.records.get_mut(&command.id) {
                match record.state {
                    CommandState::Succeeded => {
                        record.state = CommandState::RollingBack;
                        to_reverse.push(command.id.clone());
                    }
                    CommandState::Pending => {
                        record.state = CommandState::Cancelled;
                        record.finished_at = Some(now);
                    }
                    _ => {}
                }
            }
        }

        info!(batch_id = %self.id, commands = to_reverse.len(), "rolling back batch");

        let still_running = self.records.values().any(|r| r.state.is_in_flight());
        if !still_running {
            self.advance(BatchState::RolledBack, now);
            return Vec::new();
        }

        self.advance(BatchState::RollingBack, now);
        if to_reverse.is_empty() {
            Vec::new()
        } else {
            vec![self.rollback_request(to_reverse)]
        }
    }

    fn rollback_request(&self, command_ids: Vec<CommandId>) -> ExecutorRequest {
        ExecutorRequest::Recovery(RecoveryRequest {
            batch_id: self.id,
            action: RecoveryActionKind::Rollback,
            command_ids,
            options: RecoveryOptions::confirmed(),
            resubmissions: Vec::new(),
        })
    }

    fn check_rollback_done(&mut self, now: DateTime<Utc>) {
        if self.state == BatchState::RollingBack && !self.records.values().any(|r| r.state.is_in_flight()) {
            self.advance(BatchState::RolledBack, now);
        }
    }

    fn fail_rollback(&mut self, reason: String, now: DateTime<Utc>) {
        error!(batch_id = %self.id, %reason, "rollback failed, manual resolution required");
        self.rollback_failure = Some(reason);
        self.advance(BatchState::RollbackFailed, now);
    }

    /// Stop the batch after a halting failure
    fn halt(&mut self, reason: String, now: DateTime<Utc>) -> Vec<ExecutorRequest> {
        let in_flight = self.cancel_unfinished(now);
        self.advance(BatchState::Failed, now);
        if in_flight {
            vec![self.cancel_request(reason)]
        } else {
            Vec::new()
        }
    }

    /// Mark every unfinished command cancelled; true when any was running
    fn cancel_unfinished(&mut self, now: DateTime<Utc>) -> bool {
        let mut in_flight = false;
        for record in self.records.values_mut() {
            if !record.state.is_terminal() {
                in_flight |= record.state.is_in_flight();
                record.state = CommandState::Cancelled;
                record.finished_at = Some(now);
            }
        }
        in_flight
    }

    fn finish_cancel(&mut self, now: DateTime<Utc>) {
        self.cancel_unfinished(now);
        self.advance(BatchState::Cancelled, now);
    }

    fn cancel_request(&self, reason: String) -> ExecutorRequest {
        ExecutorRequest::Cancel(CancelRequest {
            batch_id: self.id,
            reason,
        })
    }

    /// Finish the batch once every command reached a terminal state
    fn settle(&mut self, now: DateTime<Utc>) -> Vec<ExecutorRequest> {
        if !matches!(self.state, BatchState::Executing | BatchState::PartiallyCompleted) {
            return Vec::new();
        }
        if self.records.values().any(|r| !r.state.is_terminal()) {
            return Vec::new();
        }

        let clean = self
            .records
            .values()
            .all(|r| matches!(r.state, CommandState::Succeeded | CommandState::Skipped));

        let next = if clean {
            BatchState::Completed
        } else if self.configuration.transaction_mode.halts_on_failure() {
            BatchState::Failed
        } else {
            BatchState::PartiallyCompleted
        };

        if next != self.state && self.state.can_transition_to(next) {
            self.advance(next, now);
        }
        Vec::new()
    }

    /// Request cancellation; in-flight batches wait for executor confirmation
    #[instrument(skip(self, reason), fields(batch_id = %self.id, state = %self.state))]
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<Vec<ExecutorRequest>, LifecycleError> {
        let reason = reason.into();
        let now = Utc::now();
        match self.state {
            state if state.is_terminal() => Err(LifecycleError::AlreadyTerminal(state)),
            BatchState::Cancelling => Ok(Vec::new()),
            BatchState::Pending | BatchState::Validating | BatchState::PartiallyCompleted => {
                self.cancel_unfinished(now);
                self.transition(BatchState::Cancelled, now)?;
                Ok(Vec::new())
            }
            BatchState::Queued => {
                self.cancel_unfinished(now);
                self.transition(BatchState::Cancelled, now)?;
                Ok(vec![self.cancel_request(reason)])
            }
            BatchState::Executing | BatchState::RollingBack => {
                self.transition(BatchState::Cancelling, now)?;
                Ok(vec![self.cancel_request(reason)])
            }
            other => Err(LifecycleError::InvalidTransition {
                from: other,
                to: BatchState::Cancelled,
            }),
        }
    }

    /// Operator-requested rollback of the whole batch
    #[instrument(skip(self), fields(batch_id = %self.id, state = %self.state))]
    pub fn request_rollback(&mut self) -> Result<Vec<ExecutorRequest>, LifecycleError> {
        if !matches!(self.state, BatchState::Executing | BatchState::PartiallyCompleted) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to: BatchState::RollingBack,
            });
        }
        Ok(self.begin_rollback(Utc::now()))
    }

    /// Apply an accepted recovery effect to local state
    #[instrument(skip(self, effect), fields(batch_id = %self.id, action = %effect.action()))]
    pub fn apply_recovery(&mut self, effect: &RecoveryEffect) -> Result<Vec<ExecutorRequest>, LifecycleError> {
        if !matches!(self.state, BatchState::Executing | BatchState::PartiallyCompleted) {
            return Err(LifecycleError::NotRecoverable(self.state));
        }
        let now = Utc::now();

        match effect {
            RecoveryEffect::Abort => {
                self.active_errors.clear();
                self.cancel("aborted by operator")
            }
            RecoveryEffect::Resubmit {
                action,
                options,
                resubmissions,
            } => {
                let ids: Vec<CommandId> = resubmissions.iter().map(|r| r.command_id.clone()).collect();
                self.expect_failed(&ids)?;

                for resubmission in resubmissions {
                    if let Some(record) = self.records.get_mut(&resubmission.command_id) {
                        record.state = CommandState::Pending;
                        record.retries = resubmission.attempt;
                        record.finished_at = None;
                    }
                    if let Some(error) = self
                        .active_errors
                        .iter_mut()
                        .find(|e| e.command_id == resubmission.command_id)
                    {
                        error.retry_count = resubmission.attempt;
                    }
                    if let Some(spec) = &resubmission.parameter_override {
                        if let Some(command) = self.commands.iter_mut().find(|c| c.id == resubmission.command_id) {
                            command.spec = spec.clone();
                        }
                    }
                }

                if self.state == BatchState::PartiallyCompleted {
                    self.transition(BatchState::Executing, now)?;
                }

                Ok(vec![ExecutorRequest::Recovery(RecoveryRequest {
                    batch_id: self.id,
                    action: *action,
                    command_ids: ids,
                    options: *options,
                    resubmissions: resubmissions.clone(),
                })])
            }
            RecoveryEffect::Skip { command_ids } => {
                self.expect_failed(command_ids)?;
                for id in command_ids {
                    if let Some(record) = self.records.get_mut(id) {
                        record.state = CommandState::Skipped;
                    }
                }
                self.active_errors.retain(|e| !command_ids.contains(&e.command_id));

                let mut requests = vec![ExecutorRequest::Recovery(RecoveryRequest {
                    batch_id: self.id,
                    action: RecoveryActionKind::Skip,
                    command_ids: command_ids.clone(),
                    options: RecoveryOptions::default(),
                    resubmissions: Vec::new(),
                })];
                requests.extend(self.settle(now));
                Ok(requests)
            }
            RecoveryEffect::Rollback { command_ids } => {
                self.expect_failed(command_ids)?;
                for id in command_ids {
                    if let Some(record) = self.records.get_mut(id) {
                        record.state = CommandState::RollingBack;
                    }
                }
                if self.state == BatchState::PartiallyCompleted {
                    self.transition(BatchState::Executing, now)?;
                }
                Ok(vec![self.rollback_request(command_ids.clone())])
            }
        }
    }

    fn expect_failed(&self, ids: &[CommandId]) -> Result<(), LifecycleError> {
        for id in ids {
            let record = self
                .records
                .get(id)
                .ok_or_else(|| LifecycleError::UnknownCommand(id.clone()))?;
            if record.state != CommandState::Failed {
                return Err(LifecycleError::UnexpectedCommandState {
                    command_id: id.clone(),
                    actual: record.state.name(),
                    expected: "failed",
                });
            }
        }
        Ok(())
    }

    fn transition(&mut self, to: BatchState, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }

        self.state = to;
        match to {
            BatchState::Executing => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.completed_at = None;
            }
            BatchState::PartiallyCompleted => self.completed_at = Some(now),
            state if state.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }

        info!(batch_id = %self.id, %from, %to, "batch state changed");
        Ok(())
    }

    /// Internal transition that the event rules guarantee is valid
    fn advance(&mut self, to: BatchState, now: DateTime<Utc>) {
        if let Err(err) = self.transition(to, now) {
            error!(batch_id = %self.id, error = %err, "internal transition rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchDraft, Command, ExecutionMode};

    fn queued(draft: BatchDraft) -> Batch {
        let mut batch = Batch::new(draft);
        let outcome = batch.queue(&GraphValidator::new(), &PlanBuilder::new()).unwrap();
        assert!(outcome.is_queued());
        batch
    }

    fn three(mode: TransactionMode) -> BatchDraft {
        BatchDraft::new("three")
            .add_command(Command::wait("c1", 5))
            .add_command(Command::wait("c2", 5))
            .add_command(Command::wait("c3", 5))
            .with_configuration(BatchConfiguration::new("three").with_transaction_mode(mode))
    }

    fn failure(id: &str) -> CommandError {
        CommandError::new(id, crate::model::CommandType::Wait, "boom")
    }

    #[test]
    fn test_queue_builds_submission() {
        let mut batch = Batch::new(
            three(TransactionMode::BestEffort).depend("c1", "c3"),
        );
        batch.configuration.execution_mode = ExecutionMode::Mixed;

        match batch.queue(&GraphValidator::new(), &PlanBuilder::new()).unwrap() {
            QueueOutcome::Queued(submission) => {
                assert_eq!(submission.batch_id, batch.id());
                assert_eq!(submission.plan.stages.len(), 2);
            }
            other => panic!("expected queued, got {:?}", other),
        }
        assert_eq!(batch.state(), BatchState::Queued);
    }

    #[test]
    fn test_rejected_definition_can_be_revised() {
        let mut batch = Batch::new(BatchDraft::new(""));
        let outcome = batch.queue(&GraphValidator::new(), &PlanBuilder::new()).unwrap();

        assert!(!outcome.is_queued());
        assert_eq!(batch.state(), BatchState::Validating);

        batch.revise(three(TransactionMode::BestEffort)).unwrap();
        assert_eq!(batch.state(), BatchState::Pending);
        assert!(batch.queue(&GraphValidator::new(), &PlanBuilder::new()).unwrap().is_queued());
    }

    #[test]
    fn test_reject_fails_batch() {
        let mut batch = Batch::new(BatchDraft::new("empty"));
        batch.queue(&GraphValidator::new(), &PlanBuilder::new()).unwrap();

        batch.reject().unwrap();
        assert_eq!(batch.state(), BatchState::Failed);
    }

    #[test]
    fn test_skipped_validation_still_rejects_cycles() {
        let draft = three(TransactionMode::BestEffort)
            .depend("c1", "c2")
            .depend("c2", "c1")
            .with_configuration(
                BatchConfiguration::new("x")
                    .with_validation(false)
                    .with_execution_mode(ExecutionMode::Mixed),
            );
        let mut batch = Batch::new(draft);

        let outcome = batch.queue(&GraphValidator::new(), &PlanBuilder::new()).unwrap();
        match outcome {
            QueueOutcome::Rejected(report) => assert!(report.has_cycle()),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_command_event_implies_acceptance() {
        let mut batch = queued(three(TransactionMode::BestEffort));
        batch.apply_event(ExecutorEvent::CommandStarted { command_id: "c1".into() });

        assert_eq!(batch.state(), BatchState::Executing);
        assert!(batch.started_at().is_some());
        assert_eq!(batch.command_state("c1"), Some(CommandState::Running { percent: 0.0 }));
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut batch = queued(three(TransactionMode::BestEffort));
        batch.apply_event(ExecutorEvent::CommandProgress {
            command_id: "c2".into(),
            percent: 180.0,
        });

        assert_eq!(batch.command_state("c2"), Some(CommandState::Running { percent: 100.0 }));
    }

    #[test]
    fn test_stop_on_error_halts() {
        let mut batch = queued(three(TransactionMode::StopOnError));
        batch.start().unwrap();
        batch.apply_event(ExecutorEvent::CommandStarted { command_id: "c1".into() });
        batch.apply_event(ExecutorEvent::CommandStarted { command_id: "c2".into() });

        let requests = batch.apply_event(ExecutorEvent::failed(failure("c1")));

        assert_eq!(batch.state(), BatchState::Failed);
        assert_eq!(batch.command_state("c2"), Some(CommandState::Cancelled));
        assert_eq!(batch.command_state("c3"), Some(CommandState::Cancelled));
        assert!(matches!(requests.as_slice(), [ExecutorRequest::Cancel(_)]));
    }

    #[test]
    fn test_automatic_retry() {
        let mut draft = three(TransactionMode::StopOnError);
        draft.configuration.retry_failed_commands = true;
        let mut batch = queued(draft).with_recovery_config(RecoveryConfig::default().with_max_automatic_retries(1));
        batch.start().unwrap();

        let requests = batch.apply_event(ExecutorEvent::failed(failure("c1").retryable(true)));
        assert_eq!(batch.state(), BatchState::Executing);
        assert_eq!(batch.command_state("c1"), Some(CommandState::Pending));
        match requests.as_slice() {
            [ExecutorRequest::Recovery(req)] => {
                assert_eq!(req.action, RecoveryActionKind::Retry);
                assert_eq!(req.resubmissions[0].attempt, 1);
            }
            other => panic!("unexpected requests {:?}", other),
        }

        // Retry budget exhausted: the failure now halts the batch
        batch.apply_event(ExecutorEvent::failed(failure("c1").retryable(true)));
        assert_eq!(batch.state(), BatchState::Failed);
        assert_eq!(batch.active_error("c1").map(|e| e.retry_count), Some(1));
    }

    #[test]
    fn test_redelivered_failure_after_retry_is_ignored() {
        let mut draft = three(TransactionMode::BestEffort);
        draft.configuration.retry_failed_commands = true;
        let mut batch = queued(draft).with_recovery_config(RecoveryConfig::default().with_max_automatic_retries(3));
        batch.start().unwrap();

        let event = ExecutorEvent::failed(failure("c1").retryable(true));
        assert_eq!(batch.apply_event(event.clone()).len(), 1);
        assert!(batch.apply_event(event).is_empty());

        assert_eq!(batch.record("c1").map(|r| r.retries), Some(1));
        assert_eq!(batch.command_state("c1"), Some(CommandState::Pending));
        assert_eq!(batch.error_log().len(), 1);
    }

    #[test]
    fn test_cancel_waits_for_confirmation() {
        let mut batch = queued(three(TransactionMode::BestEffort));
        batch.start().unwrap();
        batch.apply_event(ExecutorEvent::CommandStarted { command_id: "c1".into() });

        let requests = batch.cancel("operator").unwrap();
        assert_eq!(batch.state(), BatchState::Cancelling);
        assert_eq!(requests.len(), 1);

        // Late completion is still recorded while cancelling
        batch.apply_event(ExecutorEvent::succeeded("c1"));
        assert_eq!(batch.command_state("c1"), Some(CommandState::Succeeded));

        batch.apply_event(ExecutorEvent::CancelConfirmed);
        assert_eq!(batch.state(), BatchState::Cancelled);
        assert_eq!(batch.command_state("c2"), Some(CommandState::Cancelled));
        assert!(matches!(batch.cancel("again"), Err(LifecycleError::AlreadyTerminal(BatchState::Cancelled))));
    }

    #[test]
    fn test_cancel_before_execution_is_immediate() {
        let mut batch = Batch::new(three(TransactionMode::BestEffort));
        assert!(batch.cancel("changed my mind").unwrap().is_empty());
        assert_eq!(batch.state(), BatchState::Cancelled);
    }

    #[test]
    fn test_rollback_failure_needs_manual_resolution() {
        let mut draft = three(TransactionMode::AllOrNothing);
        draft.configuration.enable_rollback = true;
        let mut batch = queued(draft);
        batch.start().unwrap();

        batch.apply_event(ExecutorEvent::succeeded("c1"));
        batch.apply_event(ExecutorEvent::failed(failure("c2")));
        assert_eq!(batch.state(), BatchState::RollingBack);

        batch.apply_event(ExecutorEvent::RollbackFailed {
            reason: "c1 cannot be undone".into(),
        });

        assert_eq!(batch.state(), BatchState::RollbackFailed);
        assert!(batch.is_terminal());
        assert!(matches!(batch.ensure_resolvable(), Err(BatchError::StuckRollback { .. })));
    }

    #[test]
    fn test_late_success_during_rollback_is_reversed() {
        let mut draft = three(TransactionMode::AllOrNothing);
        draft.configuration.enable_rollback = true;
        let mut batch = queued(draft);
        batch.start().unwrap();

        batch.apply_event(ExecutorEvent::CommandStarted { command_id: "c3".into() });
        batch.apply_event(ExecutorEvent::succeeded("c1"));
        batch.apply_event(ExecutorEvent::failed(failure("c2")));

        let requests = batch.apply_event(ExecutorEvent::succeeded("c3"));
        assert_eq!(batch.command_state("c3"), Some(CommandState::RollingBack));
        assert_eq!(requests.len(), 1);

        batch.apply_event(ExecutorEvent::rolled_back("c1"));
        assert_eq!(batch.state(), BatchState::RollingBack);
        batch.apply_event(ExecutorEvent::rolled_back("c3"));
        assert_eq!(batch.state(), BatchState::RolledBack);
    }

    #[test]
    fn test_events_after_terminal_are_ignored() {
        let mut batch = queued(three(TransactionMode::BestEffort));
        batch.start().unwrap();
        for id in ["c1", "c2", "c3"] {
            batch.apply_event(ExecutorEvent::succeeded(id));
        }
        assert_eq!(batch.state(), BatchState::Completed);

        let requests = batch.apply_event(ExecutorEvent::failed(failure("c1")));
        assert!(requests.is_empty());
        assert_eq!(batch.command_state("c1"), Some(CommandState::Succeeded));
        assert!(batch.error_log().is_empty());
    }

    #[test]
    fn test_status_snapshot_follows_transition_table() {
        let mut batch = queued(three(TransactionMode::BestEffort));
        batch.apply_event(ExecutorEvent::Status { state: BatchState::Completed });
        assert_eq!(batch.state(), BatchState::Queued);

        batch.apply_event(ExecutorEvent::Status { state: BatchState::Executing });
        assert_eq!(batch.state(), BatchState::Executing);
    }

    #[test]
    fn test_completed_snapshot_waits_for_command_results() {
        let mut batch = queued(three(TransactionMode::BestEffort));
        batch.start().unwrap();
        batch.apply_event(ExecutorEvent::succeeded("c1"));

        batch.apply_event(ExecutorEvent::Status { state: BatchState::Completed });
        assert_eq!(batch.state(), BatchState::Executing);
        assert_eq!(batch.command_state("c2"), Some(CommandState::Pending));

        batch.apply_event(ExecutorEvent::succeeded("c2"));
        batch.apply_event(ExecutorEvent::succeeded("c3"));
        assert_eq!(batch.state(), BatchState::Completed);
    }
}
