//! Batch lifecycle walkthrough
//!
//! Builds a small deployment batch, queues it, feeds it executor events
//! through an in-process executor and recovers a failed command with its
//! suggested fix.

use std::time::Instant;

use async_trait::async_trait;
use cmdbatch::{
    executor::{BatchExecutor, BatchSubmission, CancelRequest, ExecutorError, ExecutorEvent, RecoveryRequest},
    graph::{GraphValidator, PlanBuilder},
    model::{BatchConfiguration, BatchDraft, Command, CommandType, ExecutionMode, TransactionMode},
    recovery::{auto_fix::auto_fix_all, CommandError, RecoveryCoordinator, SuggestedFix},
    registry::BatchRegistry,
    Result,
};
use serde_json::json;

/// Executor that succeeds every recovery request
struct LocalExecutor;

#[async_trait]
impl BatchExecutor for LocalExecutor {
    async fn submit(&self, submission: BatchSubmission) -> std::result::Result<(), ExecutorError> {
        println!("   executor received {} stages", submission.plan.stages.len());
        Ok(())
    }

    async fn recover(&self, request: RecoveryRequest) -> std::result::Result<Vec<ExecutorEvent>, ExecutorError> {
        println!("   executor: {} {:?}", request.action, request.command_ids);
        Ok(request.command_ids.into_iter().map(ExecutorEvent::succeeded).collect())
    }

    async fn cancel(&self, request: CancelRequest) -> std::result::Result<(), ExecutorError> {
        println!("   executor cancelling: {}", request.reason);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("cmdbatch=debug")
        .init();

    println!("Batch lifecycle demonstration");
    println!("=============================\n");

    let start = Instant::now();
    let registry = BatchRegistry::new();
    let executor = LocalExecutor;

    let draft = BatchDraft::new("deploy-web")
        .add_command(Command::shell("build", "make").with_name("Build artifacts"))
        .add_command(Command::shell("migrate", "./migrate.sh"))
        .add_command(Command::wait("warmup", 1_500))
        .add_command(Command::shell("smoke", "./smoke.sh"))
        .depend("build", "migrate")
        .depend("build", "warmup")
        .depend("migrate", "smoke")
        .depend("warmup", "smoke")
        .with_configuration(
            BatchConfiguration::new("deploy-web")
                .with_execution_mode(ExecutionMode::Mixed)
                .with_transaction_mode(TransactionMode::BestEffort)
                .with_parallel_limit(2),
        );

    let id = registry.create(draft);
    println!("1. Queue batch {}", id);
    let submission = registry
        .with_batch(&id, |batch| batch.queue(&GraphValidator::new(), &PlanBuilder::new()))??
        .into_submission()?;
    for stage in &submission.plan.stages {
        println!("   stage {}: {:?}", stage.index, stage.commands);
    }
    executor.submit(submission).await?;

    println!("\n2. Executor reports results");
    registry.apply_event(&id, ExecutorEvent::Accepted)?;
    registry.apply_event(&id, ExecutorEvent::succeeded("build"))?;
    registry.apply_event(&id, ExecutorEvent::succeeded("warmup"))?;
    registry.apply_event(
        &id,
        ExecutorEvent::failed(
            CommandError::new("migrate", CommandType::Shell, "database locked")
                .retryable(true)
                .with_code("E_LOCKED")
                .with_fix(
                    SuggestedFix::new("force-unlock", "Run the migration with --force-unlock")
                        .with_override("args", json!(["--force-unlock"])),
                ),
        ),
    )?;
    registry.apply_event(
        &id,
        ExecutorEvent::failed(CommandError::new("smoke", CommandType::Shell, "upstream not migrated")),
    )?;

    if let Some(status) = registry.status(&id) {
        println!(
            "   state={} progress={:.0}% failed={}",
            status.state, status.progress, status.failed_commands
        );
    }

    println!("\n3. Available recovery actions");
    let coordinator = RecoveryCoordinator::default();
    if let Some(batch) = registry.get(&id) {
        for error in batch.active_errors() {
            let actions: Vec<String> = coordinator
                .available_actions(error)
                .iter()
                .map(|a| a.kind.to_string())
                .collect();
            println!("   {}: {}", error.command_id, actions.join(", "));
        }
    }

    println!("\n4. Apply suggested fixes");
    let mut batch = registry.remove(&id).ok_or(cmdbatch::registry::RegistryError::NotFound(id))?;
    let report = auto_fix_all(&coordinator, &mut batch, &executor, None, None).await?;
    println!(
        "   applied {} of {} fixes ({} succeeded)",
        report.fixes_applied,
        report.total_fixable,
        report.succeeded.len()
    );
    println!("   batch is now {}", batch.state());
    registry.insert(batch)?;

    println!("\nDone in {:?}", start.elapsed());
    Ok(())
}
