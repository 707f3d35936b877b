//! Boundary to the external command executor
//!
//! The core never runs commands itself. It produces [`ExecutorRequest`]s and
//! consumes [`ExecutorEvent`]s; an implementation of [`BatchExecutor`] moves
//! them over whatever transport the application uses.

use async_trait::async_trait;
use thiserror::Error;

pub mod messages;

pub use messages::{BatchSubmission, CancelRequest, ExecutorEvent, ExecutorRequest, RecoveryRequest};

/// Errors reported by an executor implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    /// The executor refused the request
    #[error("Executor rejected request: {0}")]
    Rejected(String),

    /// The executor cannot be reached
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    /// Delivery failed
    #[error("Transport error: {0}")]
    Transport(String),
}

/// External collaborator that runs commands
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Hand over a validated batch and its plan
    async fn submit(&self, submission: BatchSubmission) -> Result<(), ExecutorError>;

    /// Carry out a recovery action and report the resulting events
    async fn recover(&self, request: RecoveryRequest) -> Result<Vec<ExecutorEvent>, ExecutorError>;

    /// Stop in-flight commands
    async fn cancel(&self, request: CancelRequest) -> Result<(), ExecutorError>;

    /// Route any outbound request to the matching method
    async fn dispatch(&self, request: ExecutorRequest) -> Result<Vec<ExecutorEvent>, ExecutorError> {
        match request {
            ExecutorRequest::Submit(submission) => self.submit(submission).await.map(|_| Vec::new()),
            ExecutorRequest::Recovery(recovery) => self.recover(recovery).await,
            ExecutorRequest::Cancel(cancel) => self.cancel(cancel).await.map(|_| Vec::new()),
        }
    }
}
