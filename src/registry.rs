//! Concurrent registry of batches keyed by id
//!
//! Each batch has exactly one writer at a time: mutation goes through
//! [`BatchRegistry::with_batch`], which holds the map shard lock for the
//! duration of the closure.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::executor::{ExecutorEvent, ExecutorRequest};
use crate::lifecycle::{Batch, BatchId};
use crate::model::BatchDraft;
use crate::status::{BatchStatus, StatusAggregator};

/// Errors raised by registry lookups
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// No batch with this id
    #[error("Batch not found: {0}")]
    NotFound(BatchId),

    /// A batch with this id is already registered
    #[error("Batch already registered: {0}")]
    Duplicate(BatchId),
}

/// Shared map of live batches
#[derive(Debug, Clone, Default)]
pub struct BatchRegistry {
    batches: Arc<DashMap<BatchId, Batch>>,
    aggregator: StatusAggregator,
}

impl BatchRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalize a draft and register the new batch
    pub fn create(&self, draft: BatchDraft) -> BatchId {
        let batch = Batch::new(draft);
        let id = batch.id();
        self.batches.insert(id, batch);
        info!(batch_id = %id, "batch registered");
        id
    }

    /// Register an existing batch, e.g. one imported from a document
    pub fn insert(&self, batch: Batch) -> Result<BatchId, RegistryError> {
        let id = batch.id();
        match self.batches.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegistryError::Duplicate(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(batch);
                info!(batch_id = %id, "batch registered");
                Ok(id)
            }
        }
    }

    /// Snapshot of a batch
    pub fn get(&self, id: &BatchId) -> Option<Batch> {
        self.batches.get(id).map(|entry| entry.value().clone())
    }

    /// Whether a batch is registered
    pub fn contains(&self, id: &BatchId) -> bool {
        self.batches.contains_key(id)
    }

    /// Run `f` with exclusive access to one batch
    pub fn with_batch<R>(&self, id: &BatchId, f: impl FnOnce(&mut Batch) -> R) -> Result<R, RegistryError> {
        let mut entry = self.batches.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        Ok(f(entry.value_mut()))
    }

    /// Route an executor event to its batch
    pub fn apply_event(&self, id: &BatchId, event: ExecutorEvent) -> Result<Vec<ExecutorRequest>, RegistryError> {
        self.with_batch(id, |batch| batch.apply_event(event))
    }

    /// Take a batch out of the registry
    pub fn remove(&self, id: &BatchId) -> Option<Batch> {
        let removed = self.batches.remove(id).map(|(_, batch)| batch);
        if removed.is_some() {
            debug!(batch_id = %id, "batch removed");
        }
        removed
    }

    /// Ids of all registered batches
    pub fn ids(&self) -> Vec<BatchId> {
        self.batches.iter().map(|entry| *entry.key()).collect()
    }

    /// Status summary of one batch
    pub fn status(&self, id: &BatchId) -> Option<BatchStatus> {
        self.batches.get(id).map(|entry| self.aggregator.aggregate(entry.value()))
    }

    /// Status of every registered batch
    pub fn statuses(&self) -> Vec<BatchStatus> {
        self.batches
            .iter()
            .map(|entry| self.aggregator.aggregate(entry.value()))
            .collect()
    }

    /// Number of registered batches
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether no batches are registered
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::BatchState;
    use crate::model::Command;

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = BatchRegistry::new();
        let batch = Batch::new(BatchDraft::new("a").add_command(Command::wait("w", 1)));

        registry.insert(batch.clone()).unwrap();
        assert_eq!(registry.insert(batch.clone()), Err(RegistryError::Duplicate(batch.id())));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_batch() {
        let registry = BatchRegistry::new();
        let id = uuid::Uuid::new_v4();

        assert!(matches!(registry.with_batch(&id, |b| b.state()), Err(RegistryError::NotFound(_))));
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_with_batch_mutates_in_place() {
        let registry = BatchRegistry::new();
        let id = registry.create(BatchDraft::new("b").add_command(Command::wait("w", 1)));

        registry.with_batch(&id, |batch| batch.cancel("stop")).unwrap().unwrap();

        assert_eq!(registry.get(&id).map(|b| b.state()), Some(BatchState::Cancelled));
        assert_eq!(registry.statuses().len(), 1);
    }
}
