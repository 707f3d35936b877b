//! Batch configuration

use serde::{Deserialize, Serialize};

use super::Priority;

/// How commands are ordered for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One command at a time, in declaration order
    #[default]
    Sequential,
    /// All commands at once (degrades to `Mixed` when dependencies exist)
    Parallel,
    /// Dependency levels, each level concurrent
    Mixed,
}

/// How the batch reacts to an individual command failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Any failure fails the batch; rolls back when rollback is enabled
    AllOrNothing,
    /// Keep going; the batch finishes partially completed
    #[default]
    BestEffort,
    /// Halt on the first failure
    StopOnError,
    /// Commands are independent; failures stay local
    Isolated,
}

impl TransactionMode {
    /// Whether a single failure halts the batch
    pub fn halts_on_failure(&self) -> bool {
        matches!(self, TransactionMode::AllOrNothing | TransactionMode::StopOnError)
    }
}

/// Operator-chosen policy for a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfiguration {
    /// Batch name, required
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// How the plan orders commands
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// How failures affect the rest of the batch
    #[serde(default)]
    pub transaction_mode: TransactionMode,
    /// Scheduling priority of the whole batch
    #[serde(default)]
    pub priority: Priority,
    /// Reverse succeeded commands on failure under `all_or_nothing`
    #[serde(default)]
    pub enable_rollback: bool,
    /// Run the full validator before queueing
    #[serde(default = "default_true")]
    pub validate_before_execution: bool,
    /// Maximum concurrently executing commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_limit: Option<usize>,
    /// Forwarded to the executor, never enforced here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Retry retryable failures automatically
    #[serde(default)]
    pub retry_failed_commands: bool,
    /// Labels for filtering
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for BatchConfiguration {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            execution_mode: ExecutionMode::default(),
            transaction_mode: TransactionMode::default(),
            priority: Priority::Normal,
            enable_rollback: false,
            validate_before_execution: true,
            parallel_limit: None,
            timeout_seconds: None,
            retry_failed_commands: false,
            tags: Vec::new(),
        }
    }
}

impl BatchConfiguration {
    /// Create a configuration with the given name and defaults elsewhere
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the execution mode
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Set the transaction mode
    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Enable or disable rollback
    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.enable_rollback = enabled;
        self
    }

    /// Enable or disable validation before queueing
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_before_execution = enabled;
        self
    }

    /// Set the concurrency bound (at least 1)
    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = Some(limit.max(1));
        self
    }

    /// Set the executor timeout
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Enable or disable automatic retries
    pub fn with_retry_failed_commands(mut self, enabled: bool) -> Self {
        self.retry_failed_commands = enabled;
        self
    }

    /// Set the batch priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: BatchConfiguration = serde_json::from_str(r#"{"name": "nightly"}"#).unwrap();

        assert_eq!(config.name, "nightly");
        assert_eq!(config.execution_mode, ExecutionMode::Sequential);
        assert_eq!(config.transaction_mode, TransactionMode::BestEffort);
        assert!(config.validate_before_execution);
        assert!(config.parallel_limit.is_none());
    }

    #[test]
    fn test_transaction_mode_wire_names() {
        let json = serde_json::to_string(&TransactionMode::AllOrNothing).unwrap();
        assert_eq!(json, "\"all_or_nothing\"");
        assert!(TransactionMode::StopOnError.halts_on_failure());
        assert!(!TransactionMode::Isolated.halts_on_failure());
    }

    #[test]
    fn test_parallel_limit_floor() {
        let config = BatchConfiguration::new("b").with_parallel_limit(0);
        assert_eq!(config.parallel_limit, Some(1));
    }
}
