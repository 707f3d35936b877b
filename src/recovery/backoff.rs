//! Retry delay calculation

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed { delay: Duration },
    /// Delay grows by `increment` per attempt
    Linear { base: Duration, increment: Duration },
    /// Delay grows by `multiplier` per attempt, capped at `max`
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

/// Process-level recovery tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Automatic retries per command when `retry_failed_commands` is set
    pub max_automatic_retries: u32,
    /// Delay policy between retries
    pub backoff: BackoffStrategy,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_automatic_retries: 3,
            backoff: BackoffStrategy::default(),
            jitter: false,
        }
    }
}

impl RecoveryConfig {
    /// Set the automatic retry budget
    pub fn with_max_automatic_retries(mut self, retries: u32) -> Self {
        self.max_automatic_retries = retries;
        self
    }

    /// Set the delay policy
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match &self.backoff {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, increment } => *base + increment.saturating_mul(attempt - 1),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.max(1.0).powi((attempt - 1).min(i32::MAX as u32) as i32);
                let millis = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        };

        if self.jitter {
            let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
            delay + Duration::from_millis(jitter_ms)
        } else {
            delay
        }
    }
}
