//! Retry policy: which failures are retried, how often, and how long to wait.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::failure::FailureReason;
use crate::types::duration_serde;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_serde")]
    pub base_delay: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Upper bound on any single delay
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,

    /// Failure categories worth retrying
    pub retryable: BTreeSet<FailureReason>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retryable: FailureReason::ALL
                .into_iter()
                .filter(|reason| reason.is_transient())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry count and default delays.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Also retry failures of this category.
    pub fn retry_on(mut self, reason: FailureReason) -> Self {
        self.retryable.insert(reason);
        self
    }

    /// Whether a failure on the zero-based `attempt` should be retried.
    pub fn should_retry(&self, reason: FailureReason, attempt: u32) -> bool {
        attempt < self.max_retries && self.retryable.contains(&reason)
    }

    /// Backoff before retry number `attempt` (zero-based).
    ///
    /// `base_delay * multiplier^attempt`, capped at `max_delay`. A multiplier
    /// below 1.0 is treated as 1.0 so delays never shrink.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}
