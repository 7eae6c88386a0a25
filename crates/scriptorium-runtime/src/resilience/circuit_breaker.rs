//! Circuit breaker to stop hammering a failing dependency.
//!
//! After `failure_threshold` consecutive failures the circuit opens and
//! every call is refused until `recovery_timeout` has passed since the last
//! failure. Then a single trial call is let through: success closes the
//! circuit, failure opens it again.

use parking_lot::Mutex;
use scriptorium_core::types::duration_serde;
use scriptorium_core::FailureReason;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time after the last failure before a trial call is allowed
    #[serde(with = "duration_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// State of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are refused
    Open,

    /// One trial call decides whether to close again
    HalfOpen,
}

/// Point-in-time view of the breaker for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure_reason: Option<FailureReason>,
    pub seconds_since_last_failure: Option<f64>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_reason: Option<FailureReason>,
    trial_in_flight: bool,
}

/// Circuit breaker shared by every call made through a runtime context.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_reason: None,
                trial_in_flight: false,
            }),
            config,
        }
    }

    /// Whether a call may proceed now.
    ///
    /// In the open state this moves the circuit to half-open once the
    /// recovery timeout has elapsed, and admits that caller as the trial.
    /// While a trial is in flight every other caller is refused.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("Circuit half-open, admitting trial call");
                }
                recovered
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            tracing::info!("Circuit closed after successful recovery");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, reason: FailureReason) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_reason = Some(reason);
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!(%reason, "Circuit reopened after failed recovery attempt");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    %reason,
                    failures = inner.consecutive_failures,
                    "Circuit opened after repeated failures"
                );
            }
            _ => {}
        }
    }

    /// Current state, without side effects.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock();
        CircuitStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure_reason: inner.last_failure_reason,
            seconds_since_last_failure: inner.last_failure.map(|at| at.elapsed().as_secs_f64()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Reset to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.last_failure_reason = None;
        inner.trial_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
        })
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold() {
        let cb = breaker(2, 30);

        cb.record_failure(FailureReason::Network);
        assert!(cb.can_execute());

        cb.record_failure(FailureReason::Network);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker(3, 30);

        cb.record_failure(FailureReason::Timeout);
        cb.record_failure(FailureReason::Timeout);
        cb.record_success();

        cb.record_failure(FailureReason::Timeout);
        cb.record_failure(FailureReason::Timeout);
        assert!(cb.can_execute());
        assert_eq!(cb.status().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_only_after_timeout() {
        let cb = breaker(1, 30);
        cb.record_failure(FailureReason::Network);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!cb.can_execute());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let cb = breaker(1, 10);
        cb.record_failure(FailureReason::Network);
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(cb.can_execute());
        assert!(!cb.can_execute());
        assert!(!cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
        assert!(cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(3, 10);
        for _ in 0..3 {
            cb.record_failure(FailureReason::Timeout);
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.can_execute());

        cb.record_failure(FailureReason::Timeout);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());

        // The timeout restarts from the failed trial.
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!cb.can_execute());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.can_execute());
    }

    #[test]
    fn test_status_reports_last_reason() {
        let cb = breaker(5, 10);
        cb.record_failure(FailureReason::Model);

        let status = cb.status();
        assert_eq!(status.last_failure_reason, Some(FailureReason::Model));
        assert_eq!(status.consecutive_failures, 1);

        cb.reset();
        assert_eq!(cb.status().last_failure_reason, None);
    }
}
