//! Retry with backoff, guarded by the circuit breaker.

use backon::Retryable;
use parking_lot::Mutex;
use scriptorium_core::{classify_failure, FailureReason, RetryPolicy};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::CircuitBreaker;

/// Errors from [`with_retry`].
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("circuit breaker is open; call refused")]
    CircuitOpen,

    #[error("failed after {attempts} attempt(s) [{reason}]: {source:#}")]
    Exhausted {
        attempts: u32,
        reason: FailureReason,
        #[source]
        source: anyhow::Error,
        /// Partial results pushed before the final failure
        partial: Vec<Value>,
    },
}

impl RetryError {
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::CircuitOpen => None,
            Self::Exhausted { reason, .. } => Some(*reason),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen => 0,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Side channel for work produced before a call ultimately fails.
///
/// Cloning shares the same buffer. Calls push whatever usable output they
/// have; if every attempt fails the buffer is drained into
/// [`RetryError::Exhausted`].
#[derive(Debug, Clone, Default)]
pub struct PartialResults {
    items: Arc<Mutex<Vec<Value>>>,
}

impl PartialResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.items.lock().push(value.into());
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.items.lock().clone()
    }

    /// Drain everything collected so far.
    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.items.lock())
    }
}

#[derive(Error, Debug)]
enum Attempt {
    #[error("refused by open circuit")]
    Refused,

    #[error("{error:#}")]
    Failed {
        reason: FailureReason,
        error: anyhow::Error,
    },
}

/// Delays taken straight from [`RetryPolicy::get_delay`], one per retry.
#[derive(Debug, Clone)]
struct PolicyBackoff<'a> {
    policy: &'a RetryPolicy,
    next: u32,
}

impl Iterator for PolicyBackoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.next >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.get_delay(self.next);
        self.next += 1;
        Some(delay)
    }
}

/// A call the breaker let through.
///
/// Reports the result to the breaker. If the call panics or is dropped
/// before reporting, the drop counts as a failure so a half-open trial
/// never stays in flight forever.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    resolved: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            resolved: false,
        }
    }

    fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    fn fail(mut self, reason: FailureReason) {
        self.resolved = true;
        self.breaker.record_failure(reason);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!("Admitted call abandoned before completing, counting it as a failure");
            self.breaker.record_failure(FailureReason::Unknown);
        }
    }
}

/// Run `call` under `policy`, consulting `breaker` before every attempt.
///
/// Refuses with [`RetryError::CircuitOpen`] without calling anything when
/// the breaker is open. Each failure is classified and recorded on the
/// breaker; retryable failures are retried after the policy's backoff.
/// When retries run out the last error is returned together with anything
/// pushed to `partials`.
pub async fn with_retry<T, F, Fut>(
    mut call: F,
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    partials: &PartialResults,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if !breaker.can_execute() {
        tracing::warn!("Circuit open, refusing call");
        return Err(RetryError::CircuitOpen);
    }

    let attempts = AtomicU32::new(0);
    let backoff = PolicyBackoff { policy, next: 0 };

    let attempt = || {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        // The first attempt was admitted above.
        let admitted = n == 0 || breaker.can_execute();
        let admission = admitted.then(|| Admission::new(breaker));
        let pending = admission.as_ref().map(|_| call());
        async move {
            let (Some(admission), Some(pending)) = (admission, pending) else {
                return Err(Attempt::Refused);
            };
            match pending.await {
                Ok(value) => {
                    admission.succeed();
                    Ok(value)
                }
                Err(error) => {
                    let reason = classify_failure(&format!("{error:#}"));
                    admission.fail(reason);
                    Err(Attempt::Failed { reason, error })
                }
            }
        }
    };

    let outcome = attempt
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|e: &Attempt| match e {
            Attempt::Refused => false,
            Attempt::Failed { reason, .. } => {
                let attempt = attempts.load(Ordering::SeqCst).saturating_sub(1);
                policy.should_retry(*reason, attempt)
            }
        })
        .notify(|e: &Attempt, delay: Duration| {
            tracing::warn!(error = %e, ?delay, "Attempt failed, retrying");
        })
        .await;

    match outcome {
        Ok(value) => Ok(value),
        Err(Attempt::Refused) => {
            tracing::warn!("Circuit opened between attempts, giving up");
            Err(RetryError::CircuitOpen)
        }
        Err(Attempt::Failed { reason, error }) => Err(RetryError::Exhausted {
            attempts: attempts.load(Ordering::SeqCst),
            reason,
            source: error,
            partial: partials.take(),
        }),
    }
}
