//! Resilience patterns for scriptorium-runtime.
//!
//! This module provides:
//! - Circuit breaker to prevent cascade failures
//! - Multi-resource budget governor
//! - Retry with backoff and partial-result salvage

mod budget;
mod circuit_breaker;
mod retry;

pub use budget::BudgetGovernor;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus};
pub use retry::{with_retry, PartialResults, RetryError};
