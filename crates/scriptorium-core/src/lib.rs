//! # scriptorium-core
//!
//! Deterministic building blocks for the Scriptorium pipeline runtime.
//!
//! Nothing in this crate performs I/O, spawns work or reads the clock for
//! decisions. It answers:
//! - What state is a task in, and may it move on?
//! - What kind of failure is this, and is it worth retrying?
//! - Has a resource budget been crossed?
//! - Which cached result or checkpoint belongs to these inputs?
//!
//! The async scheduler, circuit breaker, budget counters and on-disk bundle
//! live in `scriptorium-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use scriptorium_core::{classify_failure, FailureReason, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let reason = classify_failure("connection reset by peer");
//!
//! assert_eq!(reason, FailureReason::Network);
//! assert!(policy.should_retry(reason, 0));
//! ```

pub mod budget;
pub mod checkpoint;
pub mod digest;
pub mod failure;
pub mod retry;
pub mod types;

// Re-export main types at crate root
pub use budget::{Budget, BudgetExceeded, BudgetStatus, BudgetUsage, Resource, ResourceStatus};
pub use checkpoint::{summarize, Checkpoint, SUMMARY_LIMIT};
pub use digest::{manifest_hash, manifest_hash_bytes, CacheKey};
pub use failure::{classify_failure, FailureReason};
pub use retry::RetryPolicy;
pub use types::{ExecutionMode, GraphStats, TaskState, UnknownMode};
