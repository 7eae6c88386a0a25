//! # scriptorium-runtime
//!
//! Async execution runtime for research pipelines.
//!
//! Units of work are registered on a [`TaskGraph`] with their
//! dependencies and run in dependency order, sequentially or on a bounded
//! set of tokio tasks. Every invocation goes through the same layers:
//!
//! - a result cache keyed by task name, arguments and dependency results,
//!   so identical work runs at most once per [`RuntimeContext`]
//! - the budget governor, which stops scheduling once a resource is spent
//! - retry with backoff behind a circuit breaker
//! - a span collaborator ([`Tracer`])
//!
//! [`Pipeline`] adds durability: finished results stream into a
//! [`StreamingBundle`] with a checkpoint per round, so an interrupted run
//! resumes without redoing finished tasks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scriptorium_runtime::{task_fn, RuntimeContext, TaskGraph};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = TaskGraph::new(Arc::new(RuntimeContext::default()));
//!
//! let fetch = task_fn(|_| async { Ok::<_, anyhow::Error>(json!(21)) });
//! let double = task_fn(|input| async move {
//!     Ok::<_, anyhow::Error>(json!(input.sum_dependencies() * 2))
//! });
//! graph.add_task("fetch", "fetch", fetch, json!(null), &[])?;
//! graph.add_task("double", "double", double, json!(null), &["fetch"])?;
//!
//! let results = graph.execute(false).await;
//! assert_eq!(results["double"], json!(42));
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod cache;
pub mod config;
pub mod context;
pub mod graph;
pub mod pipeline;
pub mod resilience;
pub mod tracer;

pub use bundle::{BundleDocument, BundleError, BundleSummary, StreamingBundle};
pub use cache::{Lookup, ResultCache};
pub use config::{ConfigError, RuntimeConfig};
pub use context::{RuntimeContext, RuntimeContextBuilder};
pub use graph::{task_fn, GraphError, Task, TaskExecutionError, TaskGraph, TaskInput, TaskNode};
pub use pipeline::{Pipeline, PipelineReport};
pub use resilience::{
    with_retry, BudgetGovernor, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    CircuitStatus, PartialResults, RetryError,
};
pub use tracer::{LogTracer, SpanId, Tracer};

use scriptorium_core::BudgetExceeded;
use thiserror::Error;

/// Any error the runtime can surface to a caller.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetExceeded),
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptorium_core::Resource;

    #[test]
    fn test_errors_convert_into_runtime_error() {
        let err: RuntimeError = GraphError::DuplicateTask("a".to_string()).into();
        assert_eq!(err.to_string(), "Graph error: Duplicate task id: a");

        let err: RuntimeError = BudgetExceeded {
            resource: Resource::Chunks,
            used: 3.0,
            limit: 2.0,
        }
        .into();
        assert!(matches!(err, RuntimeError::Budget(_)));
    }
}
