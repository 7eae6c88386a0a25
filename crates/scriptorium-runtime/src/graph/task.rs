//! Task trait and common types.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::resilience::PartialResults;

/// Everything a task body receives.
#[derive(Debug, Clone)]
pub struct TaskInput {
    /// Id of the node being executed
    pub task_id: String,

    /// Arguments captured at registration
    pub args: Value,

    /// Results of the direct dependencies, by dependency id
    pub dependencies: BTreeMap<String, Value>,

    /// Sink for usable output produced before a failure
    pub partials: PartialResults,
}

impl TaskInput {
    /// Result of one dependency.
    pub fn dependency(&self, id: &str) -> Option<&Value> {
        self.dependencies.get(id)
    }

    /// Sum of all dependency results that are integers.
    pub fn sum_dependencies(&self) -> i64 {
        self.dependencies.values().filter_map(Value::as_i64).sum()
    }
}

/// A unit of work in a task graph.
///
/// The runtime never looks inside a task. It only sees the returned value,
/// or classifies the returned error to decide on retries. A task may be
/// called more than once when the retry policy allows it.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, input: TaskInput) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`Task`].
pub struct FnTask<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, input: TaskInput) -> anyhow::Result<Value> {
        (self.f)(input).await
    }
}

/// Wrap an async closure as a shareable task.
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn Task>
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnTask { f })
}
