//! Dependency-ordered task scheduler.
//!
//! A [`TaskGraph`] runs its nodes in rounds. Each round takes every pending
//! node whose dependencies all completed (or were served from cache) and
//! runs them, one after another or spawned on the tokio runtime with at
//! most `max_workers` in flight. Outcomes are applied to the node table
//! before the next round is computed, so a dependent always sees its
//! dependencies' results.
//!
//! A failed node is recorded and never re-raised; its dependents simply
//! stay pending.

mod node;
mod task;

pub use node::{GraphError, TaskExecutionError, TaskNode};
pub use task::{task_fn, FnTask, Task, TaskInput};

use futures::stream::{self, StreamExt};
use scriptorium_core::{BudgetExceeded, CacheKey, FailureReason, GraphStats, TaskState};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::cache::Lookup;
use crate::context::RuntimeContext;
use crate::resilience::{with_retry, PartialResults, RetryError};

/// Why a cache-miss execution gave up.
#[derive(Error, Debug)]
enum RunFailure {
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    #[error(transparent)]
    Retry(#[from] RetryError),
}

impl RunFailure {
    fn reason(&self) -> FailureReason {
        match self {
            Self::Budget(_) => FailureReason::Budget,
            Self::Retry(e) => e.reason().unwrap_or(FailureReason::Unknown),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Retry(RetryError::Exhausted { source, .. }) => format!("{source:#}"),
            other => other.to_string(),
        }
    }

    fn partial(&self) -> Vec<Value> {
        match self {
            Self::Retry(RetryError::Exhausted { partial, .. }) => partial.clone(),
            _ => Vec::new(),
        }
    }
}

/// A node taken out of the table to run, holding everything it needs.
struct Prepared {
    id: String,
    name: String,
    task: Arc<dyn Task>,
    input: TaskInput,
    key: CacheKey,
}

struct Failure {
    reason: FailureReason,
    message: String,
    partial: Vec<Value>,
}

struct Outcome {
    id: String,
    attempts: u32,
    result: Result<Lookup, Failure>,
}

/// DAG of tasks executed against a shared [`RuntimeContext`].
pub struct TaskGraph {
    ctx: Arc<RuntimeContext>,
    nodes: HashMap<String, TaskNode>,
    /// Registration order; every listing follows it
    order: Vec<String>,
}

impl TaskGraph {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            ctx,
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    /// Register a task.
    ///
    /// Dependencies may name tasks registered later. A dependency that is
    /// never registered keeps this task pending forever.
    pub fn add_task(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        task: Arc<dyn Task>,
        args: Value,
        dependencies: &[&str],
    ) -> Result<(), GraphError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateTask(id));
        }

        let dependencies: Vec<String> = dependencies.iter().map(|d| d.to_string()).collect();
        debug!(task_id = %id, ?dependencies, "Task registered");

        let node = TaskNode::new(id.clone(), name.into(), task, args, dependencies);
        self.order.push(id.clone());
        self.nodes.insert(id, node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Pending tasks whose dependencies are all completed or skipped.
    pub fn get_ready_tasks(&self) -> Vec<String> {
        self.nodes()
            .filter(|node| node.state == TaskState::Pending && self.waiting_on(node).is_empty())
            .map(|node| node.id.clone())
            .collect()
    }

    /// Run one task now.
    ///
    /// The task must be pending with every dependency satisfied. Its own
    /// failure is recorded on the node and reported through the returned
    /// state, not as an error.
    pub async fn execute_task(&mut self, id: &str) -> Result<TaskState, GraphError> {
        let prepared = self.prepare(id)?;
        let outcome = run_isolated(Arc::clone(&self.ctx), prepared).await;
        self.apply(outcome)
    }

    /// Run every currently ready task once; returns the ids that ran.
    pub async fn run_round(&mut self, parallel: bool) -> Vec<String> {
        let ready = self.get_ready_tasks();
        let mut ran = Vec::with_capacity(ready.len());

        if !parallel {
            for id in ready {
                match self.execute_task(&id).await {
                    Ok(_) => ran.push(id),
                    Err(e) => warn!(task_id = %id, error = %e, "Could not run task"),
                }
            }
            return ran;
        }

        let mut prepared = Vec::with_capacity(ready.len());
        for id in ready {
            match self.prepare(&id) {
                Ok(p) => prepared.push(p),
                Err(e) => warn!(task_id = %id, error = %e, "Could not run task"),
            }
        }

        let workers = self.ctx.config().max_workers.max(1);
        let ctx = Arc::clone(&self.ctx);
        let outcomes: Vec<Outcome> = stream::iter(prepared)
            .map(|p| run_isolated(Arc::clone(&ctx), p))
            .buffer_unordered(workers)
            .collect()
            .await;

        for outcome in outcomes {
            let id = outcome.id.clone();
            match self.apply(outcome) {
                Ok(_) => ran.push(id),
                Err(e) => warn!(task_id = %id, error = %e, "Could not record task outcome"),
            }
        }
        ran
    }

    /// Run rounds until nothing is ready or the budget says stop.
    ///
    /// Returns the results of every task that finished, including ones
    /// served from cache.
    pub async fn execute(&mut self, parallel: bool) -> BTreeMap<String, Value> {
        info!(tasks = self.len(), parallel, "Executing task graph");

        let mut rounds = 0usize;
        loop {
            if self.ctx.budget().should_stop() {
                warn!(rounds, "Budget exhausted, halting scheduling");
                break;
            }
            if self.run_round(parallel).await.is_empty() {
                break;
            }
            rounds += 1;
        }

        let stats = self.get_stats();
        info!(
            rounds,
            completed = stats.completed,
            skipped = stats.skipped,
            failed = stats.failed,
            pending = stats.pending,
            "Task graph finished"
        );
        self.get_results()
    }

    /// Dependency-first ordering (DFS postorder over registration order).
    pub fn get_execution_order(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(self.order.len());
        for id in &self.order {
            self.visit(id, &mut visited, &mut order);
        }
        order
    }

    fn visit<'a>(&'a self, id: &'a str, visited: &mut HashSet<&'a str>, order: &mut Vec<String>) {
        if !visited.insert(id) {
            return;
        }
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        for dep in &node.dependencies {
            self.visit(dep, visited, order);
        }
        order.push(node.id.clone());
    }

    pub fn get_stats(&self) -> GraphStats {
        let mut stats = GraphStats::default();
        for node in self.nodes.values() {
            stats.record(node.state);
        }
        stats
    }

    /// Results of completed and skipped tasks.
    pub fn get_results(&self) -> BTreeMap<String, Value> {
        self.nodes()
            .filter(|node| node.state.satisfies_dependents())
            .filter_map(|node| Some((node.id.clone(), node.result.clone()?)))
            .collect()
    }

    pub fn get_errors(&self) -> BTreeMap<String, TaskExecutionError> {
        self.nodes()
            .filter_map(|node| Some((node.id.clone(), node.error.clone()?)))
            .collect()
    }

    /// Ids of completed and skipped tasks, in registration order.
    pub fn finished_ids(&self) -> Vec<String> {
        self.nodes()
            .filter(|node| node.state.satisfies_dependents())
            .map(|node| node.id.clone())
            .collect()
    }

    /// Ids of everything not yet finished successfully.
    pub fn unfinished_ids(&self) -> Vec<String> {
        self.nodes()
            .filter(|node| !node.state.satisfies_dependents())
            .map(|node| node.id.clone())
            .collect()
    }

    /// Mark a pending task completed with a result from an earlier run.
    pub fn restore_completed(&mut self, id: &str, value: Value) -> Result<(), GraphError> {
        let node = self.node_mut(id)?;
        if node.state != TaskState::Pending {
            return Err(GraphError::InvalidTransition {
                id: id.to_string(),
                from: node.state,
                to: TaskState::Completed,
            });
        }
        node.transition(TaskState::Completed)?;
        node.result = Some(value);
        debug!(task_id = %id, "Task restored");
        Ok(())
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut TaskNode, GraphError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))
    }

    fn waiting_on(&self, node: &TaskNode) -> Vec<String> {
        node.dependencies
            .iter()
            .filter(|dep| {
                !self
                    .nodes
                    .get(dep.as_str())
                    .is_some_and(|n| n.state.satisfies_dependents())
            })
            .cloned()
            .collect()
    }

    /// Check readiness, derive the cache key and mark the node running.
    fn prepare(&mut self, id: &str) -> Result<Prepared, GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownTask(id.to_string()))?;

        if node.state != TaskState::Pending {
            return Err(GraphError::InvalidTransition {
                id: id.to_string(),
                from: node.state,
                to: TaskState::Running,
            });
        }
        let waiting_on = self.waiting_on(node);
        if !waiting_on.is_empty() {
            return Err(GraphError::NotReady {
                id: id.to_string(),
                waiting_on,
            });
        }

        let dependencies: BTreeMap<String, Value> = node
            .dependencies
            .iter()
            .filter_map(|dep| {
                let result = self.nodes.get(dep.as_str())?.result.clone();
                Some((dep.clone(), result.unwrap_or(Value::Null)))
            })
            .collect();
        let key = CacheKey::compute(&node.name, &node.args, &dependencies);

        let prepared = Prepared {
            id: node.id.clone(),
            name: node.name.clone(),
            task: Arc::clone(&node.task),
            input: TaskInput {
                task_id: node.id.clone(),
                args: node.args.clone(),
                dependencies,
                partials: PartialResults::new(),
            },
            key: key.clone(),
        };

        let node = self.node_mut(id)?;
        node.transition(TaskState::Running)?;
        node.cache_key = Some(key);
        Ok(prepared)
    }

    /// Record a finished run on its node.
    fn apply(&mut self, outcome: Outcome) -> Result<TaskState, GraphError> {
        let node = self.node_mut(&outcome.id)?;
        node.attempts += outcome.attempts;

        match outcome.result {
            Ok(Lookup::Computed(value)) => {
                node.transition(TaskState::Completed)?;
                node.result = Some(value);
                info!(task_id = %node.id, attempts = node.attempts, "Task completed");
            }
            Ok(Lookup::Cached(value)) => {
                node.transition(TaskState::Skipped)?;
                node.result = Some(value);
                info!(task_id = %node.id, "Cache hit, task skipped");
            }
            Err(failure) => {
                node.transition(TaskState::Failed)?;
                warn!(
                    task_id = %node.id,
                    reason = %failure.reason,
                    attempts = node.attempts,
                    error = %failure.message,
                    "Task failed"
                );
                node.error = Some(TaskExecutionError {
                    task_id: node.id.clone(),
                    reason: failure.reason,
                    message: failure.message,
                    attempts: node.attempts,
                });
                node.partial_results = failure.partial;
            }
        }
        Ok(node.state)
    }
}

/// Run a prepared task on its own tokio task so a panic in the task body
/// becomes a failed outcome instead of unwinding into the scheduler.
async fn run_isolated(ctx: Arc<RuntimeContext>, prepared: Prepared) -> Outcome {
    let id = prepared.id.clone();
    match tokio::spawn(run_prepared(ctx, prepared)).await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            warn!(task_id = %id, error = %join_error, "Task panicked");
            Outcome {
                id,
                attempts: 0,
                result: Err(Failure {
                    reason: FailureReason::Unknown,
                    message: format!("task panicked: {join_error}"),
                    partial: Vec::new(),
                }),
            }
        }
    }
}

/// Run a prepared task through the cache, budget, tracer and retry layers.
async fn run_prepared(ctx: Arc<RuntimeContext>, prepared: Prepared) -> Outcome {
    let Prepared {
        id,
        name,
        task,
        input,
        key,
    } = prepared;
    let span = tracing::info_span!("task", task_id = %id, task = %name);

    async move {
        let attempts = AtomicU32::new(0);

        let init = async {
            ctx.budget().check_time()?;

            let metadata = BTreeMap::from([
                ("task_id".to_string(), id.clone()),
                ("cache_key".to_string(), key.to_string()),
            ]);
            let span_id = ctx.tracer().start_span(&name, &metadata);

            let result = with_retry(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    task.run(input.clone())
                },
                ctx.retry_policy(),
                ctx.breaker(),
                &input.partials,
            )
            .await;

            ctx.tracer()
                .end_span(span_id, result.as_ref().map_or(0, item_count));
            Ok::<Value, RunFailure>(result?)
        };

        let result = ctx.cache().get_or_try_insert(key.clone(), init).await;
        let result = result.map_err(|failure| Failure {
            reason: failure.reason(),
            message: failure.message(),
            partial: failure.partial(),
        });

        Outcome {
            id,
            attempts: attempts.load(Ordering::SeqCst),
            result,
        }
    }
    .instrument(span)
    .await
}

fn item_count(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        _ => 1,
    }
}
