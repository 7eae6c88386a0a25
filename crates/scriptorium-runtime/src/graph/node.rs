//! Graph nodes and their errors.

use scriptorium_core::{CacheKey, FailureReason, TaskState};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use super::task::Task;

/// Errors from graph construction and scheduling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Unknown task id: {0}")]
    UnknownTask(String),

    #[error("Task '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task '{id}' is not ready; waiting on {waiting_on:?}")]
    NotReady { id: String, waiting_on: Vec<String> },
}

/// Failure recorded on a node after its task gave up.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("Task '{task_id}' failed after {attempts} attempt(s) [{reason}]: {message}")]
pub struct TaskExecutionError {
    pub task_id: String,
    pub reason: FailureReason,
    pub message: String,
    pub attempts: u32,
}

/// One registered unit of work and its execution record.
pub struct TaskNode {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) args: Value,
    pub(crate) dependencies: Vec<String>,
    pub(crate) state: TaskState,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<TaskExecutionError>,
    pub(crate) cache_key: Option<CacheKey>,
    pub(crate) attempts: u32,
    pub(crate) partial_results: Vec<Value>,
}

impl TaskNode {
    pub(crate) fn new(
        id: String,
        name: String,
        task: Arc<dyn Task>,
        args: Value,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            id,
            name,
            task,
            args,
            dependencies,
            state: TaskState::Pending,
            result: None,
            error: None,
            cache_key: None,
            attempts: 0,
            partial_results: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&TaskExecutionError> {
        self.error.as_ref()
    }

    /// Key derived when the node last started running.
    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    /// Calls made to the task body, retries included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Output salvaged from a failed run.
    pub fn partial_results(&self) -> &[Value] {
        &self.partial_results
    }

    /// Move to `next`, refusing anything the state machine forbids.
    pub(crate) fn transition(&mut self, next: TaskState) -> Result<(), GraphError> {
        if !self.state.can_transition_to(next) {
            return Err(GraphError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}
