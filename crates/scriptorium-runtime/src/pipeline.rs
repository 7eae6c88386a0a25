//! Resumable pipeline driver.
//!
//! Ties a [`TaskGraph`] to a [`StreamingBundle`]. A run:
//! 1. resumes from the staged checkpoint when its manifest hash matches,
//!    restoring finished tasks from their artifacts (a mismatching
//!    checkpoint discards the staging area instead),
//! 2. runs scheduling rounds until nothing is ready or the budget is spent,
//!    writing the artifacts of finished tasks and a checkpoint after each,
//! 3. finalizes the bundle if every task finished, otherwise leaves the
//!    staging area for the next attempt.

use scriptorium_core::{summarize, GraphStats, TaskState};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::bundle::{BundleSummary, StreamingBundle};
use crate::graph::{TaskExecutionError, TaskGraph};
use crate::RuntimeError;

/// Outcome of one [`Pipeline::run`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,

    /// Results of every finished task, restored ones included
    pub results: BTreeMap<String, Value>,

    pub errors: BTreeMap<String, TaskExecutionError>,

    pub stats: GraphStats,

    /// Tasks restored from the checkpoint instead of executed
    pub resumed: Vec<String>,

    pub rounds: usize,

    /// Scheduling stopped because a budget ran out
    pub budget_exhausted: bool,

    /// Present when the run completed and the bundle was published
    pub bundle: Option<BundleSummary>,
}

impl PipelineReport {
    pub fn is_complete(&self) -> bool {
        self.bundle.is_some()
    }
}

/// A task graph bound to its output bundle and manifest hash.
pub struct Pipeline {
    graph: TaskGraph,
    bundle: StreamingBundle,
    manifest_hash: String,
    parallel: bool,
}

impl Pipeline {
    pub fn new(graph: TaskGraph, bundle: StreamingBundle, manifest_hash: impl Into<String>) -> Self {
        Self {
            graph,
            bundle,
            manifest_hash: manifest_hash.into(),
            parallel: false,
        }
    }

    /// Run each round's ready tasks concurrently.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn bundle(&self) -> &StreamingBundle {
        &self.bundle
    }

    pub fn manifest_hash(&self) -> &str {
        &self.manifest_hash
    }

    #[instrument(skip(self), fields(run_id = %self.bundle.run_id(), parallel = self.parallel))]
    pub async fn run(&mut self) -> Result<PipelineReport, RuntimeError> {
        let resumed = self.resume()?;

        let mut rounds = 0;
        let budget_exhausted = loop {
            if self.graph.context().budget().should_stop() {
                warn!(rounds, "Budget exhausted, stopping before next round");
                break true;
            }
            let ran = self.graph.run_round(self.parallel).await;
            if ran.is_empty() {
                break false;
            }
            rounds += 1;
            self.persist(&ran)?;
        };

        let stats = self.graph.get_stats();
        let bundle = if stats.is_complete() {
            Some(self.bundle.finalize()?)
        } else {
            info!(
                failed = stats.failed,
                pending = stats.pending,
                "Run incomplete, staging kept for resume"
            );
            None
        };

        Ok(PipelineReport {
            run_id: self.bundle.run_id().to_string(),
            results: self.graph.get_results(),
            errors: self.graph.get_errors(),
            stats,
            resumed,
            rounds,
            budget_exhausted,
            bundle,
        })
    }

    /// Restore finished tasks from a matching checkpoint.
    fn resume(&mut self) -> Result<Vec<String>, RuntimeError> {
        let checkpoint = match self.bundle.load_checkpoint() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(error = %e, "Unreadable checkpoint, starting fresh");
                None
            }
        };
        let Some(checkpoint) = checkpoint else {
            return Ok(Vec::new());
        };

        if !checkpoint.matches(&self.manifest_hash) {
            info!(
                stored = %checkpoint.manifest_hash,
                current = %self.manifest_hash,
                "Manifest changed, discarding staged run"
            );
            self.bundle.cleanup()?;
            return Ok(Vec::new());
        }

        let mut restored = Vec::new();
        for id in &checkpoint.completed {
            match self.graph.node(id).map(|node| node.state()) {
                None => {
                    warn!(task_id = %id, "Checkpointed task is not registered, ignoring");
                    continue;
                }
                Some(TaskState::Pending) => {}
                // Already finished earlier in this pipeline's lifetime.
                Some(_) => continue,
            }
            match self.bundle.read_artifact(id) {
                Ok(value) => {
                    self.graph.restore_completed(id, value)?;
                    restored.push(id.clone());
                }
                Err(e) => warn!(task_id = %id, error = %e, "Artifact unavailable, task will rerun"),
            }
        }

        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            restored = restored.len(),
            "Resumed from checkpoint"
        );
        Ok(restored)
    }

    /// Write artifacts for tasks that just finished, then checkpoint.
    fn persist(&self, ran: &[String]) -> Result<(), RuntimeError> {
        for id in ran {
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            if !node.state().satisfies_dependents() {
                continue;
            }
            if let Some(value) = node.result() {
                self.bundle.write_artifact(id, value)?;
            }
        }

        let summaries = self
            .graph
            .get_results()
            .iter()
            .map(|(id, value)| (id.clone(), summarize(value)))
            .collect();
        self.bundle.save_checkpoint(
            self.graph.finished_ids(),
            self.graph.unfinished_ids(),
            summaries,
            &self.manifest_hash,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BUNDLE_FILE;
    use crate::config::RuntimeConfig;
    use crate::context::RuntimeContext;
    use crate::graph::{task_fn, Task};
    use anyhow::anyhow;
    use scriptorium_core::Budget;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting(calls: &Arc<AtomicU32>, value: Value) -> Arc<dyn Task> {
        let calls = Arc::clone(calls);
        task_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move { Ok::<_, anyhow::Error>(value) }
        })
    }

    fn doubling() -> Arc<dyn Task> {
        task_fn(|input| async move { Ok::<_, anyhow::Error>(json!(input.sum_dependencies() * 2)) })
    }

    fn broken() -> Arc<dyn Task> {
        task_fn(|_| async { Err::<Value, _>(anyhow!("malformed citation record")) })
    }

    /// Fresh context per run so only the checkpoint can carry results over.
    fn pipeline(
        root: &std::path::Path,
        hash: &str,
        calls: &Arc<AtomicU32>,
        second: Arc<dyn Task>,
    ) -> Pipeline {
        let mut graph = TaskGraph::new(Arc::new(RuntimeContext::default()));
        graph
            .add_task("collect", "collect", counting(calls, json!(21)), json!(null), &[])
            .unwrap();
        graph
            .add_task("analyze", "analyze", second, json!(null), &["collect"])
            .unwrap();
        Pipeline::new(graph, StreamingBundle::new(root, "run").unwrap(), hash)
    }

    #[tokio::test]
    async fn test_complete_run_is_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let mut pipeline = pipeline(dir.path(), "v1", &calls, doubling());
        let report = pipeline.run().await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.results["analyze"], json!(42));
        assert_eq!(report.rounds, 2);
        assert!(report.resumed.is_empty());

        let summary = report.bundle.unwrap();
        assert_eq!(summary.artifact_count, 2);
        assert!(summary.path.join(BUNDLE_FILE).is_file());
        assert!(!pipeline.bundle().staging_dir().exists());
    }

    #[tokio::test]
    async fn test_resume_does_not_rerun_finished_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let first = pipeline(dir.path(), "v1", &calls, broken()).run().await.unwrap();
        assert!(!first.is_complete());
        assert_eq!(first.stats.failed, 1);
        assert!(pipeline(dir.path(), "v1", &calls, doubling()).bundle().can_resume("v1"));

        let mut second = pipeline(dir.path(), "v1", &calls, doubling());
        let report = second.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.resumed, vec!["collect"]);
        assert_eq!(report.results["analyze"], json!(42));
        assert_eq!(
            second.graph().node("collect").unwrap().state(),
            TaskState::Completed
        );
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_rerun_on_same_pipeline_keeps_finished_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let mut pipeline = pipeline(dir.path(), "v1", &calls, broken());

        let first = pipeline.run().await.unwrap();
        assert!(!first.is_complete());

        let second = pipeline.run().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!second.is_complete());
        assert!(second.resumed.is_empty());
        assert_eq!(second.results["collect"], json!(21));
        assert_eq!(second.stats.failed, 1);
        assert!(pipeline.bundle().can_resume("v1"));
    }

    #[tokio::test]
    async fn test_changed_manifest_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        pipeline(dir.path(), "v1", &calls, broken()).run().await.unwrap();
        let report = pipeline(dir.path(), "v2", &calls, doubling())
            .run()
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(report.resumed.is_empty());
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_budget_stop_keeps_progress_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(
            RuntimeContext::builder()
                .config(RuntimeConfig {
                    budget: Some(Budget {
                        max_api_calls: 1,
                        ..Budget::quick()
                    }),
                    ..Default::default()
                })
                .build()
                .unwrap(),
        );

        let calling = {
            let ctx = Arc::clone(&ctx);
            task_fn(move |_| {
                // The crossing call still produced a result worth keeping.
                let _ = ctx.budget().use_api_call();
                async { Ok::<_, anyhow::Error>(json!("abstract")) }
            })
        };

        let mut graph = TaskGraph::new(ctx);
        graph.add_task("fetch", "fetch", calling, json!(null), &[]).unwrap();
        graph
            .add_task("summarize", "summarize", doubling(), json!(null), &["fetch"])
            .unwrap();

        let bundle = StreamingBundle::new(dir.path(), "run").unwrap();
        let mut pipeline = Pipeline::new(graph, bundle, "v1");
        let report = pipeline.run().await.unwrap();

        assert!(report.budget_exhausted);
        assert!(!report.is_complete());
        assert_eq!(pipeline.bundle().read_artifact("fetch").unwrap(), json!("abstract"));

        let checkpoint = pipeline.bundle().load_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.completed, vec!["fetch"]);
        assert_eq!(checkpoint.pending, vec!["summarize"]);
        assert_eq!(checkpoint.results["fetch"], "abstract");
    }
}
