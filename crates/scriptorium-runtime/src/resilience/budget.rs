//! Budget governor: thread-safe consumption counters checked against limits.
//!
//! Every `use_*` call adds to its counter first and checks second, so the
//! call that crosses a limit is the one that fails.

use parking_lot::Mutex;
use scriptorium_core::{
    Budget, BudgetExceeded, BudgetStatus, BudgetUsage, ExecutionMode, Resource,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Tracks tokens, wall-clock time, API calls and chunks for one run.
pub struct BudgetGovernor {
    budget: Budget,
    started: Instant,
    tokens: AtomicU64,
    api_calls: AtomicU64,
    chunks: AtomicU64,
    warnings: Mutex<Vec<String>>,
}

impl BudgetGovernor {
    /// Create a governor; the time budget starts now.
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            started: Instant::now(),
            tokens: AtomicU64::new(0),
            api_calls: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Create a governor with the canned profile for `mode`.
    pub fn for_mode(mode: ExecutionMode) -> Self {
        Self::new(Budget::for_mode(mode))
    }

    /// Record model token usage.
    pub fn use_tokens(&self, tokens: u64) -> Result<(), BudgetExceeded> {
        let used = add(&self.tokens, tokens);
        self.check(Resource::Tokens, used as f64)
    }

    /// Record one external API call.
    pub fn use_api_call(&self) -> Result<(), BudgetExceeded> {
        let used = add(&self.api_calls, 1);
        self.check(Resource::ApiCalls, used as f64)
    }

    /// Record processed chunks.
    pub fn use_chunk(&self, chunks: u64) -> Result<(), BudgetExceeded> {
        let used = add(&self.chunks, chunks);
        self.check(Resource::Chunks, used as f64)
    }

    /// Check elapsed wall-clock time against the time budget.
    pub fn check_time(&self) -> Result<(), BudgetExceeded> {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.check(Resource::Time, elapsed)
    }

    /// Non-failing poll: true once any resource has nothing left.
    ///
    /// Meant for scheduling loops, to stop before starting the next unit
    /// of work rather than failing inside it.
    pub fn should_stop(&self) -> bool {
        let usage = self.usage();
        Resource::ALL
            .iter()
            .any(|&r| self.budget.limit(r) - usage.used(r) <= 0.0)
    }

    /// Snapshot of cumulative consumption.
    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            tokens: self.tokens.load(Ordering::SeqCst),
            elapsed: self.started.elapsed(),
            api_calls: self.api_calls.load(Ordering::SeqCst),
            chunks: self.chunks.load(Ordering::SeqCst),
            warnings: self.warnings.lock().clone(),
        }
    }

    /// Per-resource status for dashboards.
    pub fn get_status(&self) -> BudgetStatus {
        BudgetStatus::from_usage(&self.budget, &self.usage())
    }

    /// Percentage of each resource still available.
    pub fn remaining(&self) -> BTreeMap<Resource, f64> {
        self.get_status()
            .resources
            .into_iter()
            .map(|(resource, status)| (resource, status.percent_remaining))
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    fn check(&self, resource: Resource, used: f64) -> Result<(), BudgetExceeded> {
        match self.budget.check(resource, used) {
            Ok(Some(warning)) => {
                let mut warnings = self.warnings.lock();
                if !warnings.contains(&warning) {
                    tracing::warn!(%resource, used, limit = self.budget.limit(resource), "{warning}");
                    warnings.push(warning);
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(exceeded) => {
                tracing::warn!(
                    %resource,
                    used = exceeded.used,
                    limit = exceeded.limit,
                    "Budget exceeded"
                );
                Err(exceeded)
            }
        }
    }
}

impl Default for BudgetGovernor {
    fn default() -> Self {
        Self::new(Budget::default())
    }
}

/// Saturating atomic add returning the new total.
fn add(counter: &AtomicU64, amount: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_add(amount))
        })
        .unwrap_or_else(|current| current);
    previous.saturating_add(amount)
}
