//! Resource budgets: limits, profiles and threshold checks.
//!
//! This module holds the pure parts of budget enforcement. The thread-safe
//! counters live in `scriptorium-runtime`'s `BudgetGovernor`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::{duration_serde, ExecutionMode};

/// A budgeted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Tokens,
    Time,
    ApiCalls,
    Chunks,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::Tokens,
        Resource::Time,
        Resource::ApiCalls,
        Resource::Chunks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::Time => "time",
            Self::ApiCalls => "api_calls",
            Self::Chunks => "chunks",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hard limit was reached.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{resource} budget exceeded: used {used}, limit {limit}")]
pub struct BudgetExceeded {
    pub resource: Resource,
    pub used: f64,
    pub limit: f64,
}

/// Limits for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum model tokens
    pub max_tokens: u64,

    /// Maximum wall-clock time
    #[serde(with = "duration_serde")]
    pub max_time: Duration,

    /// Maximum external API calls
    pub max_api_calls: u64,

    /// Maximum processed chunks/items
    pub max_chunks: u64,

    /// Usage ratio at which a warning is recorded
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
}

fn default_warn_ratio() -> f64 {
    0.8
}

impl Budget {
    /// Tight ceilings for fast runs.
    pub fn quick() -> Self {
        Self {
            max_tokens: 50_000,
            max_time: Duration::from_secs(5 * 60),
            max_api_calls: 50,
            max_chunks: 200,
            warn_ratio: default_warn_ratio(),
        }
    }

    /// Generous ceilings for thorough runs.
    pub fn deep() -> Self {
        Self {
            max_tokens: 500_000,
            max_time: Duration::from_secs(60 * 60),
            max_api_calls: 500,
            max_chunks: 5_000,
            warn_ratio: default_warn_ratio(),
        }
    }

    /// Canned profile for an execution mode.
    pub fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Quick => Self::quick(),
            ExecutionMode::Deep => Self::deep(),
        }
    }

    /// Limit for `resource`; time is expressed in seconds.
    pub fn limit(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Tokens => self.max_tokens as f64,
            Resource::Time => self.max_time.as_secs_f64(),
            Resource::ApiCalls => self.max_api_calls as f64,
            Resource::Chunks => self.max_chunks as f64,
        }
    }

    /// Check `used` against the limit for `resource`.
    ///
    /// Returns `Err` when the usage ratio is at or above 1.0, `Ok(Some(warning))`
    /// when it is at or above the warn ratio, and `Ok(None)` otherwise.
    pub fn check(&self, resource: Resource, used: f64) -> Result<Option<String>, BudgetExceeded> {
        let limit = self.limit(resource);
        let ratio = usage_ratio(used, limit);

        if ratio >= 1.0 {
            return Err(BudgetExceeded {
                resource,
                used,
                limit,
            });
        }
        if ratio >= self.warn_ratio {
            return Ok(Some(self.warning_for(resource)));
        }
        Ok(None)
    }

    /// The warning recorded once a resource passes the warn ratio.
    ///
    /// The text is fixed per resource so repeated checks produce the same
    /// string and can be deduplicated.
    pub fn warning_for(&self, resource: Resource) -> String {
        format!(
            "{resource} usage passed {:.0}% of budget",
            self.warn_ratio * 100.0
        )
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::quick()
    }
}

/// `used / limit`, where a zero limit counts as already exhausted.
pub fn usage_ratio(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        f64::INFINITY
    } else {
        used / limit
    }
}

/// Snapshot of cumulative consumption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub tokens: u64,
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
    pub api_calls: u64,
    pub chunks: u64,
    pub warnings: Vec<String>,
}

impl BudgetUsage {
    /// Usage of `resource`; time is expressed in seconds.
    pub fn used(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Tokens => self.tokens as f64,
            Resource::Time => self.elapsed.as_secs_f64(),
            Resource::ApiCalls => self.api_calls as f64,
            Resource::Chunks => self.chunks as f64,
        }
    }
}

/// Per-resource status for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub used: f64,
    pub limit: f64,
    pub percent_used: f64,
    pub percent_remaining: f64,
}

impl ResourceStatus {
    pub fn new(used: f64, limit: f64) -> Self {
        let ratio = usage_ratio(used, limit);
        let percent_used = if ratio.is_finite() { ratio * 100.0 } else { 100.0 };
        Self {
            used,
            limit,
            percent_used,
            percent_remaining: (100.0 - percent_used).max(0.0),
        }
    }

    /// True once nothing is left.
    pub fn is_exhausted(&self) -> bool {
        self.limit - self.used <= 0.0
    }
}

/// Full budget status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub resources: BTreeMap<Resource, ResourceStatus>,
    pub warnings: Vec<String>,
    pub should_stop: bool,
}

impl BudgetStatus {
    /// Build a status from limits and a usage snapshot.
    pub fn from_usage(budget: &Budget, usage: &BudgetUsage) -> Self {
        let resources: BTreeMap<Resource, ResourceStatus> = Resource::ALL
            .iter()
            .map(|&r| (r, ResourceStatus::new(usage.used(r), budget.limit(r))))
            .collect();
        let should_stop = resources.values().any(ResourceStatus::is_exhausted);

        Self {
            resources,
            warnings: usage.warnings.clone(),
            should_stop,
        }
    }

    /// Flat `"<resource>_percent_used" -> value` map.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        for (resource, status) in &self.resources {
            map.insert(format!("{resource}_used"), status.used);
            map.insert(format!("{resource}_limit"), status.limit);
            map.insert(format!("{resource}_percent_used"), status.percent_used);
        }
        map
    }
}
