//! Shared types for the pipeline runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a task node.
///
/// Transitions are monotonic:
/// `Pending -> Running -> {Completed, Failed, Skipped}`, plus
/// `Pending -> Completed` when a result is restored from a checkpoint.
/// Completed, Failed and Skipped never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Result reused from the cache; the callable was not invoked.
    Skipped,
}

impl TaskState {
    /// Whether the state can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether a dependent may start once its dependency is in this state.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Completed) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Skipped) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task counts by state, as reported after (or during) a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl GraphStats {
    /// Count one more task in `state`.
    pub fn record(&mut self, state: TaskState) {
        self.total += 1;
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Running => self.running += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Skipped => self.skipped += 1,
        }
    }

    /// True when every task finished successfully (completed or reused).
    pub fn is_complete(&self) -> bool {
        self.completed + self.skipped == self.total
    }

    /// Flat name -> count map for dashboards.
    pub fn to_map(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("total", self.total),
            ("pending", self.pending),
            ("running", self.running),
            ("completed", self.completed),
            ("failed", self.failed),
            ("skipped", self.skipped),
        ])
    }
}

/// Execution mode, selecting a canned budget profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fast, shallow runs with tight ceilings.
    #[default]
    Quick,
    /// Thorough runs with generous ceilings.
    Deep,
}

/// Error returned when parsing an unknown execution mode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown execution mode '{0}' (expected 'quick' or 'deep')")]
pub struct UnknownMode(pub String);

impl FromStr for ExecutionMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "deep" => Ok(Self::Deep),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quick => f.write_str("quick"),
            Self::Deep => f.write_str("deep"),
        }
    }
}

/// Serde adapter for durations.
///
/// Serializes as a humantime string (`"1m 30s"`). Deserializes either a
/// humantime string or a plain number of seconds.
pub mod duration_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Secs(f64),
        Human(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Secs(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Duration::from_secs_f64(secs))
            }
            Repr::Secs(secs) => Err(de::Error::custom(format!("invalid duration: {secs}"))),
            Repr::Human(text) => humantime::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
