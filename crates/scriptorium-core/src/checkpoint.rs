//! Checkpoint record for resumable runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Result summaries are cut to this many characters.
pub const SUMMARY_LIMIT: usize = 500;

/// A durable snapshot of run progress.
///
/// A checkpoint only applies to a run whose configuration hashes to the
/// same manifest hash, see [`Checkpoint::matches`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,

    pub created_at: DateTime<Utc>,

    #[serde(rename = "completed_tasks")]
    pub completed: Vec<String>,

    #[serde(rename = "pending_tasks")]
    pub pending: Vec<String>,

    /// Task id -> truncated result summary
    #[serde(rename = "task_results")]
    pub results: BTreeMap<String, String>,

    pub manifest_hash: String,
}

impl Checkpoint {
    pub fn new(
        run_id: &str,
        completed: Vec<String>,
        pending: Vec<String>,
        results: BTreeMap<String, String>,
        manifest_hash: impl Into<String>,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            checkpoint_id: format!("{run_id}-{}", created_at.timestamp_millis()),
            created_at,
            completed,
            pending,
            results,
            manifest_hash: manifest_hash.into(),
        }
    }

    /// Whether this checkpoint was taken for the run identified by `manifest_hash`.
    pub fn matches(&self, manifest_hash: &str) -> bool {
        self.manifest_hash.as_bytes() == manifest_hash.as_bytes()
    }
}

/// Render `value` compactly and cut it to [`SUMMARY_LIMIT`] characters.
pub fn summarize(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    truncate(&text, SUMMARY_LIMIT)
}

/// Cut `text` to at most `limit` characters, marking the cut with `…`.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        None => text.to_string(),
        Some((byte_idx, _)) => format!("{}…", &text[..byte_idx]),
    }
}
