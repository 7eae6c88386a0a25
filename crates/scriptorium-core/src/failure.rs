//! Failure classification.
//!
//! Errors from task bodies are opaque to the runtime. Their message is
//! matched against keyword patterns in a fixed order and the first match
//! decides the category. Order matters: "connection timed out" is a
//! timeout, not a network failure.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a unit of work failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Bad or missing input data
    Input,
    /// Misconfiguration (credentials, settings, permissions)
    Config,
    /// Upstream model/API refused or rate-limited the call
    Model,
    /// Connectivity problem
    Network,
    /// The call took too long
    Timeout,
    /// A resource budget was exhausted
    Budget,
    /// Nothing matched
    Unknown,
}

impl FailureReason {
    pub const ALL: [FailureReason; 7] = [
        Self::Input,
        Self::Config,
        Self::Model,
        Self::Network,
        Self::Timeout,
        Self::Budget,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Config => "config",
            Self::Model => "model",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Budget => "budget",
            Self::Unknown => "unknown",
        }
    }

    /// Transient failures that may succeed when repeated.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Timeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

lazy_static! {
    static ref TIMEOUT_PATTERN: Regex = Regex::new(
        r"(?i)timed?[\s_-]?out|deadline (has )?(elapsed|exceeded)|took too long"
    ).unwrap();

    static ref NETWORK_PATTERN: Regex = Regex::new(
        r"(?i)connection|network|\bdns\b|unreachable|socket|broken pipe|reset by peer|tls handshake|failed to connect"
    ).unwrap();

    static ref MODEL_PATTERN: Regex = Regex::new(
        r"(?i)rate[\s_-]?limit|too many requests|\b429\b|api error|overloaded|service unavailable|\b50[234]\b|model"
    ).unwrap();

    static ref BUDGET_PATTERN: Regex = Regex::new(
        r"(?i)budget|quota"
    ).unwrap();

    static ref CONFIG_PATTERN: Regex = Regex::new(
        r"(?i)config|not configured|api[\s_-]?key|environment variable|permission denied|unauthori[sz]ed|forbidden|\b40[13]\b"
    ).unwrap();

    static ref INPUT_PATTERN: Regex = Regex::new(
        r"(?i)invalid|malformed|pars(e|ing)|decod(e|ing)|not found|no such file|unsupported|empty input"
    ).unwrap();
}

/// Classify an error message into a [`FailureReason`].
///
/// For `anyhow` errors pass `format!("{err:#}")` so the whole cause chain
/// is considered.
pub fn classify_failure(message: &str) -> FailureReason {
    let ordered: [(&Regex, FailureReason); 6] = [
        (&TIMEOUT_PATTERN, FailureReason::Timeout),
        (&NETWORK_PATTERN, FailureReason::Network),
        (&MODEL_PATTERN, FailureReason::Model),
        (&BUDGET_PATTERN, FailureReason::Budget),
        (&CONFIG_PATTERN, FailureReason::Config),
        (&INPUT_PATTERN, FailureReason::Input),
    ];

    ordered
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, reason)| *reason)
        .unwrap_or(FailureReason::Unknown)
}
