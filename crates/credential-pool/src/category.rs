//! Error categories reported by collectors
//!
//! Collectors classify each failed upstream call into one of a closed set of
//! categories. Only rate-limit and authentication failures put a credential
//! into cooldown; everything else just counts toward the circuit breaker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The provider throttled or refused for quota reasons (429).
    RateLimited,
    /// The provider rejected the credential itself (401/403).
    AuthFailed,
    /// Timeouts, 5xx, parse failures and anything unclassified.
    Other,
}

impl ErrorCategory {
    /// Classify an upstream HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorCategory::RateLimited,
            401 | 403 => ErrorCategory::AuthFailed,
            _ => ErrorCategory::Other,
        }
    }

    pub fn triggers_cooldown(&self) -> bool {
        matches!(self, ErrorCategory::RateLimited | ErrorCategory::AuthFailed)
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::AuthFailed => "auth_failed",
            ErrorCategory::Other => "other",
        }
    }
}
