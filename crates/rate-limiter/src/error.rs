//! Error types for rate limiting

use std::time::Duration;

/// Errors from rate limiting. Only the blocking operations return one; the
/// non-blocking checks answer with a bool and fail open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("timed out after {timeout:?} waiting for a rate limit slot on {key}")]
    Timeout { key: String, timeout: Duration },
}

/// Result alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
