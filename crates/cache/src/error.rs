//! Error types for cache operations

/// Errors from cache operations.
///
/// `Unavailable` means the backend could not be reached at all; governance
/// callers treat it (and every other variant) as a reason to fail open.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("unexpected value at {key}: {detail}")]
    Protocol { key: String, detail: String },
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped()
        {
            CacheError::Unavailable(e.to_string())
        } else {
            CacheError::Backend(e.to_string())
        }
    }
}

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
