//! Sliding-window rate limiting shared across workers
//!
//! Collectors call the limiter before every outbound request. Windows live in
//! the shared cache, so every worker on every host draws from the same
//! budget. Several windows (per minute, hour, day) can guard one key at once,
//! and a call that does not fit all of them leaves none of them changed.

pub mod error;
pub mod limiter;
pub mod table;

pub use error::{RateLimitError, Result};
pub use limiter::RateLimiter;
pub use table::{ArenaLimits, RateLimitTable, RateWindow};
