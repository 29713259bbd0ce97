//! Shared cache capability for credential governance
//!
//! Every piece of ephemeral governance state (leases, quota counters, cooldown
//! markers, sliding rate-limit windows) lives behind the `Cache` trait. The
//! governance logic never talks to a concrete client, so the same code runs
//! against `RedisCache` in production and `MemoryCache` in tests.
//!
//! Multi-step check-then-act sequences are single trait methods
//! (`incr_with_expiry`, `incr_all_below`, `window_acquire`) so a backend can execute them
//! atomically. Redis runs them as server-side Lua scripts; the memory backend
//! runs them under one lock.
//!
//! Sliding windows are timed by the backend's clock, not the caller's, so
//! workers on different hosts agree on which entries have aged out.

pub mod error;
pub mod memory;
pub mod redis_cache;

pub use error::{CacheError, Result};
pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by `Cache` methods.
/// Backslash-escape glob metacharacters so `text` matches only itself.
pub fn glob_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One counter of an `incr_all_below` admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedCounter {
    pub key: String,
    /// Ceiling for the counter; `None` counts without one.
    pub limit: Option<u64>,
    /// Expiry set by the increment that creates the counter.
    pub ttl: Duration,
}

/// Fast shared key/value store holding time-bounded governance state.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Cache>`). Errors are always returned, never swallowed; callers
/// decide whether to fail open.
pub trait Cache: Send + Sync {
    /// Backend name for logging and health reporting ("redis", "memory").
    fn backend(&self) -> &str;

    /// Round-trip check used by health endpoints.
    fn ping(&self) -> CacheFuture<'_, ()>;

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Set `key` to `value`, expiring after `ttl`.
    fn set_ex<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration)
    -> CacheFuture<'a, ()>;

    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool>;

    /// Delete `key`. Returns whether it existed.
    fn del<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool>;

    /// Remaining time to live. `None` when the key is missing or never expires.
    fn ttl<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Duration>>;

    /// Keys matching a glob pattern where `*` matches any run of characters.
    /// Escape literal text with [`glob_escape`].
    fn keys<'a>(&'a self, pattern: &'a str) -> CacheFuture<'a, Vec<String>>;

    /// Increment an integer counter, leaving any expiry untouched.
    fn incr<'a>(&'a self, key: &'a str) -> CacheFuture<'a, i64>;

    /// Increment a counter and set `ttl` only when this increment created it
    /// (result is 1). Later increments in the same period never move the
    /// expiry.
    fn incr_with_expiry<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, i64>;

    /// Bounded admission, atomically: when every counter is below its limit,
    /// increment all of them (each created counter gets its `ttl`) and
    /// return true. Otherwise change nothing and return false.
    fn incr_all_below<'a>(&'a self, counters: &'a [BoundedCounter]) -> CacheFuture<'a, bool>;

    /// Sliding-window admission, atomically: drop entries at least `window`
    /// old, count the rest, and record `member` only if the count is below
    /// `limit`. Returns whether `member` was recorded.
    fn window_acquire<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
        limit: u64,
        member: &'a str,
    ) -> CacheFuture<'a, bool>;

    /// Entries younger than `window`. Read-only.
    fn window_count<'a>(&'a self, key: &'a str, window: Duration) -> CacheFuture<'a, u64>;

    /// Time until the oldest counted entry ages out, or zero when fewer than
    /// `limit` entries are counted. Read-only.
    fn window_wait<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
        limit: u64,
    ) -> CacheFuture<'a, Duration>;

    /// Remove one recorded entry (compensating rollback).
    fn window_remove<'a>(&'a self, key: &'a str, member: &'a str) -> CacheFuture<'a, ()>;
}
