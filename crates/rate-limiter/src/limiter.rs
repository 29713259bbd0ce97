//! Sliding-window rate limiter over the shared cache
//!
//! Each (key, window size) pair is one sliding window stored at
//! `rate_limit:{key}:{window_secs}`. Admission is a single atomic cache
//! operation, so concurrent workers can never both take the last slot.
//!
//! Cache outages fail open: `acquire` admits and `is_rate_limited` reports
//! not limited. Losing the windows only forgets recent traffic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cache::{Cache, CacheError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RateLimitError, Result};
use crate::table::{RateLimitTable, RateWindow};

/// Shortest sleep between slot polls, so a zero wait estimate cannot spin.
const MIN_POLL: Duration = Duration::from_millis(50);

fn window_key(key: &str, window_secs: u64) -> String {
    format!("rate_limit:{key}:{window_secs}")
}

/// One window per size, the strictest limit winning, in first-seen order.
fn merge_windows(windows: &[RateWindow]) -> Vec<RateWindow> {
    let mut merged: Vec<RateWindow> = Vec::with_capacity(windows.len());
    for window in windows {
        match merged.iter_mut().find(|w| w.window_secs == window.window_secs) {
            Some(existing) => existing.max_calls = existing.max_calls.min(window.max_calls),
            None => merged.push(*window),
        }
    }
    merged
}

fn decision(outcome: &'static str) {
    metrics::counter!("rate_limiter_decisions_total", "outcome" => outcome).increment(1);
}

fn fail_open(operation: &'static str, key: &str, error: &CacheError) {
    warn!(operation, key, error = %error, "rate limit cache unavailable, allowing");
    metrics::counter!("cache_fail_open_total", "component" => "rate_limiter").increment(1);
}

/// Rate limiter shared by every collector of a deployment.
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    table: RateLimitTable,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, table: RateLimitTable) -> Self {
        Self { cache, table }
    }

    pub fn table(&self) -> &RateLimitTable {
        &self.table
    }

    /// Conventional key for calls made with one credential:
    /// `{arena}:{platform}:{credential_id}`.
    pub fn key_for(arena: &str, platform: &str, credential_id: &str) -> String {
        format!("{arena}:{platform}:{credential_id}")
    }

    /// Take a slot if fewer than `max_calls` were taken in the last
    /// `window_secs`.
    pub async fn acquire(&self, key: &str, max_calls: u64, window_secs: u64) -> bool {
        let member = uuid::Uuid::new_v4().to_string();
        let result = self
            .cache
            .window_acquire(
                &window_key(key, window_secs),
                Duration::from_secs(window_secs),
                max_calls,
                &member,
            )
            .await;
        match result {
            Ok(true) => {
                decision("allowed");
                true
            }
            Ok(false) => {
                debug!(key, max_calls, window_secs, "rate limited");
                decision("limited");
                false
            }
            Err(e) => {
                fail_open("acquire", key, &e);
                decision("fail_open");
                true
            }
        }
    }

    /// Take a slot in every window at once, each allowing `max_calls + burst`.
    /// Windows of the same size are merged, keeping the lowest `max_calls`.
    ///
    /// All or nothing: when a later window is full, slots already taken in
    /// earlier windows are removed before returning `false`.
    pub async fn check_and_acquire(&self, key: &str, windows: &[RateWindow], burst: u64) -> bool {
        let member = uuid::Uuid::new_v4().to_string();
        let windows = merge_windows(windows);
        let mut taken: Vec<String> = Vec::with_capacity(windows.len());

        for window in &windows {
            let wkey = window_key(key, window.window_secs);
            let limit = window.max_calls.saturating_add(burst);
            match self
                .cache
                .window_acquire(&wkey, window.window(), limit, &member)
                .await
            {
                Ok(true) => taken.push(wkey),
                Ok(false) => {
                    debug!(
                        key,
                        max_calls = window.max_calls,
                        window_secs = window.window_secs,
                        burst,
                        rolled_back = taken.len(),
                        "rate limited"
                    );
                    self.rollback(key, &taken, &member).await;
                    decision("limited");
                    return false;
                }
                Err(e) => fail_open("check_and_acquire", key, &e),
            }
        }

        decision("allowed");
        true
    }

    async fn rollback(&self, key: &str, taken: &[String], member: &str) {
        for wkey in taken {
            if let Err(e) = self.cache.window_remove(wkey, member).await {
                warn!(key, window = %wkey, error = %e, "failed to roll back rate limit slot");
            }
        }
    }

    /// Check an arena's default windows for a credential.
    pub async fn acquire_default(&self, arena: &str, platform: &str, credential_id: &str) -> bool {
        let limits = self.table.for_arena(arena);
        let key = Self::key_for(arena, platform, credential_id);
        self.check_and_acquire(&key, &limits.windows, limits.burst)
            .await
    }

    /// Whether the window is full. Read-only; `false` when the cache is
    /// unreachable.
    pub async fn is_rate_limited(&self, key: &str, max_calls: u64, window_secs: u64) -> bool {
        match self
            .cache
            .window_count(&window_key(key, window_secs), Duration::from_secs(window_secs))
            .await
        {
            Ok(count) => count >= max_calls,
            Err(e) => {
                fail_open("is_rate_limited", key, &e);
                false
            }
        }
    }

    /// Time until the oldest counted call leaves the window. Zero when not
    /// limited or when the cache is unreachable.
    pub async fn get_wait_time(&self, key: &str, max_calls: u64, window_secs: u64) -> Duration {
        match self
            .cache
            .window_wait(
                &window_key(key, window_secs),
                Duration::from_secs(window_secs),
                max_calls,
            )
            .await
        {
            Ok(wait) => wait,
            Err(e) => {
                fail_open("get_wait_time", key, &e);
                Duration::ZERO
            }
        }
    }

    /// Block until a slot is taken, or fail with `RateLimitError::Timeout`
    /// once `timeout` has elapsed. Sleeps are capped at the remaining
    /// timeout, so a long window never overshoots it.
    pub async fn wait_for_slot(
        &self,
        key: &str,
        max_calls: u64,
        window_secs: u64,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if self.acquire(key, max_calls, window_secs).await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(key, timeout_ms = timeout.as_millis() as u64, "rate limit wait timed out");
                decision("timeout");
                return Err(RateLimitError::Timeout {
                    key: key.to_string(),
                    timeout,
                });
            }

            let wait = self.get_wait_time(key, max_calls, window_secs).await;
            let sleep = wait.max(MIN_POLL).min(deadline - now);
            debug!(key, sleep_ms = sleep.as_millis() as u64, "waiting for rate limit slot");
            tokio::time::sleep(sleep).await;
        }
    }

    /// Run `work` once a slot is available. Nothing happens afterwards:
    /// window entries expire on their own. The output of `work`, including
    /// any error it returns, is passed through unchanged.
    pub async fn with_slot<F>(
        &self,
        key: &str,
        max_calls: u64,
        window_secs: u64,
        timeout: Duration,
        work: F,
    ) -> Result<F::Output>
    where
        F: Future,
    {
        self.wait_for_slot(key, max_calls, window_secs, timeout)
            .await?;
        Ok(work.await)
    }

    /// Delete every window of `key`. Never fails.
    pub async fn reset(&self, key: &str) {
        let prefix = format!("rate_limit:{key}:");
        let pattern = format!("{}*", cache::glob_escape(&prefix));
        let keys: Vec<String> = match self.cache.keys(&pattern).await {
            // Longer keys sharing the prefix belong to other callers.
            Ok(keys) => keys
                .into_iter()
                .filter(|k| {
                    k.strip_prefix(&prefix)
                        .is_some_and(|window| window.parse::<u64>().is_ok())
                })
                .collect(),
            Err(e) => {
                fail_open("reset", key, &e);
                return;
            }
        };
        for wkey in &keys {
            if let Err(e) = self.cache.del(wkey).await {
                fail_open("reset", key, &e);
            }
        }
        info!(key, windows = keys.len(), "rate limit reset");
    }
}
