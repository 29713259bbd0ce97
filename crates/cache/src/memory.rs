//! In-process cache backend
//!
//! Holds every key in a `HashMap` behind a tokio `Mutex`; each trait method
//! takes the lock once, which gives the same atomicity the Redis scripts give.
//! Time comes from `tokio::time::Instant`, so tests can freeze and advance the
//! clock with `tokio::time::pause` / `advance`.
//!
//! `set_available(false)` simulates an outage: every call then fails with
//! `CacheError::Unavailable`, which is how fail-open paths are exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::{BoundedCounter, Cache, CacheFuture};

#[derive(Debug)]
enum Value {
    Text(String),
    Counter(i64),
    /// Sliding window entries in insertion (and therefore time) order.
    Window(Vec<(Instant, String)>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Cache backend living entirely in process memory.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated reachability.
    pub fn set_available(&self, available: bool) {
        debug!(available, "memory cache availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory cache marked unavailable".into()))
        }
    }
}

/// Look up a key, evicting it first if it has expired.
fn live_entry<'m>(
    entries: &'m mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'m mut Entry> {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str, expected: &str) -> CacheError {
    CacheError::Protocol {
        key: key.to_string(),
        detail: format!("expected {expected}"),
    }
}

fn increment(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Result<i64> {
    match live_entry(entries, key, now) {
        Some(entry) => {
            let next = match &entry.value {
                Value::Counter(n) => n + 1,
                Value::Text(s) => s.parse::<i64>().map_err(|_| wrong_type(key, "integer"))? + 1,
                Value::Window(_) => return Err(wrong_type(key, "integer")),
            };
            entry.value = Value::Counter(next);
            Ok(next)
        }
        None => {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Counter(1),
                    expires_at: None,
                },
            );
            Ok(1)
        }
    }
}

/// Current value of a counter key; missing keys count as zero.
fn counter_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Result<i64> {
    match live_entry(entries, key, now) {
        Some(Entry {
            value: Value::Counter(n),
            ..
        }) => Ok(*n),
        Some(Entry {
            value: Value::Text(s),
            ..
        }) => s.parse::<i64>().map_err(|_| wrong_type(key, "integer")),
        Some(_) => Err(wrong_type(key, "integer")),
        None => Ok(0),
    }
}

/// Entries younger than `window`, oldest first.
fn counted(entries: &[(Instant, String)], window: Duration, now: Instant) -> Vec<Instant> {
    entries
        .iter()
        .map(|(at, _)| *at)
        .filter(|at| now.duration_since(*at) < window)
        .collect()
}

/// Glob match supporting `*` and backslash escapes, which is all key
/// scans need.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => parts.push(std::mem::take(&mut current)),
            '\\' => current.extend(chars.next()),
            c => current.push(c),
        }
    }
    parts.push(current);
    if parts.len() == 1 {
        return parts[0] == text;
    }

    let first = parts[0].as_str();
    let last = parts[parts.len() - 1].as_str();
    if !text.starts_with(first) || text.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &text[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part.as_str()) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

impl Cache for MemoryCache {
    fn backend(&self) -> &str {
        "memory"
    }

    fn ping(&self) -> CacheFuture<'_, ()> {
        Box::pin(async move { self.check_available() })
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            match live_entry(&mut entries, key, Instant::now()) {
                Some(Entry {
                    value: Value::Text(s),
                    ..
                }) => Ok(Some(s.clone())),
                Some(Entry {
                    value: Value::Counter(n),
                    ..
                }) => Ok(Some(n.to_string())),
                Some(_) => Err(wrong_type(key, "string")),
                None => Ok(None),
            }
        })
    }

    fn set_ex<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            Ok(live_entry(&mut entries, key, Instant::now()).is_some())
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            let existed = live_entry(&mut entries, key, Instant::now()).is_some();
            entries.remove(key);
            Ok(existed)
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Duration>> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            Ok(live_entry(&mut entries, key, now)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now)))
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> CacheFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            entries.retain(|_, e| !e.is_expired(now));
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn incr<'a>(&'a self, key: &'a str) -> CacheFuture<'a, i64> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            increment(&mut entries, key, Instant::now())
        })
    }

    fn incr_with_expiry<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, i64> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            let value = increment(&mut entries, key, now)?;
            if value == 1 {
                if let Some(entry) = entries.get_mut(key) {
                    entry.expires_at = Some(now + ttl);
                }
            }
            Ok(value)
        })
    }

    fn incr_all_below<'a>(&'a self, counters: &'a [BoundedCounter]) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            for counter in counters {
                let used = counter_value(&mut entries, &counter.key, now)?;
                if counter
                    .limit
                    .is_some_and(|limit| u64::try_from(used.max(0)).unwrap_or(u64::MAX) >= limit)
                {
                    return Ok(false);
                }
            }
            for counter in counters {
                if increment(&mut entries, &counter.key, now)? == 1 {
                    if let Some(entry) = entries.get_mut(&counter.key) {
                        entry.expires_at = Some(now + counter.ttl);
                    }
                }
            }
            Ok(true)
        })
    }

    fn window_acquire<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
        limit: u64,
        member: &'a str,
    ) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            live_entry(&mut entries, key, now);
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Window(Vec::new()),
                expires_at: None,
            });
            let Value::Window(recorded) = &mut entry.value else {
                return Err(wrong_type(key, "sliding window"));
            };

            recorded.retain(|(at, _)| now.duration_since(*at) < window);
            if (recorded.len() as u64) >= limit {
                return Ok(false);
            }
            recorded.push((now, member.to_string()));
            entry.expires_at = Some(now + window);
            Ok(true)
        })
    }

    fn window_count<'a>(&'a self, key: &'a str, window: Duration) -> CacheFuture<'a, u64> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            match live_entry(&mut entries, key, now) {
                Some(Entry {
                    value: Value::Window(recorded),
                    ..
                }) => Ok(counted(recorded, window, now).len() as u64),
                Some(_) => Err(wrong_type(key, "sliding window")),
                None => Ok(0),
            }
        })
    }

    fn window_wait<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
        limit: u64,
    ) -> CacheFuture<'a, Duration> {
        Box::pin(async move {
            self.check_available()?;
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            let survivors = match live_entry(&mut entries, key, now) {
                Some(Entry {
                    value: Value::Window(recorded),
                    ..
                }) => counted(recorded, window, now),
                Some(_) => return Err(wrong_type(key, "sliding window")),
                None => return Ok(Duration::ZERO),
            };
            if (survivors.len() as u64) < limit {
                return Ok(Duration::ZERO);
            }
            Ok(survivors
                .first()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(Duration::ZERO))
        })
    }

    fn window_remove<'a>(&'a self, key: &'a str, member: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.lock().await;
            if let Some(Entry {
                value: Value::Window(recorded),
                ..
            }) = live_entry(&mut entries, key, Instant::now())
            {
                recorded.retain(|(_, m)| m != member);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn set_ex_expires_after_ttl() {
        let cache = MemoryCache::new();
        cache.set_ex("cooldown:a", "1", Duration::from_secs(10)).await.unwrap();
        assert!(cache.exists("cooldown:a").await.unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("cooldown:a").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.exists("cooldown:a").await.unwrap());
        assert_eq!(cache.get("cooldown:a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_with_expiry_sets_ttl_only_on_first_increment() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_with_expiry("quota", MINUTE).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.incr_with_expiry("quota", MINUTE).await.unwrap(), 2);

        // The second increment must not push the expiry back out to 60s
        let ttl = cache.ttl("quota").await.unwrap().unwrap();
        assert_eq!(ttl, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(cache.incr_with_expiry("quota", MINUTE).await.unwrap(), 1);
    }

    fn bounded(key: &str, limit: Option<u64>) -> BoundedCounter {
        BoundedCounter {
            key: key.to_string(),
            limit,
            ttl: MINUTE,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn incr_all_below_refuses_at_any_limit_without_partial_increments() {
        let cache = MemoryCache::new();
        let counters = [bounded("daily", Some(5)), bounded("monthly", Some(2))];

        assert!(cache.incr_all_below(&counters).await.unwrap());
        assert!(cache.incr_all_below(&counters).await.unwrap());
        assert!(!cache.incr_all_below(&counters).await.unwrap());

        // The refused call must not have counted against the daily limit
        assert_eq!(cache.get("daily").await.unwrap().as_deref(), Some("2"));
        assert_eq!(cache.get("monthly").await.unwrap().as_deref(), Some("2"));
        assert_eq!(cache.ttl("daily").await.unwrap(), Some(MINUTE));
    }

    #[tokio::test(start_paused = true)]
    async fn incr_all_below_counts_unbounded_and_sets_ttl_once() {
        let cache = MemoryCache::new();
        let counters = [bounded("uses", None)];
        for _ in 0..3 {
            assert!(cache.incr_all_below(&counters).await.unwrap());
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert_eq!(cache.get("uses").await.unwrap().as_deref(), Some("3"));
        assert_eq!(cache.ttl("uses").await.unwrap(), Some(Duration::from_secs(30)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn incr_all_below_admits_exactly_limit_under_contention() {
        let cache = std::sync::Arc::new(MemoryCache::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .incr_all_below(&[bounded("quota", Some(5))])
                    .await
                    .unwrap()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(cache.get("quota").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn incr_keeps_existing_expiry_and_parses_text() {
        let cache = MemoryCache::new();
        cache.set_ex("n", "41", MINUTE).await.unwrap();
        assert_eq!(cache.incr("n").await.unwrap(), 42);
        assert!(cache.ttl("n").await.unwrap().is_some());

        assert_eq!(cache.incr("fresh").await.unwrap(), 1);
        assert_eq!(cache.ttl("fresh").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn window_admits_up_to_limit_then_slides() {
        let cache = MemoryCache::new();
        let mut admitted = Vec::new();
        for i in 0..4 {
            admitted.push(
                cache
                    .window_acquire("w", MINUTE, 3, &format!("m{i}"))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(admitted, vec![true, true, true, false]);
        assert_eq!(cache.window_count("w", MINUTE).await.unwrap(), 3);

        tokio::time::advance(MINUTE).await;
        assert_eq!(cache.window_count("w", MINUTE).await.unwrap(), 0);
        assert!(cache.window_acquire("w", MINUTE, 3, "m4").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn window_wait_reports_oldest_entry_age_out() {
        let cache = MemoryCache::new();
        cache.window_acquire("w", MINUTE, 2, "a").await.unwrap();
        assert_eq!(cache.window_wait("w", MINUTE, 2).await.unwrap(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(15)).await;
        cache.window_acquire("w", MINUTE, 2, "b").await.unwrap();
        assert_eq!(
            cache.window_wait("w", MINUTE, 2).await.unwrap(),
            Duration::from_secs(45)
        );
    }

    #[tokio::test]
    async fn window_remove_frees_a_slot() {
        let cache = MemoryCache::new();
        assert!(cache.window_acquire("w", MINUTE, 1, "a").await.unwrap());
        assert!(!cache.window_acquire("w", MINUTE, 1, "b").await.unwrap());

        cache.window_remove("w", "a").await.unwrap();
        assert!(cache.window_acquire("w", MINUTE, 1, "b").await.unwrap());
    }

    #[tokio::test]
    async fn window_ops_on_text_key_are_protocol_errors() {
        let cache = MemoryCache::new();
        cache.set_ex("t", "x", MINUTE).await.unwrap();
        let err = cache.window_acquire("t", MINUTE, 1, "a").await.unwrap_err();
        assert!(matches!(err, CacheError::Protocol { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn keys_matches_glob_and_del_reports_existence() {
        let cache = MemoryCache::new();
        cache.set_ex("lease:c1:t1", "1", MINUTE).await.unwrap();
        cache.set_ex("lease:c1:t2", "1", MINUTE).await.unwrap();
        cache.set_ex("lease:c2:t1", "1", MINUTE).await.unwrap();

        let keys = cache.keys("lease:c1:*").await.unwrap();
        assert_eq!(keys, vec!["lease:c1:t1", "lease:c1:t2"]);

        assert!(cache.del("lease:c1:t1").await.unwrap());
        assert!(!cache.del("lease:c1:t1").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_cache_fails_every_call() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache.ping().await.is_err());
        assert!(cache.window_acquire("w", MINUTE, 1, "a").await.is_err());

        cache.set_available(true);
        assert!(cache.ping().await.is_ok());
    }

    #[test]
    fn glob_match_handles_wildcards() {
        assert!(glob_match("a:*", "a:b:c"));
        assert!(glob_match("*:c", "a:b:c"));
        assert!(glob_match("a:*:c", "a:b:c"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("a:*:d", "a:b:c"));
        assert!(!glob_match("ab*ba", "aba"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a\\*:*", "a*:b"));
        assert!(!glob_match("a\\*:*", "ab:b"));
        assert!(glob_match(&format!("{}:*", crate::glob_escape("x?[y]")), "x?[y]:60"));
    }
}
