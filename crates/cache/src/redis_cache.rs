//! Redis cache backend
//!
//! Single-key operations map to plain commands. Check-then-act sequences run
//! as Lua scripts so they execute atomically on the server. Window scripts
//! read the server clock with `TIME` so every worker measures window age
//! against the same clock.

use std::time::Duration;

use redis::Script;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::Result;
use crate::{BoundedCounter, Cache, CacheFuture};

/// INCR, then PEXPIRE only when the counter was just created.
const INCR_WITH_EXPIRY: &str = r"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
";

/// Check every counter against its limit (ARGV[2i-1], -1 for none), then
/// increment all of them, setting the expiry (ARGV[2i]) on created ones.
const INCR_ALL_BELOW: &str = r"
for i, key in ipairs(KEYS) do
  local limit = tonumber(ARGV[2 * i - 1])
  if limit >= 0 then
    local used = tonumber(redis.call('GET', key) or '0')
    if used >= limit then
      return 0
    end
  end
end
for i, key in ipairs(KEYS) do
  if redis.call('INCR', key) == 1 then
    redis.call('PEXPIRE', key, ARGV[2 * i])
  end
end
return 1
";

/// Shared prologue: server time in milliseconds.
const NOW_MS: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
";

const WINDOW_ACQUIRE: &str = r"
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[3])
  redis.call('PEXPIRE', KEYS[1], window)
  return 1
end
return 0
";

const WINDOW_COUNT: &str = r"
local window = tonumber(ARGV[1])
return redis.call('ZCOUNT', KEYS[1], '(' .. (now - window), '+inf')
";

const WINDOW_WAIT: &str = r"
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local floor = '(' .. (now - window)
local count = redis.call('ZCOUNT', KEYS[1], floor, '+inf')
if count < limit then
  return 0
end
local oldest = redis.call('ZRANGEBYSCORE', KEYS[1], floor, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
if #oldest == 0 then
  return 0
end
local wait = tonumber(oldest[2]) + window - now
if wait < 0 then
  return 0
end
return wait
";

/// Build a window script: effect replication (required before writes that
/// follow `TIME` on Redis < 7), the clock prologue, then the body.
fn window_script(body: &str) -> Script {
    Script::new(&format!(
        "redis.replicate_commands()\n{NOW_MS}\n{body}"
    ))
}

fn millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

/// Limit argument for `INCR_ALL_BELOW`; -1 means unbounded.
fn script_limit(limit: Option<u64>) -> i64 {
    limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

/// Cache backend on a shared Redis server.
///
/// `ConnectionManager` reconnects transparently and is cheap to clone; each
/// call clones it rather than holding a lock.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    incr_with_expiry: Script,
    incr_all_below: Script,
    window_acquire: Script,
    window_count: Script,
    window_wait: Script,
}

impl RedisCache {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("connected to redis cache");
        Ok(Self {
            conn,
            incr_with_expiry: Script::new(INCR_WITH_EXPIRY),
            incr_all_below: Script::new(INCR_ALL_BELOW),
            window_acquire: window_script(WINDOW_ACQUIRE),
            window_count: window_script(WINDOW_COUNT),
            window_wait: window_script(WINDOW_WAIT),
        })
    }
}

impl Cache for RedisCache {
    fn backend(&self) -> &str {
        "redis"
    }

    fn ping(&self) -> CacheFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
    }

    fn set_ex<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
            Ok(count > 0)
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(removed > 0)
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            // -2: missing, -1: no expiry
            let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
            Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> CacheFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(200)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            // SCAN may return a key more than once
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    fn incr<'a>(&'a self, key: &'a str) -> CacheFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
    }

    fn incr_with_expiry<'a>(&'a self, key: &'a str, ttl: Duration) -> CacheFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: i64 = self
                .incr_with_expiry
                .key(key)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(value)
        })
    }

    fn incr_all_below<'a>(&'a self, counters: &'a [BoundedCounter]) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut invocation = self.incr_all_below.prepare_invoke();
            for counter in counters {
                invocation
                    .key(counter.key.as_str())
                    .arg(script_limit(counter.limit))
                    .arg(millis(counter.ttl));
            }
            let admitted: i64 = invocation.invoke_async(&mut conn).await?;
            Ok(admitted == 1)
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
            let mut conn = self.conn.clone();
            let admitted: i64 = self
                .window_acquire
                .key(key)
                .arg(millis(window))
                .arg(limit)
                .arg(member)
                .invoke_async(&mut conn)
                .await?;
            Ok(admitted == 1)
        })
    }

    fn window_count<'a>(&'a self, key: &'a str, window: Duration) -> CacheFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let count: i64 = self
                .window_count
                .key(key)
                .arg(millis(window))
                .invoke_async(&mut conn)
                .await?;
            Ok(count.max(0) as u64)
        })
    }

    fn window_wait<'a>(
        &'a self,
        key: &'a str,
        window: Duration,
        limit: u64,
    ) -> CacheFuture<'a, Duration> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let wait_ms: i64 = self
                .window_wait
                .key(key)
                .arg(millis(window))
                .arg(limit)
                .invoke_async(&mut conn)
                .await?;
            Ok(Duration::from_millis(wait_ms.max(0) as u64))
        })
    }

    fn window_remove<'a>(&'a self, key: &'a str, member: &'a str) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("ZREM")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_never_rounds_to_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn script_limit_encodes_unbounded_as_negative() {
        assert_eq!(script_limit(None), -1);
        assert_eq!(script_limit(Some(0)), 0);
        assert_eq!(script_limit(Some(10_000)), 10_000);
        assert_eq!(script_limit(Some(u64::MAX)), i64::MAX);
    }

    #[test]
    fn window_scripts_share_clock_prologue() {
        let source = format!("redis.replicate_commands()\n{NOW_MS}\n{WINDOW_ACQUIRE}");
        assert!(source.contains("redis.call('TIME')"));
        assert!(source.find("TIME").unwrap() < source.find("ZREMRANGEBYSCORE").unwrap());
        // Hash is computed from the script body; identical bodies share a SHA
        assert_eq!(
            window_script(WINDOW_ACQUIRE).get_hash(),
            Script::new(&source).get_hash()
        );
    }
}
