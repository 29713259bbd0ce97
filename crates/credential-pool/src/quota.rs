//! Quota periods and their UTC reset boundaries
//!
//! Quota counters are keyed by period (`daily:2026-03-14`,
//! `monthly:2026-03`), so a new period always starts a fresh counter even if
//! the previous one has not expired yet. The counter's TTL is the time left
//! until the period's reset boundary (next UTC midnight, or the first instant
//! of next calendar month) and is set only on its first increment.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Configured quota for one (platform, tier). `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    #[serde(default)]
    pub daily: Option<u64>,
    #[serde(default)]
    pub monthly: Option<u64>,
}

impl QuotaLimits {
    pub fn limit(&self, period: QuotaPeriod) -> Option<u64> {
        match period {
            QuotaPeriod::Daily => self.daily,
            QuotaPeriod::Monthly => self.monthly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub const ALL: [QuotaPeriod; 2] = [QuotaPeriod::Daily, QuotaPeriod::Monthly];

    /// Key suffix naming the period containing `now`.
    pub fn key_suffix(&self, now: DateTime<Utc>) -> String {
        match self {
            QuotaPeriod::Daily => format!("daily:{}", now.format("%Y-%m-%d")),
            QuotaPeriod::Monthly => format!("monthly:{}", now.format("%Y-%m")),
        }
    }

    /// Time from `now` until the period resets. Never zero.
    pub fn until_reset(&self, now: DateTime<Utc>) -> Duration {
        let today = now.date_naive();
        let boundary = match self {
            QuotaPeriod::Daily => today.succ_opt(),
            QuotaPeriod::Monthly => first_of_next_month(today),
        };
        boundary
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .and_then(|midnight| (midnight.and_utc() - now).to_std().ok())
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// Wall clock used for quota periods and `last_used_at`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}
