//! Credential selection, leasing, and failure bookkeeping
//!
//! The pool keeps no state of its own. Durable facts (`error_count`,
//! `last_used_at`, `is_active`) live in the credential store; time-bounded
//! facts live in the shared cache under `credential_pool:*`:
//!
//! - `credential_pool:lease:{id}:{task_id}`: advisory checkout record
//! - `credential_pool:quota:{id}:daily:{YYYY-MM-DD}` / `...:monthly:{YYYY-MM}`
//! - `credential_pool:cooldown:{id}`: present while the credential is refused
//! - `credential_pool:errors:{id}`: error counter of environment credentials
//! - `credential_pool:circuit:{id}`: open circuit of an environment credential
//!
//! Any number of workers can share one store and one cache. Every cache read
//! in `acquire` fails open: if the cache is unreachable the credential is
//! treated as eligible, since everything in the cache can be rebuilt from
//! traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cache::{BoundedCounter, Cache, CacheError};
use chrono::{DateTime, Utc};
use credential_store::{
    CredentialFields, CredentialStore, MissingField, PayloadCipher, Tier,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::category::ErrorCategory;
use crate::cooldown::{cooldown_for, trips_circuit_breaker};
use crate::env::{self, EnvSource, ProcessEnv};
use crate::error::{ExhaustionSummary, PoolError, Result};
use crate::quota::{Clock, QuotaLimits, QuotaPeriod, SystemClock};

/// Error counters and open circuits of environment credentials are
/// forgotten after a week.
const ENV_ERROR_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn lease_prefix(credential_id: &str) -> String {
    format!("credential_pool:lease:{credential_id}:")
}

fn lease_key(credential_id: &str, task_id: &str) -> String {
    format!("{}{task_id}", lease_prefix(credential_id))
}

fn quota_key(credential_id: &str, period: QuotaPeriod, now: DateTime<Utc>) -> String {
    format!(
        "credential_pool:quota:{credential_id}:{}",
        period.key_suffix(now)
    )
}

fn cooldown_key(credential_id: &str) -> String {
    format!("credential_pool:cooldown:{credential_id}")
}

fn error_key(credential_id: &str) -> String {
    format!("credential_pool:errors:{credential_id}")
}

fn circuit_key(credential_id: &str) -> String {
    format!("credential_pool:circuit:{credential_id}")
}

fn fail_open(operation: &'static str, credential_id: &str, error: &CacheError) {
    warn!(
        operation,
        credential_id,
        error = %error,
        "cache unavailable, continuing without it"
    );
    metrics::counter!("cache_fail_open_total", "component" => "credential_pool").increment(1);
}

fn record_acquire(platform: &str, tier: Tier, outcome: &'static str) {
    metrics::counter!(
        "credential_pool_acquire_total",
        "platform" => platform.to_string(),
        "tier" => tier.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

fn to_u32(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Lifetime of a lease that is never released.
    pub lease_ttl: Duration,
    /// Quotas per (platform, tier). Pairs without an entry are unlimited.
    pub quotas: HashMap<(String, Tier), QuotaLimits>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(3600),
            quotas: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn with_quota(mut self, platform: &str, tier: Tier, limits: QuotaLimits) -> Self {
        self.quotas.insert((platform.to_string(), tier), limits);
        self
    }

    pub fn limits(&self, platform: &str, tier: Tier) -> QuotaLimits {
        self.quotas
            .get(&(platform.to_string(), tier))
            .copied()
            .unwrap_or_default()
    }
}

/// Where a leased credential came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Durable,
    Environment { variable: String },
}

/// A leased credential with its decrypted fields.
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub id: String,
    pub platform: String,
    pub tier: Tier,
    pub source: CredentialSource,
    pub fields: CredentialFields,
}

impl CredentialHandle {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }

    /// Fetch a field the collector cannot work without.
    pub fn require(&self, key: &str) -> std::result::Result<&str, MissingField> {
        self.fields.require(key)
    }
}

/// What `report_error` recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    /// Error count after the increment, when it could be recorded.
    pub error_count: Option<u32>,
    /// Cooldown written for classified failures.
    pub cooldown: Option<Duration>,
}

/// Eligibility of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    CoolingDown { remaining_secs: u64 },
    QuotaExhausted { period: QuotaPeriod },
    CircuitOpen,
}

impl CredentialState {
    fn is_available(&self) -> bool {
        matches!(self, CredentialState::Available)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub id: String,
    /// "durable" or "environment".
    pub source: &'static str,
    pub error_count: u32,
    #[serde(flatten)]
    pub state: CredentialState,
}

/// Diagnostic view of one (platform, tier).
///
/// Status mapping: all available → healthy, some available → degraded,
/// none available (or none configured) → unhealthy.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub platform: String,
    pub tier: Tier,
    pub status: &'static str,
    pub credentials_total: usize,
    pub credentials_available: usize,
    pub credentials: Vec<CredentialStatus>,
}

/// Credential pool shared by every collector of a deployment.
///
/// Holds only `Arc`s to the cache, store, and cipher, so a single pool can be
/// shared across tasks and cloned cheaply into handlers.
pub struct CredentialPool {
    cache: Arc<dyn Cache>,
    store: Arc<dyn CredentialStore>,
    cipher: Arc<PayloadCipher>,
    env: Arc<dyn EnvSource>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
}

impl CredentialPool {
    /// Create a pool reading environment credentials from the process
    /// environment and time from the system clock.
    pub fn new(
        cache: Arc<dyn Cache>,
        store: Arc<dyn CredentialStore>,
        cipher: Arc<PayloadCipher>,
        config: PoolConfig,
    ) -> Self {
        info!(
            cache = cache.backend(),
            lease_ttl_secs = config.lease_ttl.as_secs(),
            quotas = config.quotas.len(),
            "credential pool initialized"
        );
        Self {
            cache,
            store,
            cipher,
            env: Arc::new(ProcessEnv),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_env_source(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lease a usable credential for (platform, tier).
    ///
    /// Durable credentials are tried least-recently-used first, then
    /// environment credentials. A candidate is skipped when its circuit is
    /// open, a cooldown marker exists, a quota counter has reached its limit,
    /// or its payload cannot be decrypted. Never waits: returns a handle or
    /// `NoCredentialAvailable` immediately.
    ///
    /// Store failures while listing candidates propagate as
    /// `PoolError::Store`; cache failures never do.
    pub async fn acquire(
        &self,
        platform: &str,
        tier: Tier,
        task_id: &str,
    ) -> Result<CredentialHandle> {
        let now = self.clock.now();
        let limits = self.config.limits(platform, tier);
        let mut summary = ExhaustionSummary::default();

        let candidates = match self.store.active_candidates(platform, tier).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(platform, tier = %tier, error = %e, "failed to list credentials");
                record_acquire(platform, tier, "store_error");
                return Err(e.into());
            }
        };
        summary.candidates += candidates.len();

        for record in candidates {
            let state = self
                .evaluate(&record.id, record.circuit_open, limits, now)
                .await;
            if !tally(&mut summary, state) {
                debug!(credential_id = %record.id, state = ?state, "skipping credential");
                continue;
            }

            let fields = match self.cipher.decrypt(&record.encrypted_payload) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(
                        credential_id = %record.id,
                        platform,
                        tier = %tier,
                        error = %e,
                        "credential payload could not be decrypted, skipping"
                    );
                    summary.undecryptable += 1;
                    continue;
                }
            };

            if !self.commit(&record.id, task_id, limits, now).await {
                summary.quota_exhausted += 1;
                continue;
            }
            if let Err(e) = self.store.touch_last_used(&record.id, now).await {
                warn!(credential_id = %record.id, error = %e, "failed to record last use");
            }
            info!(credential_id = %record.id, platform, tier = %tier, task_id, "credential leased");
            record_acquire(platform, tier, "durable");
            return Ok(CredentialHandle {
                id: record.id,
                platform: record.platform,
                tier,
                source: CredentialSource::Durable,
                fields,
            });
        }

        let discovered = env::discover(self.env.as_ref(), platform, tier);
        summary.candidates += discovered.len();

        for credential in discovered {
            let circuit_open = self.env_circuit_open(&credential.id).await;
            let state = self.evaluate(&credential.id, circuit_open, limits, now).await;
            if !tally(&mut summary, state) {
                debug!(credential_id = %credential.id, state = ?state, "skipping environment credential");
                continue;
            }

            if !self.commit(&credential.id, task_id, limits, now).await {
                summary.quota_exhausted += 1;
                continue;
            }
            info!(
                credential_id = %credential.id,
                variable = %credential.variable,
                platform,
                tier = %tier,
                task_id,
                "environment credential leased"
            );
            record_acquire(platform, tier, "environment");
            return Ok(CredentialHandle {
                id: credential.id,
                platform: platform.to_string(),
                tier,
                source: CredentialSource::Environment {
                    variable: credential.variable,
                },
                fields: CredentialFields::api_key(credential.api_key.expose().clone()),
            });
        }

        warn!(platform, tier = %tier, summary = %summary, "no credential available");
        record_acquire(platform, tier, "exhausted");
        Err(PoolError::NoCredentialAvailable {
            platform: platform.to_string(),
            tier: tier.to_string(),
            summary,
        })
    }

    /// Delete one lease. Never fails; cache errors are logged.
    pub async fn release(&self, credential_id: &str, task_id: &str) {
        match self.cache.del(&lease_key(credential_id, task_id)).await {
            Ok(true) => debug!(credential_id, task_id, "lease released"),
            Ok(false) => debug!(credential_id, task_id, "lease already gone"),
            Err(e) => fail_open("release", credential_id, &e),
        }
    }

    /// Delete every lease on a credential, for callers that lost their task
    /// id. Returns how many were removed. Never fails.
    pub async fn release_all(&self, credential_id: &str) -> usize {
        let pattern = format!("{}*", cache::glob_escape(&lease_prefix(credential_id)));
        let keys = match self.cache.keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                fail_open("release_all", credential_id, &e);
                return 0;
            }
        };

        let mut released = 0;
        for key in keys {
            match self.cache.del(&key).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => fail_open("release_all", credential_id, &e),
            }
        }
        info!(credential_id, released, "released all leases");
        released
    }

    /// Task ids currently holding a lease on the credential.
    pub async fn leases(&self, credential_id: &str) -> Result<Vec<String>> {
        let prefix = lease_prefix(credential_id);
        let keys = self
            .cache
            .keys(&format!("{}*", cache::glob_escape(&prefix)))
            .await?;
        let mut tasks: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        tasks.sort();
        Ok(tasks)
    }

    /// Record a failed call made with the credential. Never fails.
    ///
    /// Always increments the error count. Rate-limit and authentication
    /// failures also write a cooldown of `min(60, 2^(n-1))` minutes, or the
    /// maximum once the circuit breaker threshold is reached, which also
    /// opens the circuit. Unclassified failures never open it.
    pub async fn report_error(
        &self,
        credential_id: &str,
        category: ErrorCategory,
        platform: &str,
    ) -> ErrorReport {
        let error_count = if env::is_env_credential(credential_id) {
            match self
                .cache
                .incr_with_expiry(&error_key(credential_id), ENV_ERROR_TTL)
                .await
            {
                Ok(n) => Some(to_u32(n)),
                Err(e) => {
                    fail_open("report_error", credential_id, &e);
                    None
                }
            }
        } else {
            match self.store.increment_error_count(credential_id).await {
                Ok(Some(n)) => Some(n),
                Ok(None) => {
                    warn!(credential_id, platform, "error reported for unknown credential");
                    None
                }
                Err(e) => {
                    warn!(credential_id, platform, error = %e, "failed to record credential error");
                    None
                }
            }
        };

        if !category.triggers_cooldown() {
            debug!(
                credential_id,
                platform,
                category = category.label(),
                error_count,
                "unclassified error counted, no cooldown"
            );
            return ErrorReport {
                error_count,
                cooldown: None,
            };
        }

        let count = error_count.unwrap_or(1);
        let cooldown = cooldown_for(count);
        if trips_circuit_breaker(count) {
            self.open_circuit(credential_id, platform, count).await;
        }

        match self
            .cache
            .set_ex(&cooldown_key(credential_id), category.label(), cooldown)
            .await
        {
            Ok(()) => info!(
                credential_id,
                platform,
                category = category.label(),
                error_count = count,
                cooldown_secs = cooldown.as_secs(),
                "credential entering cooldown"
            ),
            Err(e) => fail_open("report_error", credential_id, &e),
        }
        metrics::counter!(
            "credential_pool_cooldowns_total",
            "platform" => platform.to_string(),
            "category" => category.label()
        )
        .increment(1);

        ErrorReport {
            error_count,
            cooldown: Some(cooldown),
        }
    }

    /// Operator reset: zero the error count, close the circuit, and clear
    /// any cooldown, re-admitting the credential. Returns
    /// whether the credential exists.
    pub async fn reset_errors(&self, credential_id: &str) -> Result<bool> {
        let exists = if env::is_env_credential(credential_id) {
            self.cache.del(&error_key(credential_id)).await?;
            self.cache.del(&circuit_key(credential_id)).await?;
            true
        } else {
            self.store.reset_error_count(credential_id).await?
        };
        if exists {
            if let Err(e) = self.cache.del(&cooldown_key(credential_id)).await {
                fail_open("reset_errors", credential_id, &e);
            }
            info!(credential_id, "credential errors reset");
        }
        Ok(exists)
    }

    /// Per-credential eligibility for (platform, tier), durable credentials
    /// first.
    pub async fn status(&self, platform: &str, tier: Tier) -> Result<PoolStatus> {
        let now = self.clock.now();
        let limits = self.config.limits(platform, tier);
        let mut credentials = Vec::new();

        for record in self.store.active_candidates(platform, tier).await? {
            let state = self
                .detailed_state(&record.id, record.circuit_open, limits, now)
                .await;
            credentials.push(CredentialStatus {
                id: record.id,
                source: "durable",
                error_count: record.error_count,
                state,
            });
        }
        for credential in env::discover(self.env.as_ref(), platform, tier) {
            let errors = self.env_error_count(&credential.id).await;
            let circuit_open = self.env_circuit_open(&credential.id).await;
            let state = self
                .detailed_state(&credential.id, circuit_open, limits, now)
                .await;
            credentials.push(CredentialStatus {
                id: credential.id,
                source: "environment",
                error_count: errors,
                state,
            });
        }

        let total = credentials.len();
        let available = credentials.iter().filter(|c| c.state.is_available()).count();
        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        Ok(PoolStatus {
            platform: platform.to_string(),
            tier,
            status,
            credentials_total: total,
            credentials_available: available,
            credentials,
        })
    }

    async fn evaluate(
        &self,
        credential_id: &str,
        circuit_open: bool,
        limits: QuotaLimits,
        now: DateTime<Utc>,
    ) -> CredentialState {
        if circuit_open {
            return CredentialState::CircuitOpen;
        }

        match self.cache.exists(&cooldown_key(credential_id)).await {
            Ok(true) => return CredentialState::CoolingDown { remaining_secs: 0 },
            Ok(false) => {}
            Err(e) => fail_open("cooldown_check", credential_id, &e),
        }

        for period in QuotaPeriod::ALL {
            let Some(limit) = limits.limit(period) else {
                continue;
            };
            match self.cache.get(&quota_key(credential_id, period, now)).await {
                Ok(Some(used)) => {
                    let used: u64 = used.parse().unwrap_or(0);
                    if used >= limit {
                        return CredentialState::QuotaExhausted { period };
                    }
                }
                Ok(None) => {}
                Err(e) => fail_open("quota_check", credential_id, &e),
            }
        }

        CredentialState::Available
    }

    /// `evaluate` plus the remaining cooldown, for diagnostics.
    async fn detailed_state(
        &self,
        credential_id: &str,
        circuit_open: bool,
        limits: QuotaLimits,
        now: DateTime<Utc>,
    ) -> CredentialState {
        match self.evaluate(credential_id, circuit_open, limits, now).await {
            CredentialState::CoolingDown { .. } => {
                let remaining = self
                    .cache
                    .ttl(&cooldown_key(credential_id))
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                CredentialState::CoolingDown {
                    remaining_secs: remaining.as_secs(),
                }
            }
            state => state,
        }
    }

    async fn env_circuit_open(&self, credential_id: &str) -> bool {
        match self.cache.exists(&circuit_key(credential_id)).await {
            Ok(open) => open,
            Err(e) => {
                fail_open("circuit_check", credential_id, &e);
                false
            }
        }
    }

    /// Persist an open circuit: a durable flag for stored credentials, a
    /// cache marker for environment ones.
    async fn open_circuit(&self, credential_id: &str, platform: &str, error_count: u32) {
        if env::is_env_credential(credential_id) {
            if let Err(e) = self
                .cache
                .set_ex(&circuit_key(credential_id), "open", ENV_ERROR_TTL)
                .await
            {
                fail_open("open_circuit", credential_id, &e);
            }
        } else if let Err(e) = self.store.open_circuit(credential_id).await {
            warn!(credential_id, platform, error = %e, "failed to persist open circuit");
        }
        warn!(
            credential_id,
            platform,
            error_count,
            "circuit breaker open, credential out of rotation until reset"
        );
    }

    async fn env_error_count(&self, credential_id: &str) -> u32 {
        match self.cache.get(&error_key(credential_id)).await {
            Ok(Some(n)) => n.parse::<i64>().map(to_u32).unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                fail_open("error_count", credential_id, &e);
                0
            }
        }
    }

    /// Count the use against both quota periods, then write the lease.
    ///
    /// The quota check and increments are one atomic cache operation, so
    /// concurrent workers can never push a counter past its limit. Returns
    /// false when a quota refused the use; nothing is written then. The
    /// quota TTL is only set by the increment that creates the counter.
    async fn commit(
        &self,
        credential_id: &str,
        task_id: &str,
        limits: QuotaLimits,
        now: DateTime<Utc>,
    ) -> bool {
        let counters: Vec<BoundedCounter> = QuotaPeriod::ALL
            .into_iter()
            .map(|period| BoundedCounter {
                key: quota_key(credential_id, period, now),
                limit: limits.limit(period),
                ttl: period.until_reset(now),
            })
            .collect();
        match self.cache.incr_all_below(&counters).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(credential_id, "quota reached between check and commit");
                return false;
            }
            Err(e) => fail_open("quota_increment", credential_id, &e),
        }

        if let Err(e) = self
            .cache
            .set_ex(
                &lease_key(credential_id, task_id),
                &now.to_rfc3339(),
                self.config.lease_ttl,
            )
            .await
        {
            fail_open("lease", credential_id, &e);
        }
        true
    }
}

/// Count a rejected candidate in the summary. Returns whether the candidate
/// is eligible.
fn tally(summary: &mut ExhaustionSummary, state: CredentialState) -> bool {
    match state {
        CredentialState::Available => return true,
        CredentialState::CoolingDown { .. } => summary.cooling_down += 1,
        CredentialState::QuotaExhausted { .. } => summary.quota_exhausted += 1,
        CredentialState::CircuitOpen => summary.circuit_open += 1,
    }
    false
}
