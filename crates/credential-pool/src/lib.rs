//! Credential pool for rate-limited third-party APIs
//!
//! Every collector asks the pool for a credential before calling a provider,
//! and reports failures back. The pool picks the least-recently-used eligible
//! credential for a (platform, tier), decrypts it, and records the lease and
//! quota usage in the shared cache.
//!
//! Credential lifecycle:
//! 1. Operator adds a credential to the durable store (or sets an
//!    `{PLATFORM}_{TIER}_API_KEY[_N]` environment variable)
//! 2. `acquire` selects it least-recently-used first, skipping cooldowns,
//!    exhausted quotas, open circuits, and undecryptable payloads
//! 3. `report_error` counts failures; 429/401/403-class failures start an
//!    exponential cooldown (1, 2, 4, 8 minutes, capped at 60)
//! 4. At 5 errors the circuit breaker opens: the credential stays out of
//!    rotation until an operator calls `reset_errors`
//! 5. `release` drops the advisory lease; unreleased leases expire on their own

pub mod category;
pub mod cooldown;
pub mod env;
pub mod error;
pub mod pool;
pub mod quota;

pub use category::ErrorCategory;
pub use cooldown::{CIRCUIT_BREAKER_THRESHOLD, MAX_COOLDOWN, cooldown_for};
pub use env::{EnvCredential, EnvSource, ProcessEnv};
pub use error::{ExhaustionSummary, PoolError, Result};
pub use pool::{
    CredentialHandle, CredentialPool, CredentialSource, CredentialState, CredentialStatus,
    ErrorReport, PoolConfig, PoolStatus,
};
pub use quota::{Clock, ManualClock, QuotaLimits, QuotaPeriod, SystemClock};
