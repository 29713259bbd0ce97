//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The payload encryption key is loaded from CREDENTIAL_ENCRYPTION_KEY or
//! encryption.key_file, never stored in the TOML directly to avoid leaking
//! secrets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use credential_pool::{PoolConfig, QuotaLimits};
use credential_store::Tier;
use rate_limiter::{ArenaLimits, RateLimitTable};
use serde::Deserialize;

/// Env var holding the age identity that decrypts credential payloads.
pub const ENCRYPTION_KEY_ENV: &str = "CREDENTIAL_ENCRYPTION_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub quotas: Vec<QuotaEntry>,
    /// Default rate limit tables keyed by arena name.
    #[serde(default)]
    pub rate_limits: HashMap<String, ArenaLimits>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Redis,
    /// Process-local cache. State is not shared between processes, so this
    /// is only suitable for a single worker or local development.
    Memory,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL, e.g. `sqlite:///var/lib/governor/credentials.db`.
    pub database_url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EncryptionConfig {
    #[serde(skip)]
    pub key: Option<Secret<String>>,
    /// Path to a file containing the key (alternative to the env var)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

/// Quota for one (platform, tier). Omitted limits are unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaEntry {
    pub platform: String,
    pub tier: Tier,
    #[serde(default)]
    pub daily: Option<u64>,
    #[serde(default)]
    pub monthly: Option<u64>,
}

fn default_max_connections() -> usize {
    256
}

fn default_lease_ttl() -> u64 {
    3600
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Encryption key resolution order:
    /// 1. CREDENTIAL_ENCRYPTION_KEY env var
    /// 2. encryption.key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        // Resolve encryption key: env var takes precedence over file
        if let Ok(key) = std::env::var(ENCRYPTION_KEY_ENV) {
            config.encryption.key = Some(Secret::new(key.trim().to_owned()));
        } else if let Some(ref key_file) = config.encryption.key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read encryption key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.encryption.key = Some(Secret::new(key));
            }
        }

        if config.encryption.key.is_none() {
            return Err(common::Error::Config(format!(
                "no encryption key: set {ENCRYPTION_KEY_ENV} or encryption.key_file"
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.cache.backend == CacheBackend::Redis {
            match self.cache.redis_url.as_deref() {
                Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {}
                Some(url) => {
                    return Err(common::Error::Config(format!(
                        "redis_url must start with redis:// or rediss://, got: {url}"
                    )));
                }
                None => {
                    return Err(common::Error::Config(
                        "cache.redis_url is required unless cache.backend = \"memory\"".into(),
                    ));
                }
            }
        }

        if !self.store.database_url.starts_with("sqlite:") {
            return Err(common::Error::Config(format!(
                "database_url must be a sqlite: URL, got: {}",
                self.store.database_url
            )));
        }

        if self.pool.lease_ttl_secs == 0 {
            return Err(common::Error::Config(
                "lease_ttl_secs must be greater than 0".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for quota in &self.quotas {
            if !seen.insert((quota.platform.as_str(), quota.tier)) {
                return Err(common::Error::Config(format!(
                    "duplicate quota for {}/{}",
                    quota.platform, quota.tier
                )));
            }
        }

        for (arena, limits) in &self.rate_limits {
            if limits.windows.is_empty() {
                return Err(common::Error::Config(format!(
                    "rate_limits.{arena} must define at least one window"
                )));
            }
            if limits.windows.iter().any(|w| w.window_secs == 0) {
                return Err(common::Error::Config(format!(
                    "rate_limits.{arena} has a window of 0 seconds"
                )));
            }
            let mut sizes = std::collections::HashSet::new();
            if let Some(dup) = limits.windows.iter().find(|w| !sizes.insert(w.window_secs)) {
                return Err(common::Error::Config(format!(
                    "rate_limits.{arena} defines the {}s window twice",
                    dup.window_secs
                )));
            }
        }

        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let mut pool = PoolConfig {
            lease_ttl: Duration::from_secs(self.pool.lease_ttl_secs),
            ..PoolConfig::default()
        };
        for quota in &self.quotas {
            pool = pool.with_quota(
                &quota.platform,
                quota.tier,
                QuotaLimits {
                    daily: quota.daily,
                    monthly: quota.monthly,
                },
            );
        }
        pool
    }

    pub fn rate_limit_table(&self) -> RateLimitTable {
        RateLimitTable::new(self.rate_limits.clone())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("credential-governor.toml")
    }
}
