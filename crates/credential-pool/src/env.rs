//! Environment-sourced pseudo-credentials
//!
//! Deployments that predate the credential table configure keys as
//! environment variables: `{PLATFORM}_{TIER}_API_KEY`, plus
//! `{PLATFORM}_{TIER}_API_KEY_{N}` for additional keys of the same pair.
//! Each variable becomes a credential whose id is derived from the variable
//! name, so cooldown and quota state keyed on it survives restarts.

use std::collections::{BTreeMap, HashMap};

use common::Secret;
use credential_store::Tier;
use sha2::{Digest, Sha256};

/// Prefix of every environment credential id.
pub const ENV_ID_PREFIX: &str = "env-";

/// Where variables are read from. Injectable so tests never touch the
/// process environment.
pub trait EnvSource: Send + Sync {
    fn vars(&self) -> Vec<(String, String)>;
}

/// The real process environment. Non-UTF-8 variables are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn vars(&self) -> Vec<(String, String)> {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }
}

impl EnvSource for HashMap<String, String> {
    fn vars(&self) -> Vec<(String, String)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn vars(&self) -> Vec<(String, String)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// A key discovered in the environment.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    pub id: String,
    pub variable: String,
    pub api_key: Secret<String>,
}

/// Variable name stem for a (platform, tier): `youtube-data` + `free` gives
/// `YOUTUBE_DATA_FREE_API_KEY`.
pub fn variable_base(platform: &str, tier: Tier) -> String {
    let platform: String = platform
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("{platform}_{}_API_KEY", tier.as_str().to_ascii_uppercase())
}

/// Stable id for the credential held in `variable`.
pub fn credential_id(variable: &str) -> String {
    let digest = Sha256::digest(variable.as_bytes());
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{ENV_ID_PREFIX}{hex}")
}

pub fn is_env_credential(id: &str) -> bool {
    id.starts_with(ENV_ID_PREFIX)
}

/// Discover keys for (platform, tier): the unsuffixed variable first, then
/// numbered variables in ascending order. Empty values are skipped.
pub fn discover(env: &dyn EnvSource, platform: &str, tier: Tier) -> Vec<EnvCredential> {
    let base = variable_base(platform, tier);
    let mut found: Vec<(Option<u32>, String, String)> = env
        .vars()
        .into_iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .filter_map(|(name, value)| {
            let suffix = if name == base {
                None
            } else {
                let n = name.strip_prefix(&base)?.strip_prefix('_')?.parse().ok()?;
                Some(n)
            };
            Some((suffix, name, value))
        })
        .collect();
    // None sorts before Some
    found.sort_by_key(|(suffix, _, _)| *suffix);

    found
        .into_iter()
        .map(|(_, variable, value)| EnvCredential {
            id: credential_id(&variable),
            api_key: Secret::new(value.trim().to_string()),
            variable,
        })
        .collect()
}
