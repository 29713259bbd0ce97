//! Error types for pool operations

use serde::Serialize;

/// Why each candidate of an exhausted (platform, tier) was passed over.
///
/// Lets operators tell "no credentials configured" (`candidates == 0`) apart
/// from "everything is cooling down after errors".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExhaustionSummary {
    pub candidates: usize,
    pub cooling_down: usize,
    pub quota_exhausted: usize,
    pub circuit_open: usize,
    pub undecryptable: usize,
}

impl std::fmt::Display for ExhaustionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "candidates={} cooling_down={} quota_exhausted={} circuit_open={} undecryptable={}",
            self.candidates,
            self.cooling_down,
            self.quota_exhausted,
            self.circuit_open,
            self.undecryptable
        )
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no credential available for {platform}/{tier} ({summary})")]
    NoCredentialAvailable {
        platform: String,
        tier: String,
        summary: ExhaustionSummary,
    },

    #[error("credential store error: {0}")]
    Store(#[from] credential_store::StoreError),

    /// Only diagnostic operations (`leases`) surface cache errors.
    #[error("cache error: {0}")]
    Cache(#[from] cache::CacheError),
}

impl PoolError {
    /// JSON body for HTTP callers, in the shape of the pool status counts.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PoolError::NoCredentialAvailable {
                platform,
                tier,
                summary,
            } => serde_json::json!({
                "error": {
                    "type": "no_credential_available",
                    "message": self.to_string(),
                    "platform": platform,
                    "tier": tier,
                    "pool": summary,
                }
            }),
            PoolError::Store(_) => serde_json::json!({
                "error": { "type": "store_error", "message": self.to_string() }
            }),
            PoolError::Cache(_) => serde_json::json!({
                "error": { "type": "cache_error", "message": self.to_string() }
            }),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_message_names_platform_tier_and_reasons() {
        let err = PoolError::NoCredentialAvailable {
            platform: "reddit".into(),
            tier: "free".into(),
            summary: ExhaustionSummary {
                candidates: 3,
                cooling_down: 2,
                circuit_open: 1,
                ..Default::default()
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("reddit/free"));
        assert!(msg.contains("cooling_down=2"));
        assert!(msg.contains("circuit_open=1"));

        let json = err.to_json();
        assert_eq!(json["error"]["type"], "no_credential_available");
        assert_eq!(json["error"]["pool"]["candidates"], 3);
    }
}
