//! Durable credential record types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Access tier of a credential. Quotas and rate limits are configured per
/// (platform, tier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Medium,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Medium, Tier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Medium => "medium",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "medium" => Ok(Tier::Medium),
            "premium" => Ok(Tier::Premium),
            other => Err(StoreError::InvalidTier(other.to_string())),
        }
    }
}

/// One row of the credential table.
///
/// `encrypted_payload` never leaves the process in serialized form; admin
/// listings serialize everything else.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialRecord {
    pub id: String,
    pub platform: String,
    pub tier: Tier,
    /// Provider account label; unique per (platform, tier).
    pub account: String,
    #[serde(skip)]
    pub encrypted_payload: Vec<u8>,
    pub error_count: u32,
    /// Out of rotation until an operator resets the credential.
    pub circuit_open: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert request for a new credential. The payload is already encrypted.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub platform: String,
    pub tier: Tier,
    pub account: String,
    pub encrypted_payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert_eq!("free".parse::<Tier>().unwrap(), Tier::Free);
        assert!(matches!(
            "enterprise".parse::<Tier>(),
            Err(StoreError::InvalidTier(t)) if t == "enterprise"
        ));
    }

    #[test]
    fn tier_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Medium).unwrap(), r#""medium""#);
        for tier in Tier::ALL {
            assert_eq!(tier.to_string().parse::<Tier>().unwrap(), tier);
        }
    }

    #[test]
    fn record_serialization_omits_payload() {
        let record = CredentialRecord {
            id: "c1".into(),
            platform: "youtube".into(),
            tier: Tier::Free,
            account: "research-1".into(),
            encrypted_payload: b"ciphertext".to_vec(),
            error_count: 2,
            circuit_open: false,
            last_used_at: None,
            is_active: true,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("encrypted_payload").is_none());
        assert_eq!(json["tier"], "free");
        assert_eq!(json["error_count"], 2);
        assert_eq!(json["circuit_open"], false);
    }
}
