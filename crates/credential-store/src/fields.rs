//! Decrypted credential fields
//!
//! Payloads are arbitrary JSON objects because every platform needs a
//! different set of secrets (API key, bearer token, client id + secret, ...).
//! Fields stay string-keyed; a collector validates the keys it needs with
//! `require` / `require_all` when it consumes a handle.

use std::collections::BTreeMap;

use common::Secret;
use zeroize::Zeroize;

use crate::error::CipherError;

/// A collector asked for a field the credential does not carry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("credential is missing required field `{field}`")]
pub struct MissingField {
    pub field: String,
}

/// Secret field map of one credential. Values are redacted in Debug output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialFields(BTreeMap<String, Secret<String>>);

impl CredentialFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-field payload, the shape of environment-sourced API keys.
    pub fn api_key(value: impl Into<String>) -> Self {
        let mut fields = Self::new();
        fields.insert("api_key", value);
        fields
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), Secret::new(value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.expose().as_str())
    }

    /// Field value, or `MissingField` naming the absent key.
    pub fn require(&self, key: &str) -> std::result::Result<&str, MissingField> {
        self.get(key).ok_or_else(|| MissingField {
            field: key.to_string(),
        })
    }

    /// Check that every key a collector needs is present.
    pub fn require_all(&self, keys: &[&str]) -> std::result::Result<(), MissingField> {
        keys.iter().try_for_each(|k| self.require(k).map(|_| ()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a decrypted JSON object. String values are kept verbatim; other
    /// JSON values keep their JSON text (`42`, `true`, `{"a":1}`).
    pub fn from_json_slice(bytes: &[u8]) -> std::result::Result<Self, CipherError> {
        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(bytes).map_err(|e| CipherError::Malformed(e.to_string()))?;
        let mut fields = Self::new();
        for (key, value) in object {
            match value {
                serde_json::Value::String(s) => fields.insert(key, s),
                other => fields.insert(key, other.to_string()),
            }
        }
        Ok(fields)
    }

    /// Serialize to the JSON object encrypted into `encrypted_payload`.
    /// The caller owns the plaintext and must zeroize it.
    pub(crate) fn to_json_vec(&self) -> Vec<u8> {
        let mut object = serde_json::Map::new();
        for (key, value) in &self.0 {
            object.insert(key.clone(), serde_json::Value::String(value.expose().clone()));
        }
        let bytes = serde_json::to_vec(&object).unwrap_or_default();
        for value in object.values_mut() {
            if let serde_json::Value::String(s) = value {
                s.zeroize();
            }
        }
        bytes
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CredentialFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Self::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}
