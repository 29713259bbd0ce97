//! Payload encryption with age
//!
//! The deployment holds one age X25519 identity (`AGE-SECRET-KEY-1...`).
//! Payloads are encrypted to its public recipient when an operator adds a
//! credential, and decrypted with the identity when a credential is leased.
//! A payload encrypted to another key, truncated, or otherwise tampered with
//! fails with `CipherError::Decrypt`; the pool skips that candidate.

use std::io::{Read, Write};
use std::str::FromStr;

use age::x25519;
use zeroize::Zeroize;

use crate::error::CipherError;
use crate::fields::CredentialFields;

type CipherResult<T> = std::result::Result<T, CipherError>;

/// Symmetric-in-practice payload cipher: one identity both encrypts (to its
/// own recipient) and decrypts.
pub struct PayloadCipher {
    identity: x25519::Identity,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("recipient", &self.recipient())
            .finish()
    }
}

impl PayloadCipher {
    /// Parse an `AGE-SECRET-KEY-1...` identity. Surrounding whitespace is
    /// ignored so key files may end with a newline.
    pub fn from_key(key: &str) -> CipherResult<Self> {
        let identity = x25519::Identity::from_str(key.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Ok(Self { identity })
    }

    /// Fresh random identity (tests, bootstrap tooling).
    pub fn generate() -> Self {
        Self {
            identity: x25519::Identity::generate(),
        }
    }

    /// Public recipient string (`age1...`), safe to log.
    pub fn recipient(&self) -> String {
        self.identity.to_public().to_string()
    }

    pub fn encrypt(&self, fields: &CredentialFields) -> CipherResult<Vec<u8>> {
        let recipients: Vec<Box<dyn age::Recipient + Send>> =
            vec![Box::new(self.identity.to_public())];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| CipherError::Encrypt("no recipients".into()))?;

        let mut plaintext = fields.to_json_vec();
        let mut encrypted = Vec::new();
        let written = (|| -> std::io::Result<()> {
            let mut writer = encryptor
                .wrap_output(&mut encrypted)
                .map_err(std::io::Error::other)?;
            writer.write_all(&plaintext)?;
            writer.finish()?;
            Ok(())
        })();
        plaintext.zeroize();

        written.map_err(|e| CipherError::Encrypt(e.to_string()))?;
        Ok(encrypted)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> CipherResult<CredentialFields> {
        let decryptor = match age::Decryptor::new(ciphertext) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(_) => {
                return Err(CipherError::Decrypt(
                    "payload is passphrase-encrypted, expected recipient encryption".into(),
                ));
            }
            Err(e) => return Err(CipherError::Decrypt(e.to_string())),
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| CipherError::Decrypt(e.to_string()))?;

        let mut plaintext = Vec::new();
        let read = reader.read_to_end(&mut plaintext);
        let fields = read
            .map_err(|e| CipherError::Decrypt(e.to_string()))
            .and_then(|_| CredentialFields::from_json_slice(&plaintext));
        plaintext.zeroize();
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> CredentialFields {
        [("bearer_token", "AAAA-token"), ("api_key", "k-123")]
            .into_iter()
            .collect()
    }

    #[test]
    fn decrypts_what_it_encrypted() {
        let cipher = PayloadCipher::generate();
        let ciphertext = cipher.encrypt(&sample_fields()).unwrap();
        assert!(
            !ciphertext.windows(10).any(|w| w == b"AAAA-token"),
            "plaintext visible in ciphertext"
        );
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), sample_fields());
    }

    #[test]
    fn encrypt_writes_age_v1_payload() {
        let ciphertext = PayloadCipher::generate().encrypt(&sample_fields()).unwrap();
        assert!(ciphertext.starts_with(b"age-encryption.org/v1\n"));
        assert!(ciphertext.windows(6).any(|w| w == b"X25519"));
    }

    #[test]
    fn foreign_key_cannot_decrypt() {
        let ciphertext = PayloadCipher::generate().encrypt(&sample_fields()).unwrap();
        let err = PayloadCipher::generate().decrypt(&ciphertext).unwrap_err();
        assert!(matches!(err, CipherError::Decrypt(_)), "got {err:?}");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = PayloadCipher::generate();
        let mut ciphertext = cipher.encrypt(&sample_fields()).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(matches!(
            cipher.decrypt(&ciphertext),
            Err(CipherError::Decrypt(_))
        ));

        assert!(cipher.decrypt(b"not age at all").is_err());
    }

    #[test]
    fn key_round_trips_through_string_form() {
        let dir = tempfile::tempdir().unwrap();
        let original = PayloadCipher::generate();
        let ciphertext = original.encrypt(&sample_fields()).unwrap();

        let key_path = dir.path().join("payload.key");
        let secret = age::secrecy::ExposeSecret::expose_secret(&original.identity.to_string())
            .to_string();
        std::fs::write(&key_path, format!("{secret}\n")).unwrap();

        let loaded = PayloadCipher::from_key(&std::fs::read_to_string(&key_path).unwrap()).unwrap();
        assert_eq!(loaded.recipient(), original.recipient());
        assert_eq!(loaded.decrypt(&ciphertext).unwrap(), sample_fields());
    }

    #[test]
    fn invalid_key_is_rejected() {
        let err = PayloadCipher::from_key("AGE-SECRET-KEY-1NOTREALLY").unwrap_err();
        assert!(matches!(err, CipherError::InvalidKey(_)));
    }

    #[test]
    fn debug_shows_only_recipient() {
        let cipher = PayloadCipher::generate();
        let debug = format!("{cipher:?}");
        assert!(debug.contains("age1"));
        assert!(!debug.contains("AGE-SECRET-KEY"));
    }
}
