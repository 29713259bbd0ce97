//! Durable credential storage
//!
//! The relational credential table is the single source of truth for
//! `error_count`, `last_used_at` and `is_active`. Secret material is stored
//! only as age ciphertext (`encrypted_payload`); `PayloadCipher` turns it into
//! `CredentialFields` at lease time.
//!
//! Credential lifecycle:
//! 1. Operator inserts a record (payload encrypted with the deployment key)
//! 2. Pool lists active candidates least-recently-used first
//! 3. A successful lease stamps `last_used_at`
//! 4. Reported failures increment `error_count`; only an operator resets it
//! 5. Records are deactivated, never deleted automatically

pub mod cipher;
pub mod error;
pub mod fields;
pub mod record;
pub mod store;

pub use cipher::PayloadCipher;
pub use error::{CipherError, Result, StoreError};
pub use fields::{CredentialFields, MissingField};
pub use record::{CredentialRecord, NewCredential, Tier};
pub use store::{CredentialStore, SqliteCredentialStore, StoreFuture};
