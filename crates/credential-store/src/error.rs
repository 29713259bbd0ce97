//! Error types for durable storage and payload encryption

/// Errors from the durable credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("credential already exists for {platform}/{tier}/{account}")]
    Duplicate {
        platform: String,
        tier: String,
        account: String,
    },

    #[error("invalid tier: {0}")]
    InvalidTier(String),

    #[error("corrupt credential row {id}: {detail}")]
    Corrupt { id: String, detail: String },
}

/// Errors from encrypting or decrypting credential payloads.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("payload is not a JSON object: {0}")]
    Malformed(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
