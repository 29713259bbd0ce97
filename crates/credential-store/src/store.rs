//! Credential store trait and SQLite implementation
//!
//! All mutations are single SQL statements, so concurrent workers sharing the
//! database never lose an `error_count` increment or interleave a
//! read-modify-write.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::record::{CredentialRecord, NewCredential, Tier};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const COLUMNS: &str = "id, platform, tier, account, encrypted_payload, error_count, \
                       circuit_open, last_used_at, is_active, created_at";

/// Boxed future returned by `CredentialStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable credential records.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Active credentials for (platform, tier), least-recently-used first.
    /// Never-used credentials come before used ones; ties break on `id`.
    fn active_candidates<'a>(
        &'a self,
        platform: &'a str,
        tier: Tier,
    ) -> StoreFuture<'a, Vec<CredentialRecord>>;

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<CredentialRecord>>;

    /// All credentials, optionally restricted to one platform.
    fn list<'a>(&'a self, platform: Option<&'a str>) -> StoreFuture<'a, Vec<CredentialRecord>>;

    fn insert(&self, credential: NewCredential) -> StoreFuture<'_, CredentialRecord>;

    fn touch_last_used<'a>(&'a self, id: &'a str, at: DateTime<Utc>) -> StoreFuture<'a, ()>;

    /// Atomically increment `error_count`. `None` when no row has this id.
    fn increment_error_count<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<u32>>;

    /// Take the credential out of rotation until `reset_error_count`.
    /// Returns whether the row exists.
    fn open_circuit<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;

    /// Operator reset: `error_count` to zero and the circuit closed. Returns
    /// whether the row exists.
    fn reset_error_count<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;

    /// Returns whether the row exists.
    fn set_active<'a>(&'a self, id: &'a str, active: bool) -> StoreFuture<'a, bool>;

    fn ping(&self) -> StoreFuture<'_, ()>;
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    platform: String,
    tier: String,
    account: String,
    encrypted_payload: Vec<u8>,
    error_count: i64,
    circuit_open: bool,
    last_used_at: Option<i64>,
    is_active: bool,
    created_at: i64,
}

fn timestamp(id: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        detail: format!("timestamp out of range: {millis}"),
    })
}

impl TryFrom<CredentialRow> for CredentialRecord {
    type Error = StoreError;

    fn try_from(row: CredentialRow) -> Result<Self> {
        let tier = Tier::from_str(&row.tier).map_err(|_| StoreError::Corrupt {
            id: row.id.clone(),
            detail: format!("unknown tier {:?}", row.tier),
        })?;
        let last_used_at = row
            .last_used_at
            .map(|ms| timestamp(&row.id, ms))
            .transpose()?;
        let created_at = timestamp(&row.id, row.created_at)?;
        Ok(CredentialRecord {
            tier,
            last_used_at,
            created_at,
            error_count: u32::try_from(row.error_count.max(0)).unwrap_or(u32::MAX),
            circuit_open: row.circuit_open,
            id: row.id,
            platform: row.platform,
            account: row.account,
            encrypted_payload: row.encrypted_payload,
            is_active: row.is_active,
        })
    }
}

fn into_records(rows: Vec<CredentialRow>) -> Result<Vec<CredentialRecord>> {
    rows.into_iter().map(CredentialRecord::try_from).collect()
}

/// SQLite-backed credential store.
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite:///var/lib/governor/credentials.db`, and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!("credential store ready");
        Ok(Self { pool })
    }

    /// Private in-memory database. Pinned to a single connection that is
    /// never recycled, since every SQLite memory connection is its own
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn active_candidates<'a>(
        &'a self,
        platform: &'a str,
        tier: Tier,
    ) -> StoreFuture<'a, Vec<CredentialRecord>> {
        Box::pin(async move {
            let rows: Vec<CredentialRow> = sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM credentials \
                 WHERE platform = ? AND tier = ? AND is_active = 1 \
                 ORDER BY last_used_at IS NOT NULL, last_used_at ASC, id ASC"
            ))
            .bind(platform)
            .bind(tier.as_str())
            .fetch_all(&self.pool)
            .await?;
            into_records(rows)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<CredentialRecord>> {
        Box::pin(async move {
            let row: Option<CredentialRow> =
                sqlx::query_as(&format!("SELECT {COLUMNS} FROM credentials WHERE id = ?"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(CredentialRecord::try_from).transpose()
        })
    }

    fn list<'a>(&'a self, platform: Option<&'a str>) -> StoreFuture<'a, Vec<CredentialRecord>> {
        Box::pin(async move {
            let rows: Vec<CredentialRow> = match platform {
                Some(platform) => {
                    sqlx::query_as(&format!(
                        "SELECT {COLUMNS} FROM credentials WHERE platform = ? \
                         ORDER BY platform, tier, account"
                    ))
                    .bind(platform)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as(&format!(
                        "SELECT {COLUMNS} FROM credentials ORDER BY platform, tier, account"
                    ))
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            into_records(rows)
        })
    }

    fn insert(&self, credential: NewCredential) -> StoreFuture<'_, CredentialRecord> {
        Box::pin(async move {
            let id = uuid::Uuid::new_v4().to_string();
            let created_at = Utc::now();
            let inserted = sqlx::query(
                "INSERT INTO credentials \
                 (id, platform, tier, account, encrypted_payload, error_count, is_active, created_at) \
                 VALUES (?, ?, ?, ?, ?, 0, 1, ?)",
            )
            .bind(&id)
            .bind(&credential.platform)
            .bind(credential.tier.as_str())
            .bind(&credential.account)
            .bind(&credential.encrypted_payload)
            .bind(created_at.timestamp_millis())
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    return Err(StoreError::Duplicate {
                        platform: credential.platform,
                        tier: credential.tier.to_string(),
                        account: credential.account,
                    });
                }
                Err(e) => return Err(e.into()),
            }

            debug!(credential_id = %id, platform = %credential.platform, tier = %credential.tier, "credential inserted");
            Ok(CredentialRecord {
                id,
                platform: credential.platform,
                tier: credential.tier,
                account: credential.account,
                encrypted_payload: credential.encrypted_payload,
                error_count: 0,
                circuit_open: false,
                last_used_at: None,
                is_active: true,
                created_at: timestamp("new", created_at.timestamp_millis())?,
            })
        })
    }

    fn touch_last_used<'a>(&'a self, id: &'a str, at: DateTime<Utc>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query("UPDATE credentials SET last_used_at = ? WHERE id = ?")
                .bind(at.timestamp_millis())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn increment_error_count<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<u32>> {
        Box::pin(async move {
            let row: Option<(i64,)> = sqlx::query_as(
                "UPDATE credentials SET error_count = error_count + 1 \
                 WHERE id = ? RETURNING error_count",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(|(count,)| u32::try_from(count.max(0)).unwrap_or(u32::MAX)))
        })
    }

    fn open_circuit<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE credentials SET circuit_open = 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn reset_error_count<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result =
                sqlx::query("UPDATE credentials SET error_count = 0, circuit_open = 0 WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn set_active<'a>(&'a self, id: &'a str, active: bool) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE credentials SET is_active = ? WHERE id = ?")
                .bind(active)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
    }
}
