//! Persistence gateway for calls and their ATH results.
//!
//! The engine needs two things from storage: pull calls that still lack an ATH,
//! and write the three ATH fields of one call atomically. `CallStore` is that
//! contract; `SqliteCallStore` implements it on SQLite.

use crate::types::{AthResult, CallRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

/// One page of pending calls.
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    /// Well-formed calls still lacking an ATH
    pub calls: Vec<CallRecord>,
    /// Highest row id scanned, including rows skipped as malformed.
    /// Pass it back as `after_id` to continue.
    pub cursor: Option<i64>,
}

/// A call as handed over by ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCall {
    pub network: String,
    pub pool_address: String,
    pub call_timestamp: DateTime<Utc>,
    pub entry_price: Decimal,
}

/// ATH fields as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAth {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub roi_percent: Decimal,
}

/// Formal contract for the call store.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Calls with no ATH yet and `id > after_id`, in id order.
    async fn pull_pending(&self, after_id: Option<i64>, limit: u32) -> Result<PendingBatch>;

    /// Write price, timestamp and ROI of one call in a single statement.
    /// Returns false when the call is unknown or already resolved.
    async fn record_ath(&self, call_id: i64, result: &AthResult) -> Result<bool>;

    /// Number of calls still lacking an ATH.
    async fn pending_count(&self) -> Result<i64>;

    /// Clear the ATH fields of the given calls so they are resolved again.
    async fn clear_ath(&self, call_ids: &[i64]) -> Result<u64>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool>;
}

#[derive(FromRow)]
struct CallRow {
    id: i64,
    network: String,
    pool_address: String,
    call_timestamp: i64,
    entry_price: String,
}

#[derive(FromRow)]
struct AthRow {
    ath_price: Option<String>,
    ath_timestamp: Option<i64>,
    roi_percent: Option<String>,
}

/// SQLite implementation of `CallStore`.
pub struct SqliteCallStore {
    pool: Pool<Sqlite>,
}

impl SqliteCallStore {
    /// Connect and create the schema if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database is a fresh database.
        let in_memory = database_url.contains(":memory:");
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to SQLite database {}", database_url))?;

        Self::create_schema(&pool).await?;

        info!("SqliteCallStore initialized and connected to {}", database_url);
        Ok(Self { pool })
    }

    /// Private in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                network TEXT NOT NULL,
                pool_address TEXT NOT NULL,
                call_timestamp INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                ath_price TEXT,
                ath_timestamp INTEGER,
                roi_percent TEXT
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create calls table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_pending ON calls (id) WHERE ath_price IS NULL")
            .execute(pool)
            .await
            .context("Failed to create pending index")?;

        Ok(())
    }

    /// Get a reference to the database pool.
    pub fn get_db_pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Insert a call. Ingestion owns this path; the engine never calls it.
    pub async fn insert_call(&self, call: &NewCall) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO calls (network, pool_address, call_timestamp, entry_price) VALUES (?, ?, ?, ?)",
        )
        .bind(&call.network)
        .bind(&call.pool_address)
        .bind(call.call_timestamp.timestamp())
        .bind(call.entry_price.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert call")?;

        Ok(result.last_insert_rowid())
    }

    /// Persisted ATH of a call, if resolved.
    pub async fn get_ath(&self, call_id: i64) -> Result<Option<StoredAth>> {
        let row: Option<AthRow> = sqlx::query_as(
            "SELECT ath_price, ath_timestamp, roi_percent FROM calls WHERE id = ?",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch ATH by call id")?;

        let Some(AthRow {
            ath_price: Some(price),
            ath_timestamp: Some(timestamp),
            roi_percent: Some(roi),
        }) = row
        else {
            return Ok(None);
        };

        Ok(Some(StoredAth {
            price: Decimal::from_str(&price).context("Invalid stored ath_price")?,
            timestamp: DateTime::from_timestamp(timestamp, 0)
                .context("Invalid stored ath_timestamp")?,
            roi_percent: Decimal::from_str(&roi).context("Invalid stored roi_percent")?,
        }))
    }

    fn row_to_call(row: CallRow) -> Option<CallRecord> {
        let entry_price = match Decimal::from_str(&row.entry_price) {
            Ok(price) if price > Decimal::ZERO => price,
            _ => {
                warn!("Skipping call {}: invalid entry price {:?}", row.id, row.entry_price);
                return None;
            }
        };
        let Some(call_timestamp) = DateTime::from_timestamp(row.call_timestamp, 0) else {
            warn!("Skipping call {}: invalid call timestamp {}", row.id, row.call_timestamp);
            return None;
        };

        Some(CallRecord {
            id: row.id,
            network: row.network,
            pool_address: row.pool_address,
            call_timestamp,
            entry_price,
        })
    }
}

#[async_trait]
impl CallStore for SqliteCallStore {
    #[instrument(skip(self))]
    async fn pull_pending(&self, after_id: Option<i64>, limit: u32) -> Result<PendingBatch> {
        let rows: Vec<CallRow> = sqlx::query_as(
            r#"
            SELECT id, network, pool_address, call_timestamp, entry_price
            FROM calls
            WHERE ath_price IS NULL AND id > ?
            ORDER BY id ASC
            LIMIT ?;
            "#,
        )
        .bind(after_id.unwrap_or(i64::MIN))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending calls")?;

        let cursor = rows.last().map(|row| row.id);
        let calls: Vec<CallRecord> = rows.into_iter().filter_map(Self::row_to_call).collect();

        debug!("Pulled {} pending calls (cursor {:?})", calls.len(), cursor);
        Ok(PendingBatch { calls, cursor })
    }

    async fn record_ath(&self, call_id: i64, result: &AthResult) -> Result<bool> {
        debug!("Recording ATH for call {}", call_id);

        let outcome = sqlx::query(
            r#"
            UPDATE calls
            SET ath_price = ?, ath_timestamp = ?, roi_percent = ?
            WHERE id = ? AND ath_price IS NULL;
            "#,
        )
        .bind(result.price.to_string())
        .bind(result.timestamp.timestamp())
        .bind(result.roi_percent.to_string())
        .bind(call_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record ATH for call {}", call_id))?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM calls WHERE ath_price IS NULL")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count pending calls")?;

        Ok(count.0)
    }

    async fn clear_ath(&self, call_ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut cleared = 0;

        for call_id in call_ids {
            cleared += sqlx::query(
                "UPDATE calls SET ath_price = NULL, ath_timestamp = NULL, roi_percent = NULL WHERE id = ?",
            )
            .bind(call_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to clear ATH for call {}", call_id))?
            .rows_affected();
        }

        tx.commit().await.context("Failed to commit transaction")?;
        info!("Cleared ATH for {} calls", cleared);
        Ok(cleared)
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
