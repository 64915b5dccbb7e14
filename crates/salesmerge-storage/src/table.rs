//! SQLite-backed destination table with full-replace semantics.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use salesmerge_core::{CanonicalSaleRow, SourceTag};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid table name `{0}`")]
    InvalidTableName(String),
    #[error("opening sales database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row {position} in `{table}` is malformed: {message}")]
    CorruptRow {
        table: String,
        position: i64,
        message: String,
    },
}

/// Destination for merged rows. Implementations replace the whole table or leave it untouched.
#[async_trait]
pub trait SalesTableSink: Send + Sync {
    async fn replace_table(&self, table: &str, rows: &[CanonicalSaleRow]) -> Result<usize, StoreError>;
}

/// Table names are interpolated into DDL, so only plain identifiers are accepted.
pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && table.len() <= 64;
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(table.to_string()))
    }
}

fn staging_name(table: &str) -> String {
    format!("{table}__staging")
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE {table} (
            row_position INTEGER PRIMARY KEY,
            record_id TEXT NOT NULL,
            product_name TEXT NOT NULL CHECK (length(product_name) > 0),
            unit_price TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity >= 0),
            total_sale_value TEXT NOT NULL,
            occurred_at TEXT,
            source TEXT NOT NULL CHECK (source IN ('BATCH', 'CATALOG'))
        )"
    )
}

pub struct MasterSalesStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl MasterSalesStore {
    /// Opens (creating if needed) the SQLite database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Replaces every row of `table` with `rows` in a single transaction.
    ///
    /// Rows are written to a staging table which is renamed over the live one
    /// just before commit. Any failure rolls the transaction back, so the
    /// previous contents stay visible.
    pub async fn replace_table(&self, table: &str, rows: &[CanonicalSaleRow]) -> Result<usize, StoreError> {
        validate_table_name(table)?;
        let staging = staging_name(table);
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {staging}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(&staging))
            .execute(&mut *tx)
            .await?;

        let insert = format!(
            "INSERT INTO {staging} (row_position, record_id, product_name, unit_price, quantity, total_sale_value, occurred_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        );
        for (position, row) in rows.iter().enumerate() {
            sqlx::query(&insert)
                .bind(position as i64)
                .bind(&row.record_id)
                .bind(&row.product_name)
                .bind(row.unit_price.to_string())
                .bind(i64::from(row.quantity))
                .bind(row.total_sale_value.to_string())
                .bind(row.occurred_at.map(|ts| ts.to_rfc3339()))
                .bind(row.source.as_str())
                .execute(&mut *tx)
                .await?;
        }
        debug!(table, staged = rows.len(), "staged rows");

        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("ALTER TABLE {staging} RENAME TO {table}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(table, rows = rows.len(), "replaced table contents");
        Ok(rows.len())
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        validate_table_name(table)?;
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }

    /// Number of rows in `table`; a table that was never loaded counts as empty.
    pub async fn row_count(&self, table: &str) -> Result<usize, StoreError> {
        if !self.table_exists(table).await? {
            return Ok(0);
        }
        let row = sqlx::query(&format!("SELECT COUNT(*) AS count FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as usize)
    }

    /// Reads rows back in load order, optionally capped at `limit`.
    pub async fn fetch_rows(&self, table: &str, limit: Option<usize>) -> Result<Vec<CanonicalSaleRow>, StoreError> {
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = sqlx::query(&format!(
            "SELECT row_position, record_id, product_name, unit_price, quantity, total_sale_value, occurred_at, source
             FROM {table} ORDER BY row_position LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| decode_row(table, row)).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SalesTableSink for MasterSalesStore {
    async fn replace_table(&self, table: &str, rows: &[CanonicalSaleRow]) -> Result<usize, StoreError> {
        MasterSalesStore::replace_table(self, table, rows).await
    }
}

fn decode_row(table: &str, row: &SqliteRow) -> Result<CanonicalSaleRow, StoreError> {
    let position: i64 = row.try_get("row_position")?;
    let corrupt = |message: String| StoreError::CorruptRow {
        table: table.to_string(),
        position,
        message,
    };

    let unit_price: String = row.try_get("unit_price")?;
    let total_sale_value: String = row.try_get("total_sale_value")?;
    let quantity: i64 = row.try_get("quantity")?;
    let occurred_at: Option<String> = row.try_get("occurred_at")?;
    let source: String = row.try_get("source")?;

    Ok(CanonicalSaleRow {
        record_id: row.try_get("record_id")?,
        product_name: row.try_get("product_name")?,
        unit_price: Decimal::from_str(&unit_price).map_err(|e| corrupt(format!("unit_price: {e}")))?,
        quantity: u32::try_from(quantity).map_err(|e| corrupt(format!("quantity: {e}")))?,
        total_sale_value: Decimal::from_str(&total_sale_value)
            .map_err(|e| corrupt(format!("total_sale_value: {e}")))?,
        occurred_at: occurred_at
            .map(|ts| DateTime::parse_from_rfc3339(&ts).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| corrupt(format!("occurred_at: {e}")))?,
        source: SourceTag::from_str(&source).map_err(|e| corrupt(e.to_string()))?,
    })
}
