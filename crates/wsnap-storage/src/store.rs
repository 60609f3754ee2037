use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use wsnap_core::{CanonicalRecord, RECORD_COLUMNS};

/// Postgres caps bind parameters per statement at 65535.
const PG_ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http status {status} during {operation}: {body}")]
    HttpStatus {
        status: u16,
        operation: &'static str,
        body: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Row store partitioned by `update_date`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn table(&self) -> &str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn select_partition(&self, update_date: NaiveDate) -> Result<Vec<CanonicalRecord>, StoreError>;

    async fn delete_partition(&self, update_date: NaiveDate) -> Result<(), StoreError>;

    /// Insert all records in one call; returns the number submitted.
    async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError>;

    async fn partition_counts(&self) -> Result<BTreeMap<NaiveDate, usize>, StoreError>;
}

fn validate_table(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

/// PostgREST-dialect client (Supabase `rest/v1`).
#[derive(Debug, Clone)]
pub struct RestSnapshotStore {
    client: reqwest::Client,
    base_url: String,
    table: String,
    headers: HeaderMap,
}

#[derive(Debug, Deserialize)]
struct PartitionKeyRow {
    update_date: NaiveDate,
}

impl RestSnapshotStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: &str,
        table: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table(&table)?;
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| StoreError::Unavailable("api key is not a valid header value".to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| StoreError::Unavailable("api key is not a valid header value".to_string()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            table,
            headers,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    pub fn partition_filter(update_date: NaiveDate) -> String {
        format!("eq.{}", update_date.format("%Y-%m-%d"))
    }

    async fn checked(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::HttpStatus {
            status: status.as_u16(),
            operation,
            body,
        })
    }
}

#[async_trait]
impl SnapshotStore for RestSnapshotStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let resp = self
            .client
            .get(self.endpoint())
            .headers(self.headers.clone())
            .query(&[("select", "update_date"), ("limit", "1")])
            .send()
            .await?;
        Self::checked("ping", resp).await?;
        Ok(())
    }

    async fn select_partition(&self, update_date: NaiveDate) -> Result<Vec<CanonicalRecord>, StoreError> {
        let resp = self
            .client
            .get(self.endpoint())
            .headers(self.headers.clone())
            .query(&[
                ("select", "*".to_string()),
                ("update_date", Self::partition_filter(update_date)),
                ("order", "code.asc".to_string()),
            ])
            .send()
            .await?;
        let resp = Self::checked("select", resp).await?;
        Ok(resp.json::<Vec<CanonicalRecord>>().await?)
    }

    async fn delete_partition(&self, update_date: NaiveDate) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(self.endpoint())
            .headers(self.headers.clone())
            .query(&[("update_date", Self::partition_filter(update_date))])
            .send()
            .await?;
        Self::checked("delete", resp).await?;
        Ok(())
    }

    async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        let resp = self
            .client
            .post(self.endpoint())
            .headers(self.headers.clone())
            .header("Prefer", "return=minimal")
            .json(records)
            .send()
            .await?;
        Self::checked("insert", resp).await?;
        Ok(records.len())
    }

    async fn partition_counts(&self) -> Result<BTreeMap<NaiveDate, usize>, StoreError> {
        let resp = self
            .client
            .get(self.endpoint())
            .headers(self.headers.clone())
            .query(&[("select", "update_date")])
            .send()
            .await?;
        let rows = Self::checked("count", resp)
            .await?
            .json::<Vec<PartitionKeyRow>>()
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            *counts.entry(row.update_date).or_default() += 1;
        }
        Ok(counts)
    }
}

/// Direct Postgres store for `DATABASE_URL` deployments.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
    table: String,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table(&table)?;
        Ok(Self { pool, table })
    }

    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Self::new(pool, table)
    }

    /// Create the table and its partition index when missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                code BIGINT NOT NULL,
                stock_name TEXT NOT NULL,
                latest_price DOUBLE PRECISION,
                latest_change_pct DOUBLE PRECISION,
                listing_board TEXT,
                auction_change_pct DOUBLE PRECISION,
                pe_ttm DOUBLE PRECISION,
                pe DOUBLE PRECISION,
                dde_large_order DOUBLE PRECISION,
                volume_ratio DOUBLE PRECISION,
                interval_change_13d DOUBLE PRECISION,
                interval_change_5d DOUBLE PRECISION,
                listing_days DOUBLE PRECISION,
                forecast_pe_1y DOUBLE PRECISION,
                forecast_pe_2y DOUBLE PRECISION,
                forecast_pe_3y DOUBLE PRECISION,
                market_cap DOUBLE PRECISION,
                eps DOUBLE PRECISION,
                gross_margin DOUBLE PRECISION,
                net_margin DOUBLE PRECISION,
                auction_price DOUBLE PRECISION,
                auction_type TEXT,
                auction_desc TEXT,
                auction_rating TEXT,
                auction_volume DOUBLE PRECISION,
                auction_amount DOUBLE PRECISION,
                market_code TEXT,
                update_date DATE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table = self.table
        );
        sqlx::query(&create).execute(&self.pool).await?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_update_date_idx ON {table} (update_date)",
            table = self.table
        );
        sqlx::query(&index).execute(&self.pool).await?;
        Ok(())
    }

    fn insert_statement(&self, chunk: &[CanonicalRecord]) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            self.table,
            RECORD_COLUMNS.join(", ")
        ));
        builder.push_values(chunk.iter().cloned(), |mut b, r| {
            b.push_bind(r.code)
                .push_bind(r.stock_name)
                .push_bind(r.latest_price)
                .push_bind(r.latest_change_pct)
                .push_bind(r.listing_board)
                .push_bind(r.auction_change_pct)
                .push_bind(r.pe_ttm)
                .push_bind(r.pe)
                .push_bind(r.dde_large_order)
                .push_bind(r.volume_ratio)
                .push_bind(r.interval_change_13d)
                .push_bind(r.interval_change_5d)
                .push_bind(r.listing_days)
                .push_bind(r.forecast_pe_1y)
                .push_bind(r.forecast_pe_2y)
                .push_bind(r.forecast_pe_3y)
                .push_bind(r.market_cap)
                .push_bind(r.eps)
                .push_bind(r.gross_margin)
                .push_bind(r.net_margin)
                .push_bind(r.auction_price)
                .push_bind(r.auction_type)
                .push_bind(r.auction_desc)
                .push_bind(r.auction_rating)
                .push_bind(r.auction_volume)
                .push_bind(r.auction_amount)
                .push_bind(r.market_code)
                .push_bind(r.update_date);
        });
        builder
    }
}

fn record_from_row(row: &PgRow) -> Result<CanonicalRecord, sqlx::Error> {
    Ok(CanonicalRecord {
        code: row.try_get("code")?,
        stock_name: row.try_get("stock_name")?,
        latest_price: row.try_get("latest_price")?,
        latest_change_pct: row.try_get("latest_change_pct")?,
        listing_board: row.try_get("listing_board")?,
        auction_change_pct: row.try_get("auction_change_pct")?,
        pe_ttm: row.try_get("pe_ttm")?,
        pe: row.try_get("pe")?,
        dde_large_order: row.try_get("dde_large_order")?,
        volume_ratio: row.try_get("volume_ratio")?,
        interval_change_13d: row.try_get("interval_change_13d")?,
        interval_change_5d: row.try_get("interval_change_5d")?,
        listing_days: row.try_get("listing_days")?,
        forecast_pe_1y: row.try_get("forecast_pe_1y")?,
        forecast_pe_2y: row.try_get("forecast_pe_2y")?,
        forecast_pe_3y: row.try_get("forecast_pe_3y")?,
        market_cap: row.try_get("market_cap")?,
        eps: row.try_get("eps")?,
        gross_margin: row.try_get("gross_margin")?,
        net_margin: row.try_get("net_margin")?,
        auction_price: row.try_get("auction_price")?,
        auction_type: row.try_get("auction_type")?,
        auction_desc: row.try_get("auction_desc")?,
        auction_rating: row.try_get("auction_rating")?,
        auction_volume: row.try_get("auction_volume")?,
        auction_amount: row.try_get("auction_amount")?,
        market_code: row.try_get("market_code")?,
        update_date: row.try_get("update_date")?,
    })
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("SELECT update_date FROM {} LIMIT 1", self.table))
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    async fn select_partition(&self, update_date: NaiveDate) -> Result<Vec<CanonicalRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE update_date = $1 ORDER BY code",
            RECORD_COLUMNS.join(", "),
            self.table
        );
        let rows = sqlx::query(&sql).bind(update_date).fetch_all(&self.pool).await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn delete_partition(&self, update_date: NaiveDate) -> Result<(), StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE update_date = $1", self.table))
            .bind(update_date)
            .execute(&self.pool)
            .await?;
        debug!(rows = result.rows_affected(), %update_date, "deleted partition rows");
        Ok(())
    }

    async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        // Chunks share one transaction so the batch still lands all-or-nothing.
        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(PG_ROWS_PER_STATEMENT) {
            self.insert_statement(chunk).build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn partition_counts(&self) -> Result<BTreeMap<NaiveDate, usize>, StoreError> {
        let sql = format!(
            "SELECT update_date, COUNT(*) AS n FROM {} GROUP BY update_date",
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let date: NaiveDate = row.try_get("update_date")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(date, n.max(0) as usize);
        }
        Ok(counts)
    }
}

/// In-process store for tests and dry runs. Deletes and inserts can be made
/// to fail on demand.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    rows: Mutex<Vec<CanonicalRecord>>,
    fail_delete: Option<String>,
    fail_insert: Option<String>,
    delete_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_delete(mut self, message: impl Into<String>) -> Self {
        self.fail_delete = Some(message.into());
        self
    }

    pub fn with_failing_insert(mut self, message: impl Into<String>) -> Self {
        self.fail_insert = Some(message.into());
        self
    }

    pub async fn seed(&self, records: impl IntoIterator<Item = CanonicalRecord>) {
        self.rows.lock().await.extend(records);
    }

    pub async fn all_records(&self) -> Vec<CanonicalRecord> {
        self.rows.lock().await.clone()
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    fn table(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn select_partition(&self, update_date: NaiveDate) -> Result<Vec<CanonicalRecord>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| r.update_date == update_date)
            .cloned()
            .collect())
    }

    async fn delete_partition(&self, update_date: NaiveDate) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_delete {
            return Err(StoreError::Unavailable(message.clone()));
        }
        self.rows.lock().await.retain(|r| r.update_date != update_date);
        Ok(())
    }

    async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_insert {
            return Err(StoreError::Unavailable(message.clone()));
        }
        self.rows.lock().await.extend_from_slice(records);
        Ok(records.len())
    }

    async fn partition_counts(&self) -> Result<BTreeMap<NaiveDate, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for record in self.rows.lock().await.iter() {
            *counts.entry(record.update_date).or_default() += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(validate_table("stocks").is_ok());
        assert!(validate_table("stocks_2025").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("1stocks").is_err());
        assert!(validate_table("stocks; DROP TABLE x").is_err());
    }

    #[test]
    fn rest_store_builds_postgrest_urls() {
        let store = RestSnapshotStore::new(
            reqwest::Client::new(),
            "https://example.supabase.co/",
            "secret",
            "stocks",
        )
        .expect("store");
        assert_eq!(store.endpoint(), "https://example.supabase.co/rest/v1/stocks");
        assert_eq!(RestSnapshotStore::partition_filter(day(14)), "eq.2025-03-14");
        assert_eq!(store.headers["apikey"], "secret");
        assert_eq!(store.headers[AUTHORIZATION], "Bearer secret");
    }

    #[tokio::test]
    async fn memory_store_replaces_only_the_target_partition() {
        let store = MemorySnapshotStore::new();
        store
            .seed([
                CanonicalRecord::new(1, "a", day(13)),
                CanonicalRecord::new(2, "b", day(14)),
            ])
            .await;

        store.delete_partition(day(14)).await.expect("delete");
        store
            .insert_batch(&[CanonicalRecord::new(3, "c", day(14))])
            .await
            .expect("insert");

        let counts = store.partition_counts().await.expect("counts");
        assert_eq!(counts.get(&day(13)), Some(&1));
        assert_eq!(counts.get(&day(14)), Some(&1));
        let partition = store.select_partition(day(14)).await.expect("select");
        assert_eq!(partition[0].code, 3);
    }

    #[tokio::test]
    async fn memory_store_injected_failures_leave_rows_untouched() {
        let store = MemorySnapshotStore::new()
            .with_failing_delete("delete refused")
            .with_failing_insert("insert refused");
        store.seed([CanonicalRecord::new(1, "a", day(14))]).await;

        assert!(store.delete_partition(day(14)).await.is_err());
        assert!(store
            .insert_batch(&[CanonicalRecord::new(2, "b", day(14))])
            .await
            .is_err());
        assert_eq!(store.all_records().await.len(), 1);
        assert_eq!(store.delete_calls(), 1);
        assert_eq!(store.insert_calls(), 1);
    }
}
