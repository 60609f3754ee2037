//! Snapshot pipeline orchestration: query → normalize → partition replace → notify.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::types::Date32Type;
use arrow_array::{ArrayRef, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Local, NaiveDate};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use wsnap_adapters::{FixtureQuerySource, HttpQuerySource, QuerySource, SourceError, DEFAULT_SCREEN_QUERY};
use wsnap_core::{normalize_table, CanonicalRecord, SourceTable, CODE_COLUMNS};
use wsnap_storage::{
    HttpClientConfig, LogNotifier, MemorySnapshotStore, Notifier, PgSnapshotStore, RestSnapshotStore, SnapshotArchive,
    SnapshotStore, StoreError, WebhookNotifier,
};

pub const CRATE_NAME: &str = "wsnap-sync";

const PREVIEW_LIMIT: usize = 10;
const DEFAULT_QUERY_ENDPOINT: &str = "https://www.iwencai.com/customized/chart/get-robot-data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Every row is inserted; uniqueness is left to the store.
    #[default]
    KeepAll,
    FirstWins,
    LastWins,
}

impl DuplicatePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "keep" | "keep-all" => Some(Self::KeepAll),
            "first" | "first-wins" => Some(Self::FirstWins),
            "last" | "last-wins" => Some(Self::LastWins),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cookie: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub database_url: Option<String>,
    pub table: String,
    pub webhook_url: Option<String>,
    pub query: String,
    pub query_endpoint: String,
    pub artifacts_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub dedup: String,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            cookie: non_empty_env("THS_COOKIE"),
            supabase_url: non_empty_env("SUPABASE_URL"),
            supabase_key: non_empty_env("SUPABASE_KEY"),
            database_url: non_empty_env("DATABASE_URL"),
            table: non_empty_env("WSNAP_TABLE").unwrap_or_else(|| "stocks".to_string()),
            webhook_url: non_empty_env("DINGTALK_WEBHOOK"),
            query: non_empty_env("WSNAP_QUERY").unwrap_or_else(|| DEFAULT_SCREEN_QUERY.to_string()),
            query_endpoint: non_empty_env("WSNAP_QUERY_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_QUERY_ENDPOINT.to_string()),
            artifacts_dir: non_empty_env("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            http_timeout_secs: non_empty_env("WSNAP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30),
            user_agent: non_empty_env("WSNAP_USER_AGENT").unwrap_or_else(|| "wsnap/0.1".to_string()),
            dedup: std::env::var("WSNAP_DEDUP").unwrap_or_default(),
        }
    }

    pub fn missing_source_vars(&self) -> Vec<&'static str> {
        if self.cookie.is_none() {
            vec!["THS_COOKIE"]
        } else {
            Vec::new()
        }
    }

    /// Either `DATABASE_URL` or the REST url/key pair selects a backend.
    pub fn missing_store_vars(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.database_url.is_none() {
            if self.supabase_url.is_none() {
                missing.push("SUPABASE_URL");
            }
            if self.supabase_key.is_none() {
                missing.push("SUPABASE_KEY");
            }
        }
        missing
    }

    /// A live run needs the source credential and one store backend.
    pub fn require_live(&self) -> Result<(), ConfigError> {
        let mut missing = self.missing_source_vars();
        missing.extend(self.missing_store_vars());
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(missing))
        }
    }

    pub fn duplicate_policy(&self) -> Result<DuplicatePolicy, ConfigError> {
        DuplicatePolicy::parse(&self.dedup).ok_or_else(|| ConfigError::Invalid {
            name: "WSNAP_DEDUP",
            value: self.dedup.clone(),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.artifacts_dir.join("reports")
    }
}

/// Pre-insert hook over the normalized batch.
pub trait DedupHook: Send + Sync {
    fn apply(&self, records: Vec<CanonicalRecord>) -> Vec<CanonicalRecord>;
}

#[derive(Default)]
pub struct NoopDedupHook;

impl DedupHook for NoopDedupHook {
    fn apply(&self, records: Vec<CanonicalRecord>) -> Vec<CanonicalRecord> {
        records
    }
}

/// Collapses rows sharing a `code`. Survivors keep the position of the
/// code's first appearance.
pub struct CodeDedupHook {
    policy: DuplicatePolicy,
}

impl CodeDedupHook {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }
}

impl DedupHook for CodeDedupHook {
    fn apply(&self, records: Vec<CanonicalRecord>) -> Vec<CanonicalRecord> {
        if self.policy == DuplicatePolicy::KeepAll {
            return records;
        }
        let before = records.len();
        let mut slots: HashMap<i64, usize> = HashMap::new();
        let mut kept: Vec<CanonicalRecord> = Vec::with_capacity(records.len());
        for record in records {
            match slots.get(&record.code) {
                Some(&slot) => {
                    if self.policy == DuplicatePolicy::LastWins {
                        kept[slot] = record;
                    }
                }
                None => {
                    slots.insert(record.code, kept.len());
                    kept.push(record);
                }
            }
        }
        if kept.len() != before {
            warn!(dropped = before - kept.len(), policy = ?self.policy, "collapsed duplicate codes");
        }
        kept
    }
}

pub fn dedup_hook_for(policy: DuplicatePolicy) -> Box<dyn DedupHook> {
    match policy {
        DuplicatePolicy::KeepAll => Box::<NoopDedupHook>::default(),
        policy => Box::new(CodeDedupHook::new(policy)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub submitted: usize,
    /// Set when the partition delete failed and stale rows may remain.
    pub cleanup_warning: Option<String>,
}

/// Replace one partition: best-effort delete, then a single bulk insert.
pub async fn ingest(
    store: &dyn SnapshotStore,
    records: &[CanonicalRecord],
    update_date: NaiveDate,
) -> Result<IngestReport, StoreError> {
    let cleanup_warning = match store.delete_partition(update_date).await {
        Ok(()) => {
            info!(%update_date, table = store.table(), "cleared existing partition");
            None
        }
        Err(err) => {
            warn!(%update_date, error = %err, "partition cleanup failed; continuing with insert");
            Some(err.to_string())
        }
    };

    if records.is_empty() {
        info!(%update_date, "no valid records to insert");
        return Ok(IngestReport {
            submitted: 0,
            cleanup_warning,
        });
    }

    let submitted = store.insert_batch(records).await?;
    info!(%update_date, submitted, "inserted partition batch");
    Ok(IngestReport {
        submitted,
        cleanup_warning,
    })
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("query source unavailable: {0}")]
    Source(#[from] SourceError),
    #[error("bulk insert failed: {0}")]
    Insert(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    ZeroResultNotified,
    SuccessNotified,
    ErrorNotified,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub update_date: NaiveDate,
    pub state: RunState,
    pub success: bool,
    pub count: usize,
    pub fetched_rows: usize,
    /// Rows dropped for lacking a usable code or name.
    pub skipped_rows: usize,
    /// Valid rows folded away by the duplicate-code policy.
    pub collapsed_rows: usize,
    pub cleanup_warning: Option<String>,
    pub error: Option<String>,
}

impl RunOutcome {
    fn new(update_date: NaiveDate, state: RunState) -> Self {
        Self {
            update_date,
            state,
            success: state != RunState::ErrorNotified,
            count: 0,
            fetched_rows: 0,
            skipped_rows: 0,
            collapsed_rows: 0,
            cleanup_warning: None,
            error: None,
        }
    }
}

enum RunProgress {
    NoData,
    Ingested {
        records: Vec<CanonicalRecord>,
        fetched_rows: usize,
        skipped_rows: usize,
        report: IngestReport,
    },
}

fn has_identifier_column(table: &SourceTable) -> bool {
    table
        .columns
        .iter()
        .any(|c| CODE_COLUMNS.contains(&c.as_str()))
}

pub fn success_message(update_date: NaiveDate, records: &[CanonicalRecord]) -> String {
    let mut message = format!("**股票数据更新通知** ({})\n\n", update_date.format("%Y-%m-%d"));
    message.push_str(&format!("**符合条件股票数量**: {} 只\n\n", records.len()));
    if records.is_empty() {
        message.push_str("**提示**: 今日无符合条件的股票\n");
    } else {
        message.push_str("**部分股票列表**:\n");
        for (i, record) in records.iter().take(PREVIEW_LIMIT).enumerate() {
            let change = record
                .auction_change_pct
                .or(record.latest_change_pct)
                .map(|v| format!("{v:.2}%"))
                .unwrap_or_default();
            message.push_str(&format!(
                "{}. {:06} {} {}\n",
                i + 1,
                record.code,
                record.stock_name,
                change
            ));
        }
        if records.len() > PREVIEW_LIMIT {
            message.push_str(&format!("... 还有 {} 只股票\n", records.len() - PREVIEW_LIMIT));
        }
    }
    message.push_str("\n**数据已更新到数据库**");
    message
}

pub fn zero_result_message(update_date: NaiveDate) -> String {
    format!(
        "**股票数据更新通知** ({})\n\n**符合条件股票数量**: 0 只\n\n**提示**: 今日无符合条件的股票",
        update_date.format("%Y-%m-%d")
    )
}

pub fn error_message(err: &dyn std::fmt::Display, at: chrono::NaiveDateTime) -> String {
    format!(
        "**股票数据获取失败**\n\n**时间**: {}\n**错误信息**: {}",
        at.format("%Y-%m-%d %H:%M:%S"),
        err
    )
}

pub struct SnapshotPipeline {
    source: Arc<dyn QuerySource>,
    store: Arc<dyn SnapshotStore>,
    notifier: Arc<dyn Notifier>,
    dedup: Box<dyn DedupHook>,
    archive: Option<SnapshotArchive>,
    reports_dir: Option<PathBuf>,
    query: String,
    credential: String,
}

impl SnapshotPipeline {
    pub fn new(
        source: Arc<dyn QuerySource>,
        store: Arc<dyn SnapshotStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            dedup: Box::<NoopDedupHook>::default(),
            archive: None,
            reports_dir: None,
            query: DEFAULT_SCREEN_QUERY.to_string(),
            credential: String::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>, credential: impl Into<String>) -> Self {
        self.query = query.into();
        self.credential = credential.into();
        self
    }

    pub fn with_dedup(mut self, dedup: Box<dyn DedupHook>) -> Self {
        self.dedup = dedup;
        self
    }

    /// Keep raw responses and a parquet copy of each partition on disk.
    pub fn with_archive(mut self, archive: SnapshotArchive, reports_dir: impl Into<PathBuf>) -> Self {
        self.archive = Some(archive);
        self.reports_dir = Some(reports_dir.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// One daily run keyed by today's local date.
    pub async fn fetch_and_ingest(&self) -> RunOutcome {
        self.fetch_and_ingest_for(Local::now().date_naive()).await
    }

    /// One run for an explicit partition date. Never returns an error: every
    /// failure ends in an error notification and a failed outcome.
    pub async fn fetch_and_ingest_for(&self, update_date: NaiveDate) -> RunOutcome {
        let span = info_span!("snapshot_run", %update_date, source = self.source.source_id());
        async move {
            info!("starting snapshot run");
            match self.try_run(update_date).await {
                Ok(RunProgress::NoData) => {
                    info!("query source returned no data");
                    self.notifier.notify(&zero_result_message(update_date)).await;
                    RunOutcome::new(update_date, RunState::ZeroResultNotified)
                }
                Ok(RunProgress::Ingested {
                    records,
                    fetched_rows,
                    skipped_rows,
                    report,
                }) => {
                    self.notifier.notify(&success_message(update_date, &records)).await;
                    let mut outcome = RunOutcome::new(update_date, RunState::SuccessNotified);
                    outcome.count = report.submitted;
                    outcome.fetched_rows = fetched_rows;
                    outcome.skipped_rows = skipped_rows;
                    outcome.collapsed_rows = fetched_rows.saturating_sub(skipped_rows + records.len());
                    outcome.cleanup_warning = report.cleanup_warning;
                    info!(count = outcome.count, skipped = outcome.skipped_rows, "snapshot run complete");
                    outcome
                }
                Err(err) => {
                    error!(error = %err, "snapshot run failed");
                    self.notifier
                        .notify(&error_message(&err, Local::now().naive_local()))
                        .await;
                    let mut outcome = RunOutcome::new(update_date, RunState::ErrorNotified);
                    outcome.error = Some(err.to_string());
                    outcome
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_run(&self, update_date: NaiveDate) -> Result<RunProgress, RunError> {
        let response = self.source.query(&self.query, &self.credential).await?;
        self.archive_raw(update_date, &response.raw).await;

        let Some(mut table) = response.table else {
            return Ok(RunProgress::NoData);
        };
        info!(rows = table.len(), columns = table.columns.len(), "fetched screen result");
        if !has_identifier_column(&table) {
            return Err(SourceError::Shape(format!(
                "no identifier column among {:?}",
                table.columns
            ))
            .into());
        }
        table.strip_identifier_suffixes();

        let (records, skipped_rows) = self.normalize(&table, update_date);
        let report = ingest(self.store.as_ref(), &records, update_date).await?;
        self.export_partition(update_date, &records);

        Ok(RunProgress::Ingested {
            records,
            fetched_rows: table.len(),
            skipped_rows,
            report,
        })
    }

    /// Normalized, deduplicated records plus the count of malformed rows.
    fn normalize(&self, table: &SourceTable, update_date: NaiveDate) -> (Vec<CanonicalRecord>, usize) {
        let records = normalize_table(table, update_date);
        let skipped = table.len() - records.len();
        if skipped > 0 {
            info!(skipped, "dropped rows without a usable code or name");
        }
        (self.dedup.apply(records), skipped)
    }

    async fn archive_raw(&self, update_date: NaiveDate, raw: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.archive(update_date, raw).await {
            Ok(stored) => info!(
                path = %stored.absolute_path.display(),
                deduplicated = stored.deduplicated,
                "archived raw query response"
            ),
            Err(err) => warn!(error = %err, "could not archive raw query response"),
        }
    }

    fn export_partition(&self, update_date: NaiveDate, records: &[CanonicalRecord]) {
        let Some(reports_dir) = &self.reports_dir else {
            return;
        };
        match export_partition_snapshot(reports_dir, update_date, records) {
            Ok(manifest) => info!(path = %manifest.display(), "exported partition snapshot"),
            Err(err) => warn!(error = %err, "could not export partition snapshot"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub update_date: NaiveDate,
    pub rows: usize,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn float_column(records: &[CanonicalRecord], get: impl Fn(&CanonicalRecord) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(records.iter().map(get).collect::<Vec<_>>()))
}

fn text_column<'a>(
    records: &'a [CanonicalRecord],
    get: impl Fn(&'a CanonicalRecord) -> Option<&'a str>,
) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(get).collect::<Vec<_>>()))
}

fn code_column(records: &[CanonicalRecord]) -> ArrayRef {
    Arc::new(Int64Array::from(records.iter().map(|r| r.code).collect::<Vec<_>>()))
}

fn date_column(records: &[CanonicalRecord]) -> ArrayRef {
    Arc::new(Date32Array::from(
        records
            .iter()
            .map(|r| Date32Type::from_naive_date(r.update_date))
            .collect::<Vec<_>>(),
    ))
}

pub fn partition_record_batch(records: &[CanonicalRecord]) -> Result<RecordBatch> {
    let columns: Vec<(&str, DataType, bool, ArrayRef)> = vec![
        ("code", DataType::Int64, false, code_column(records)),
        ("stock_name", DataType::Utf8, false, text_column(records, |r| Some(r.stock_name.as_str()))),
        ("latest_price", DataType::Float64, true, float_column(records, |r| r.latest_price)),
        ("latest_change_pct", DataType::Float64, true, float_column(records, |r| r.latest_change_pct)),
        ("listing_board", DataType::Utf8, true, text_column(records, |r| r.listing_board.as_deref())),
        ("auction_change_pct", DataType::Float64, true, float_column(records, |r| r.auction_change_pct)),
        ("pe_ttm", DataType::Float64, true, float_column(records, |r| r.pe_ttm)),
        ("pe", DataType::Float64, true, float_column(records, |r| r.pe)),
        ("dde_large_order", DataType::Float64, true, float_column(records, |r| r.dde_large_order)),
        ("volume_ratio", DataType::Float64, true, float_column(records, |r| r.volume_ratio)),
        ("interval_change_13d", DataType::Float64, true, float_column(records, |r| r.interval_change_13d)),
        ("interval_change_5d", DataType::Float64, true, float_column(records, |r| r.interval_change_5d)),
        ("listing_days", DataType::Float64, true, float_column(records, |r| r.listing_days)),
        ("forecast_pe_1y", DataType::Float64, true, float_column(records, |r| r.forecast_pe_1y)),
        ("forecast_pe_2y", DataType::Float64, true, float_column(records, |r| r.forecast_pe_2y)),
        ("forecast_pe_3y", DataType::Float64, true, float_column(records, |r| r.forecast_pe_3y)),
        ("market_cap", DataType::Float64, true, float_column(records, |r| r.market_cap)),
        ("eps", DataType::Float64, true, float_column(records, |r| r.eps)),
        ("gross_margin", DataType::Float64, true, float_column(records, |r| r.gross_margin)),
        ("net_margin", DataType::Float64, true, float_column(records, |r| r.net_margin)),
        ("auction_price", DataType::Float64, true, float_column(records, |r| r.auction_price)),
        ("auction_type", DataType::Utf8, true, text_column(records, |r| r.auction_type.as_deref())),
        ("auction_desc", DataType::Utf8, true, text_column(records, |r| r.auction_desc.as_deref())),
        ("auction_rating", DataType::Utf8, true, text_column(records, |r| r.auction_rating.as_deref())),
        ("auction_volume", DataType::Float64, true, float_column(records, |r| r.auction_volume)),
        ("auction_amount", DataType::Float64, true, float_column(records, |r| r.auction_amount)),
        ("market_code", DataType::Utf8, true, text_column(records, |r| r.market_code.as_deref())),
        ("update_date", DataType::Date32, false, date_column(records)),
    ];

    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(name, data_type, nullable, _)| ArrowField::new(*name, data_type.clone(), *nullable))
            .collect::<Vec<_>>(),
    ));
    let arrays = columns.into_iter().map(|(_, _, _, array)| array).collect::<Vec<_>>();
    RecordBatch::try_new(schema, arrays).context("building partition record batch")
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Write `<reports_dir>/<date>/stocks.parquet` plus a JSON manifest; returns
/// the manifest path.
pub fn export_partition_snapshot(
    reports_dir: &Path,
    update_date: NaiveDate,
    records: &[CanonicalRecord],
) -> Result<PathBuf> {
    let dir = reports_dir.join(update_date.format("%Y-%m-%d").to_string());
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let parquet_path = dir.join("stocks.parquet");
    write_parquet(&parquet_path, &partition_record_batch(records)?)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        update_date,
        rows: records.len(),
        files: vec![manifest_entry("stocks", &dir, &parquet_path)?],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes).with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Partition overview, newest first; at most `limit` dates are listed.
pub fn partition_status_lines(counts: &BTreeMap<NaiveDate, usize>, limit: usize) -> Vec<String> {
    let total: usize = counts.values().sum();
    let mut lines = vec![
        format!("records: {total}"),
        format!("partitions: {}", counts.len()),
    ];
    for (date, count) in counts.iter().rev().take(limit.max(1)) {
        lines.push(format!("  - {}: {count}", date.format("%Y-%m-%d")));
    }
    if counts.len() > limit.max(1) {
        lines.push(format!("  ... {} more", counts.len() - limit.max(1)));
    }
    lines
}

/// Open the configured store: direct Postgres when `DATABASE_URL` is set,
/// otherwise the REST endpoint.
pub async fn connect_store(config: &SyncConfig, client: reqwest::Client) -> Result<Arc<dyn SnapshotStore>> {
    if let Some(database_url) = &config.database_url {
        let store = PgSnapshotStore::connect(database_url, config.table.clone())
            .await
            .context("connecting to postgres")?;
        return Ok(Arc::new(store));
    }
    let (Some(url), Some(key)) = (&config.supabase_url, &config.supabase_key) else {
        return Err(ConfigError::Missing(config.missing_store_vars()).into());
    };
    let store = RestSnapshotStore::new(client, url, key, config.table.clone()).context("configuring rest store")?;
    Ok(Arc::new(store))
}

pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn SnapshotStore>> {
    let client = config.http_client_config().build_client()?;
    connect_store(config, client).await
}

pub fn pipeline_with_store(
    config: &SyncConfig,
    fixture: Option<PathBuf>,
    store: Arc<dyn SnapshotStore>,
    client: reqwest::Client,
) -> Result<SnapshotPipeline> {
    let source: Arc<dyn QuerySource> = match fixture {
        Some(path) => Arc::new(FixtureQuerySource::new(path)),
        None => Arc::new(HttpQuerySource::new(client.clone(), config.query_endpoint.clone())),
    };
    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(client, url.clone())),
        None => Arc::new(LogNotifier),
    };
    let dedup = dedup_hook_for(config.duplicate_policy()?);
    Ok(SnapshotPipeline::new(source, store, notifier)
        .with_query(config.query.clone(), config.cookie.clone().unwrap_or_default())
        .with_dedup(dedup)
        .with_archive(SnapshotArchive::new(config.artifacts_dir.clone()), config.reports_dir()))
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Serve the query result from a saved file instead of the live source.
    pub fixture: Option<PathBuf>,
    /// Ingest into an in-process store; nothing is written remotely.
    pub dry_run: bool,
}

/// Validate configuration, check the store is reachable, then run once.
pub async fn run_sync(config: &SyncConfig, options: SyncOptions) -> Result<RunOutcome> {
    let mut missing = Vec::new();
    if options.fixture.is_none() {
        missing.extend(config.missing_source_vars());
    }
    if !options.dry_run {
        missing.extend(config.missing_store_vars());
    }
    if !missing.is_empty() {
        return Err(ConfigError::Missing(missing).into());
    }

    let client = config.http_client_config().build_client()?;
    let store: Arc<dyn SnapshotStore> = if options.dry_run {
        info!("dry run: ingesting into an in-memory store");
        Arc::new(MemorySnapshotStore::new())
    } else {
        connect_store(config, client.clone()).await?
    };
    store
        .ping()
        .await
        .with_context(|| format!("store table {} is not reachable", store.table()))?;

    let pipeline = pipeline_with_store(config, options.fixture, store, client)?;
    Ok(pipeline.fetch_and_ingest().await)
}

pub async fn run_once_from_env() -> Result<RunOutcome> {
    run_sync(&SyncConfig::from_env(), SyncOptions::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn record(code: i64, name: &str) -> CanonicalRecord {
        CanonicalRecord::new(code, name, day())
    }

    #[tokio::test]
    async fn ingest_replaces_the_partition() {
        let store = MemorySnapshotStore::new();
        store.seed([record(1, "old"), record(2, "old")]).await;

        let report = ingest(&store, &[record(3, "new")], day()).await.expect("ingest");
        assert_eq!(report.submitted, 1);
        assert!(report.cleanup_warning.is_none());

        let rows = store.select_partition(day()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].code, 3);
    }

    #[tokio::test]
    async fn empty_batch_clears_but_does_not_insert() {
        let store = MemorySnapshotStore::new();
        store.seed([record(1, "old")]).await;

        let report = ingest(&store, &[], day()).await.expect("ingest");
        assert_eq!(report.submitted, 0);
        assert_eq!(store.insert_calls(), 0);
        assert_eq!(store.delete_calls(), 1);
        assert!(store.all_records().await.is_empty());
    }

    #[tokio::test]
    async fn failed_cleanup_is_a_warning() {
        let store = MemorySnapshotStore::new().with_failing_delete("permission denied");
        let report = ingest(&store, &[record(1, "a")], day()).await.expect("ingest");
        assert_eq!(report.submitted, 1);
        assert_eq!(report.cleanup_warning.as_deref(), Some("permission denied"));
    }

    #[tokio::test]
    async fn failed_insert_is_surfaced() {
        let store = MemorySnapshotStore::new().with_failing_insert("unique violation");
        let err = ingest(&store, &[record(1, "a")], day()).await.unwrap_err();
        assert!(err.to_string().contains("unique violation"));
        assert_eq!(store.insert_calls(), 1);
    }

    #[test]
    fn dedup_policies() {
        let batch = vec![record(1, "a1"), record(2, "b"), record(1, "a2")];

        let kept = dedup_hook_for(DuplicatePolicy::KeepAll).apply(batch.clone());
        assert_eq!(kept.len(), 3);

        let first = dedup_hook_for(DuplicatePolicy::FirstWins).apply(batch.clone());
        assert_eq!(
            first.iter().map(|r| r.stock_name.as_str()).collect::<Vec<_>>(),
            vec!["a1", "b"]
        );

        let last = dedup_hook_for(DuplicatePolicy::LastWins).apply(batch);
        assert_eq!(
            last.iter().map(|r| r.stock_name.as_str()).collect::<Vec<_>>(),
            vec!["a2", "b"]
        );
    }

    #[test]
    fn duplicate_policy_parsing() {
        assert_eq!(DuplicatePolicy::parse(""), Some(DuplicatePolicy::KeepAll));
        assert_eq!(DuplicatePolicy::parse("First"), Some(DuplicatePolicy::FirstWins));
        assert_eq!(DuplicatePolicy::parse("last-wins"), Some(DuplicatePolicy::LastWins));
        assert_eq!(DuplicatePolicy::parse("random"), None);
    }

    #[test]
    fn success_message_previews_ten_rows() {
        let mut records: Vec<_> = (1..=12).map(|i| record(i, "股票")).collect();
        records[0].auction_change_pct = Some(2.346);
        records[1].latest_change_pct = Some(-1.0);
        let message = success_message(day(), &records);
        assert!(message.starts_with("**股票数据更新通知** (2025-03-14)"));
        assert!(message.contains("**符合条件股票数量**: 12 只"));
        assert!(message.contains("1. 000001 股票 2.35%\n"));
        assert!(message.contains("2. 000002 股票 -1.00%\n"));
        assert!(message.contains("10. 000010 股票 \n"));
        assert!(!message.contains("11. 000011"));
        assert!(message.contains("... 还有 2 只股票"));
    }

    #[test]
    fn success_message_without_records_says_none_qualified() {
        let message = success_message(day(), &[]);
        assert!(message.contains("**符合条件股票数量**: 0 只"));
        assert!(message.contains("今日无符合条件的股票"));
        assert!(!message.contains("部分股票列表"));
    }

    #[test]
    fn error_message_carries_timestamp_and_cause() {
        let at = day().and_hms_opt(9, 26, 3).unwrap();
        let message = error_message(&"connection reset", at);
        assert!(message.contains("**时间**: 2025-03-14 09:26:03"));
        assert!(message.contains("**错误信息**: connection reset"));
    }

    fn bare_config(artifacts_dir: PathBuf) -> SyncConfig {
        SyncConfig {
            cookie: None,
            supabase_url: None,
            supabase_key: None,
            database_url: None,
            table: "stocks".into(),
            webhook_url: None,
            query: DEFAULT_SCREEN_QUERY.into(),
            query_endpoint: DEFAULT_QUERY_ENDPOINT.into(),
            artifacts_dir,
            http_timeout_secs: 30,
            user_agent: "wsnap-test".into(),
            dedup: String::new(),
        }
    }

    #[test]
    fn missing_live_configuration_is_reported() {
        let config = SyncConfig {
            supabase_url: Some("https://x.supabase.co".into()),
            ..bare_config(PathBuf::from("./artifacts"))
        };
        match config.require_live() {
            Err(ConfigError::Missing(names)) => assert_eq!(names, vec!["THS_COOKIE", "SUPABASE_KEY"]),
            other => panic!("unexpected {other:?}"),
        }

        let direct = SyncConfig {
            cookie: Some("c".into()),
            database_url: Some("postgres://localhost/wsnap".into()),
            supabase_url: None,
            ..config
        };
        assert!(direct.require_live().is_ok());
    }

    #[test]
    fn unknown_dedup_policy_is_rejected() {
        let config = SyncConfig {
            dedup: "sometimes".into(),
            ..bare_config(PathBuf::from("./artifacts"))
        };
        assert!(matches!(
            config.duplicate_policy(),
            Err(ConfigError::Invalid { name: "WSNAP_DEDUP", .. })
        ));
    }

    #[tokio::test]
    async fn live_sync_without_credentials_fails_fast() {
        let config = bare_config(PathBuf::from("./artifacts"));
        let err = run_sync(&config, SyncOptions::default()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("THS_COOKIE"));
        assert!(message.contains("SUPABASE_URL"));
    }

    #[tokio::test]
    async fn dry_run_from_fixture_needs_no_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = bare_config(dir.path().to_path_buf());
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/screens/three_rows.json");

        let outcome = run_sync(
            &config,
            SyncOptions {
                fixture: Some(fixture),
                dry_run: true,
            },
        )
        .await
        .expect("dry run");

        assert!(outcome.success);
        assert_eq!(outcome.count, 2);
        assert!(dir.path().join("raw").exists());
        assert!(dir.path().join("reports").exists());
    }

    #[test]
    fn status_lines_list_newest_first() {
        let counts: BTreeMap<NaiveDate, usize> = (1..=7)
            .map(|d| (NaiveDate::from_ymd_opt(2025, 3, d).unwrap(), d as usize))
            .collect();
        let lines = partition_status_lines(&counts, 5);
        assert_eq!(lines[0], "records: 28");
        assert_eq!(lines[1], "partitions: 7");
        assert_eq!(lines[2], "  - 2025-03-07: 7");
        assert_eq!(lines[6], "  - 2025-03-03: 3");
        assert_eq!(lines[7], "  ... 2 more");
    }

    #[test]
    fn partition_export_writes_parquet_and_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut first = record(600519, "贵州茅台");
        first.latest_price = Some(1532.1);
        first.listing_board = Some("主板".into());
        let manifest_path =
            export_partition_snapshot(dir.path(), day(), &[first, record(1, "平安银行")]).expect("export");

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["rows"], 2);
        assert_eq!(manifest["update_date"], "2025-03-14");
        assert_eq!(manifest["files"][0]["path"], "stocks.parquet");
        assert!(dir.path().join("2025-03-14/stocks.parquet").exists());
    }

    #[test]
    fn record_batch_matches_store_columns() {
        let batch = partition_record_batch(&[record(1, "a")]).expect("batch");
        let names: Vec<_> = batch.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, wsnap_core::RECORD_COLUMNS.to_vec());
        assert_eq!(batch.num_rows(), 1);
    }

    #[test]
    fn update_date_is_stored_as_days_since_epoch() {
        let batch = partition_record_batch(&[record(1, "a")]).expect("batch");
        let dates = batch
            .column_by_name("update_date")
            .and_then(|c| c.as_any().downcast_ref::<Date32Array>())
            .expect("date32 column");
        assert_eq!(dates.value(0), 20161);
        assert_eq!(dates.value_as_date(0), Some(day()));
    }

    #[test]
    fn blank_environment_values_fall_back_to_defaults() {
        std::env::set_var("WSNAP_TABLE", "");
        std::env::set_var("WSNAP_USER_AGENT", "   ");
        let config = SyncConfig::from_env();
        std::env::remove_var("WSNAP_TABLE");
        std::env::remove_var("WSNAP_USER_AGENT");
        assert_eq!(config.table, "stocks");
        assert_eq!(config.user_agent, "wsnap/0.1");
    }
}
