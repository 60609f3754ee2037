use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use wsnap_adapters::FixtureQuerySource;
use wsnap_core::CanonicalRecord;
use wsnap_storage::{MemorySnapshotStore, RecordingNotifier, SnapshotArchive, SnapshotStore};
use wsnap_sync::{dedup_hook_for, DuplicatePolicy, RunState, SnapshotPipeline};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/screens")
        .join(name)
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
}

fn pipeline(
    fixture_name: &str,
    store: &Arc<MemorySnapshotStore>,
    notifier: &Arc<RecordingNotifier>,
) -> SnapshotPipeline {
    SnapshotPipeline::new(
        Arc::new(FixtureQuerySource::new(fixture(fixture_name))),
        store.clone(),
        notifier.clone(),
    )
}

#[tokio::test]
async fn rows_without_a_name_are_skipped() {
    let store = Arc::new(MemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline("three_rows.json", &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.state, RunState::SuccessNotified);
    assert_eq!(outcome.count, 2);
    assert_eq!(outcome.fetched_rows, 3);
    assert_eq!(outcome.skipped_rows, 1);

    let rows = store.select_partition(day()).await.unwrap();
    let codes: Vec<_> = rows.iter().map(|r| r.code).collect();
    assert_eq!(codes, vec![600519, 858]);
    assert_eq!(rows[1].latest_price, Some(132.4));
    assert_eq!(rows[0].interval_change_13d, Some(14.9));
    assert_eq!(rows[0].interval_change_5d, Some(10.4));

    let messages = notifier.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("**符合条件股票数量**: 2 只"));
    assert!(messages[0].contains("1. 600519 贵州茅台 1.62%"));
    assert!(messages[0].contains("2. 000858 五粮液 2.05%"));
}

#[tokio::test]
async fn empty_result_notifies_without_touching_the_store() {
    let store = Arc::new(MemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline("empty.json", &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.count, 0);
    assert_eq!(outcome.state, RunState::ZeroResultNotified);
    assert_eq!(store.delete_calls(), 0);
    assert_eq!(store.insert_calls(), 0);

    let messages = notifier.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("今日无符合条件的股票"));
}

#[tokio::test]
async fn failed_cleanup_still_inserts() {
    let store = Arc::new(MemorySnapshotStore::new().with_failing_delete("delete rejected"));
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline("five_rows.json", &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.count, 5);
    assert_eq!(outcome.cleanup_warning.as_deref(), Some("delete rejected"));
    assert_eq!(store.insert_calls(), 1);

    let rows = store.all_records().await;
    let codes: Vec<_> = rows.iter().map(|r| r.code).collect();
    assert_eq!(codes, vec![600036, 601318, 2594, 300059, 830799]);
    assert_eq!(rows[0].auction_type.as_deref(), Some("竞价抢筹"));
    assert_eq!(rows[4].listing_board.as_deref(), Some("北证"));

    let messages = notifier.messages().await;
    assert!(messages[0].contains("**符合条件股票数量**: 5 只"));
}

#[tokio::test]
async fn rerun_for_the_same_date_is_idempotent() {
    let store = Arc::new(MemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let pipeline = pipeline("five_rows.json", &store, &notifier);

    pipeline.fetch_and_ingest_for(day()).await;
    let first = store.select_partition(day()).await.unwrap();
    pipeline.fetch_and_ingest_for(day()).await;
    let second = store.select_partition(day()).await.unwrap();

    assert_eq!(first.len(), 5);
    assert_eq!(first, second);
    assert_eq!(store.all_records().await.len(), 5);
}

#[tokio::test]
async fn new_result_replaces_partition_and_leaves_other_dates() {
    let store = Arc::new(MemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let yesterday = NaiveDate::from_ymd_opt(2025, 3, 13).unwrap();

    pipeline("five_rows.json", &store, &notifier)
        .fetch_and_ingest_for(yesterday)
        .await;
    pipeline("five_rows.json", &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;
    pipeline("three_rows.json", &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;

    let today: Vec<_> = store
        .select_partition(day())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.code)
        .collect();
    assert_eq!(today, vec![600519, 858]);
    assert_eq!(store.select_partition(yesterday).await.unwrap().len(), 5);
}

#[tokio::test]
async fn insert_failure_reports_an_error() {
    let store = Arc::new(MemorySnapshotStore::new().with_failing_insert("duplicate key value"));
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline("three_rows.json", &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.count, 0);
    assert_eq!(outcome.state, RunState::ErrorNotified);
    assert!(outcome.error.as_deref().unwrap_or_default().contains("duplicate key value"));

    let messages = notifier.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("**股票数据获取失败**"));
    assert!(messages[0].contains("duplicate key value"));
}

#[tokio::test]
async fn unreachable_source_reports_an_error() {
    let store = Arc::new(MemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline("does_not_exist.json", &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.state, RunState::ErrorNotified);
    assert_eq!(store.delete_calls(), 0);

    let messages = notifier.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("**错误信息**:"));
}

#[tokio::test]
async fn archive_keeps_raw_response_and_partition_export() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline("five_rows.json", &store, &notifier)
        .with_archive(SnapshotArchive::new(dir.path()), dir.path().join("reports"))
        .fetch_and_ingest_for(day())
        .await;
    assert_eq!(outcome.count, 5);

    let raw = std::fs::read(fixture("five_rows.json")).unwrap();
    let archived = dir
        .path()
        .join(SnapshotArchive::relative_path_for(day(), &SnapshotArchive::sha256_hex(&raw)));
    assert!(archived.exists());
    assert!(dir.path().join("reports/2025-03-14/stocks.parquet").exists());
    assert!(dir.path().join("reports/2025-03-14/manifest.json").exists());
}

async fn assert_unusable_response_keeps_partition(fixture_name: &str) {
    let store = Arc::new(MemorySnapshotStore::new());
    store.seed([CanonicalRecord::new(600036, "招商银行", day())]).await;
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline(fixture_name, &store, &notifier)
        .fetch_and_ingest_for(day())
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.state, RunState::ErrorNotified);
    assert_eq!(outcome.count, 0);
    assert_eq!(store.delete_calls(), 0);
    assert_eq!(store.insert_calls(), 0);
    assert_eq!(store.select_partition(day()).await.unwrap().len(), 1);

    let messages = notifier.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("**股票数据获取失败**"));
    assert!(!messages[0].contains("数据已更新到数据库"));
}

#[tokio::test]
async fn response_envelope_without_a_table_aborts_the_run() {
    assert_unusable_response_keeps_partition("envelope.json").await;
}

#[tokio::test]
async fn table_without_identifier_column_aborts_the_run() {
    assert_unusable_response_keeps_partition("no_identifier.json").await;
}

#[tokio::test]
async fn collapsed_duplicates_are_not_counted_as_skipped() {
    let store = Arc::new(MemorySnapshotStore::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let outcome = pipeline("duplicate_codes.json", &store, &notifier)
        .with_dedup(dedup_hook_for(DuplicatePolicy::FirstWins))
        .fetch_and_ingest_for(day())
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.fetched_rows, 4);
    assert_eq!(outcome.skipped_rows, 1);
    assert_eq!(outcome.collapsed_rows, 1);
    assert_eq!(outcome.count, 2);

    let rows = store.select_partition(day()).await.unwrap();
    assert_eq!(rows.iter().map(|r| r.code).collect::<Vec<_>>(), vec![600519, 858]);
    assert_eq!(rows[0].latest_price, Some(1532.1));
}
