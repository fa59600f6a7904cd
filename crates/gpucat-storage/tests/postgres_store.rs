//! Postgres-backed store tests. They need a reachable `DATABASE_URL`:
//! `cargo test -p gpucat-storage -- --ignored`.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use gpucat_core::{FixedClock, PriceRow, ProviderResult};
use gpucat_storage::{
    IngestError, PgStore, PriceHistoryStore, PricingStore, SnapshotReplacer,
};
use sqlx::PgPool;

fn provider(name: &str, observed_at: &str, count: usize) -> ProviderResult {
    let rows = (0..count)
        .map(|i| {
            PriceRow::new()
                .with("gpu_model", "H100")
                .with("sku", format!("{name}-{i}"))
                .with("instance_id", format!("{name}-instance-{i}"))
                .with("gpu_count", 8)
                .with("price_hour_usd", 20.0 + i as f64)
        })
        .collect();
    ProviderResult::new(name, observed_at).with_rows(rows)
}

fn replacer(store: &Arc<PgStore>) -> SnapshotReplacer {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    SnapshotReplacer::new(store.clone(), store.clone())
        .with_clock(Arc::new(FixedClock::new(now)))
        .with_chunk_size(7)
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn replace_is_transactional_across_chunks(pool: PgPool) {
    let store = Arc::new(PgStore::new(pool));
    let replacer = replacer(&store);

    let outcome = replacer
        .replace_all(&[provider("coreweave", "2024-01-01T00:00:00Z", 20)])
        .await
        .unwrap();
    assert_eq!(outcome.stored, 20);

    let before = store.all_records().await.unwrap();

    // Same id twice in different chunks violates the primary key on the last insert.
    let mut records = before.clone();
    records.extend(before.iter().take(1).cloned());
    let err = store.replace_snapshot(&records, 7).await.unwrap_err();
    assert!(err.to_string().contains("database error"), "{err}");

    assert_eq!(store.all_records().await.unwrap(), before);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn read_accessors_reflect_latest_snapshot(pool: PgPool) {
    let store = Arc::new(PgStore::new(pool));
    let replacer = replacer(&store);

    replacer
        .replace_all(&[
            provider("lambda", "2024-01-01T00:00:00Z", 2),
            provider("runpod", "2024-01-01T01:00:00Z", 3),
        ])
        .await
        .unwrap();

    let stats = store.cache_stats().await.unwrap();
    assert_eq!(stats.total_rows, 5);
    assert_eq!(stats.providers, vec!["lambda", "runpod"]);
    assert_eq!(stats.last_scraped_at.as_deref(), Some("2024-01-01T01:00:00.000Z"));

    let found = store.find_instance("runpod", "runpod-instance-2").await.unwrap();
    assert_eq!(found.and_then(|row| row.sku().map(String::from)), Some("runpod-2".into()));

    let favorites = store
        .records_by_stable_keys(&["lambda:lambda-1:h100:8x".to_string()])
        .await
        .unwrap();
    assert_eq!(favorites.len(), 1);

    assert_eq!(store.clear_all().await.unwrap(), 5);
    assert_eq!(store.cache_stats().await.unwrap().total_rows, 0);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn history_upserts_and_prunes(pool: PgPool) {
    let store = Arc::new(PgStore::new(pool));
    let replacer = replacer(&store);
    let input = provider("nebius", "2024-01-01T00:00:00Z", 1);

    replacer.replace_all(&[input.clone()]).await.unwrap();
    replacer.replace_all(&[input]).await.unwrap();

    let series = replacer
        .history_reader()
        .get_series("nebius:nebius-0:h100:8x")
        .await
        .unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].observed_at, "2024-01-01T00:00:00.000Z");

    let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(store.prune_older_than(cutoff).await.unwrap(), 1);
    assert!(store
        .series("nebius:nebius-0:h100:8x", cutoff - Duration::days(1))
        .await
        .unwrap()
        .is_empty());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn snapshot_error_maps_to_ingest_error(pool: PgPool) {
    let store = Arc::new(PgStore::new(pool.clone()));
    sqlx::query("DROP TABLE gpu_pricing").execute(&pool).await.unwrap();

    let err = replacer(&store)
        .replace_all(&[provider("oracle", "2024-01-01T00:00:00Z", 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Snapshot(_)));
}
