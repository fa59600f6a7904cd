//! Postgres backend for the `gpu_pricing` and `gpu_price_samples` tables.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpucat_core::{iso_millis, CacheStats, GpuPriceSample, PricePoint, PriceRow, PricingRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::{dedup_preserving_order, PriceHistoryStore, PricingStore, StoreError, DEFAULT_CHUNK_SIZE};

/// Column list for `gpu_pricing` SELECT queries.
const COLUMNS: &str = "\
    id, provider, observed_at, version, source_hash, data, stable_key, \
    price_usd, gpu_count, vram_gb";

/// Column list for `gpu_pricing` INSERT statements (excludes `created_at`).
const INSERT_PREFIX: &str = "\
    INSERT INTO gpu_pricing \
    (id, provider, observed_at, version, source_hash, data, stable_key, price_usd, gpu_count, vram_gb) ";

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = u16::MAX as usize;
const PRICING_BIND_COLUMNS: usize = 10;
const SAMPLE_BIND_COLUMNS: usize = 5;

/// Rows per multi-row INSERT: `requested` (0 means the default), capped so
/// one statement stays within the bind parameter limit.
fn insert_chunk_size(requested: usize, bind_columns: usize) -> usize {
    let requested = if requested == 0 { DEFAULT_CHUNK_SIZE } else { requested };
    requested.min(MAX_BIND_PARAMS / bind_columns)
}

#[derive(Debug, sqlx::FromRow)]
struct PricingRow {
    id: String,
    provider: String,
    observed_at: DateTime<Utc>,
    version: i32,
    source_hash: Option<String>,
    data: Json<PriceRow>,
    stable_key: String,
    price_usd: Option<f64>,
    gpu_count: Option<f64>,
    vram_gb: Option<f64>,
}

impl From<PricingRow> for PricingRecord {
    fn from(row: PricingRow) -> Self {
        Self {
            id: row.id,
            provider: row.provider,
            observed_at: row.observed_at,
            version: row.version,
            source_hash: row.source_hash,
            data: row.data.0,
            stable_key: row.stable_key,
            price_usd: row.price_usd,
            gpu_count: row.gpu_count,
            vram_gb: row.vram_gb,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a connection pool from a database URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("gpu pricing migrations applied");
        Ok(())
    }

    async fn fetch_records(&self, query: &str) -> Result<Vec<PricingRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PricingRow>(query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PricingRecord::from).collect())
    }
}

#[async_trait]
impl PricingStore for PgStore {
    async fn replace_snapshot(
        &self,
        records: &[PricingRecord],
        chunk_size: usize,
    ) -> Result<u64, StoreError> {
        let chunk_size = insert_chunk_size(chunk_size, PRICING_BIND_COLUMNS);
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM gpu_pricing")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut stored = 0u64;
        for chunk in records.chunks(chunk_size) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(INSERT_PREFIX);
            qb.push_values(chunk, |mut b, record| {
                b.push_bind(record.id.clone())
                    .push_bind(record.provider.clone())
                    .push_bind(record.observed_at)
                    .push_bind(record.version)
                    .push_bind(record.source_hash.clone())
                    .push_bind(Json(record.data.clone()))
                    .push_bind(record.stable_key.clone())
                    .push_bind(record.price_usd)
                    .push_bind(record.gpu_count)
                    .push_bind(record.vram_gb);
            });
            stored += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        // Dropping `tx` on any `?` above rolls back, keeping the previous snapshot.
        tx.commit().await?;
        debug!(deleted, stored, "gpu_pricing snapshot replaced");
        Ok(stored)
    }

    async fn all_records(&self) -> Result<Vec<PricingRecord>, StoreError> {
        self.fetch_records(&format!(
            "SELECT {COLUMNS} FROM gpu_pricing ORDER BY provider, id"
        ))
        .await
    }

    async fn records_by_provider(&self, provider: &str) -> Result<Vec<PricingRecord>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM gpu_pricing WHERE provider = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, PricingRow>(&query)
            .bind(provider)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PricingRecord::from).collect())
    }

    async fn records_by_stable_keys(
        &self,
        stable_keys: &[String],
    ) -> Result<Vec<PricingRecord>, StoreError> {
        let keys = dedup_preserving_order(stable_keys.iter().cloned());
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {COLUMNS} FROM gpu_pricing WHERE stable_key = ANY($1) ORDER BY provider, id"
        );
        let rows = sqlx::query_as::<_, PricingRow>(&query)
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PricingRecord::from).collect())
    }

    async fn find_instance(
        &self,
        provider: &str,
        instance_id: &str,
    ) -> Result<Option<PriceRow>, StoreError> {
        let row = sqlx::query_scalar::<_, Json<PriceRow>>(
            "SELECT data FROM gpu_pricing \
             WHERE provider = $1 AND data->>'instance_id' = $2 \
             LIMIT 1",
        )
        .bind(provider)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|json| json.0))
    }

    async fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        let total_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM gpu_pricing")
            .fetch_one(&self.pool)
            .await?;
        let providers = sqlx::query_scalar::<_, String>(
            "SELECT provider FROM gpu_pricing GROUP BY provider ORDER BY provider",
        )
        .fetch_all(&self.pool)
        .await?;
        let last_scraped_at =
            sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT MAX(observed_at) FROM gpu_pricing")
                .fetch_one(&self.pool)
                .await?;

        Ok(CacheStats {
            total_rows: total_rows.max(0) as u64,
            providers,
            last_scraped_at: last_scraped_at.map(iso_millis),
        })
    }

    async fn clear_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM gpu_pricing")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PriceHistoryStore for PgStore {
    async fn append_samples(&self, samples: &[GpuPriceSample]) -> Result<Vec<String>, StoreError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        // A single upsert statement may not touch the same key twice.
        let mut latest: HashMap<(&str, DateTime<Utc>), &GpuPriceSample> = HashMap::new();
        for sample in samples {
            latest.insert((sample.stable_key.as_str(), sample.observed_at), sample);
        }
        let unique: Vec<&GpuPriceSample> = latest.into_values().collect();

        let scraped_at = Utc::now();
        for chunk in unique.chunks(insert_chunk_size(DEFAULT_CHUNK_SIZE, SAMPLE_BIND_COLUMNS)) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO gpu_price_samples \
                 (stable_key, provider, observed_at, price_usd, scraped_at) ",
            );
            qb.push_values(chunk, |mut b, sample| {
                b.push_bind(sample.stable_key.clone())
                    .push_bind(sample.provider.clone())
                    .push_bind(sample.observed_at)
                    .push_bind(sample.price_usd)
                    .push_bind(scraped_at);
            });
            qb.push(
                " ON CONFLICT (stable_key, observed_at) DO UPDATE \
                 SET price_usd = EXCLUDED.price_usd, scraped_at = EXCLUDED.scraped_at",
            );
            qb.build().execute(&self.pool).await?;
        }

        Ok(dedup_preserving_order(
            samples.iter().map(|s| s.stable_key.clone()),
        ))
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM gpu_price_samples WHERE observed_at <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn series(
        &self,
        stable_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, StoreError> {
        if stable_key.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, (DateTime<Utc>, f64)>(
            "SELECT observed_at, price_usd FROM gpu_price_samples \
             WHERE stable_key = $1 AND observed_at >= $2 \
             ORDER BY observed_at ASC",
        )
        .bind(stable_key)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(observed_at, price_usd)| PricePoint {
                observed_at: iso_millis(observed_at),
                price_usd,
            })
            .collect())
    }
}
