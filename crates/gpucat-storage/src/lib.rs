//! Snapshot + price-history persistence for the GPU pricing catalog.
//!
//! Two backends implement the same store traits: Postgres via sqlx for
//! deployments and an in-memory store for local runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpucat_core::{CacheStats, GpuPriceSample, PricePoint, PriceRow, PricingRecord};
use thiserror::Error;

pub mod catalog;
pub mod history;
pub mod memory;
pub mod postgres;
pub mod replace;

pub use catalog::{
    catalog_facets, filter_catalog, index_by_stable_key, provider_snapshots, snapshot_for_provider,
    CatalogFacets, CatalogPage, CatalogQuery, Facet, FacetRow, SortDirection, SortField,
};
pub use history::HistoryReader;
pub use memory::{InMemoryStore, InsertFault};
pub use postgres::PgStore;
pub use replace::{stage_cycle, IngestError, SnapshotReplacer, StagedCycle};

pub const CRATE_NAME: &str = "gpucat-storage";

/// Rows per INSERT statement inside the replace transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Current pricing snapshot.
#[async_trait]
pub trait PricingStore: Send + Sync {
    /// Delete every existing record and insert `records` in chunks of
    /// `chunk_size`, all inside one transaction. On error nothing changes.
    async fn replace_snapshot(
        &self,
        records: &[PricingRecord],
        chunk_size: usize,
    ) -> Result<u64, StoreError>;

    /// All records ordered by provider, then id.
    async fn all_records(&self) -> Result<Vec<PricingRecord>, StoreError>;

    /// One provider's records ordered by id.
    async fn records_by_provider(&self, provider: &str) -> Result<Vec<PricingRecord>, StoreError>;

    /// Records whose stable key is in `stable_keys` (favorites lookup).
    async fn records_by_stable_keys(
        &self,
        stable_keys: &[String],
    ) -> Result<Vec<PricingRecord>, StoreError>;

    /// Payload of the first record of `provider` whose `instance_id` matches.
    async fn find_instance(
        &self,
        provider: &str,
        instance_id: &str,
    ) -> Result<Option<PriceRow>, StoreError>;

    async fn cache_stats(&self) -> Result<CacheStats, StoreError>;

    /// Maintenance/testing only. Returns the number of deleted records.
    async fn clear_all(&self) -> Result<u64, StoreError>;
}

/// Price time series keyed by `(stable_key, observed_at)`.
#[async_trait]
pub trait PriceHistoryStore: Send + Sync {
    /// Upsert samples; resending a cycle overwrites instead of duplicating.
    /// Returns the distinct stable keys written.
    async fn append_samples(&self, samples: &[GpuPriceSample]) -> Result<Vec<String>, StoreError>;

    /// Delete samples observed at or before `cutoff`.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Points for `stable_key` observed at or after `since`, oldest first.
    async fn series(
        &self,
        stable_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, StoreError>;
}

/// Distinct values in first-seen order.
pub(crate) fn dedup_preserving_order<I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}
