//! In-memory backend. The snapshot table is swapped under a write lock so
//! readers see either the previous or the new snapshot, never a mix.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpucat_core::{iso_millis, CacheStats, GpuPriceSample, PricePoint, PriceRow, PricingRecord};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::{dedup_preserving_order, PriceHistoryStore, PricingStore, StoreError};

/// Forces a chunk insert to fail, for exercising rollback paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFault {
    Chunk(usize),
    LastChunk,
}

#[derive(Debug, Clone)]
struct StoredSample {
    provider: String,
    price_usd: f64,
    scraped_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    pricing: RwLock<Vec<PricingRecord>>,
    samples: RwLock<BTreeMap<(String, DateTime<Utc>), StoredSample>>,
    insert_fault: Mutex<Option<InsertFault>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_insert_fault(&self, fault: Option<InsertFault>) {
        *self.insert_fault.lock().await = fault;
    }

    pub async fn record_count(&self) -> usize {
        self.pricing.read().await.len()
    }

    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }

    /// When the sample at `(stable_key, observed_at)` was last written.
    pub async fn sample_scraped_at(
        &self,
        stable_key: &str,
        observed_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.samples
            .read()
            .await
            .get(&(stable_key.to_string(), observed_at))
            .map(|sample| sample.scraped_at)
    }

    /// Providers that own at least one sample for `stable_key`.
    pub async fn sample_providers(&self, stable_key: &str) -> BTreeSet<String> {
        self.samples
            .read()
            .await
            .iter()
            .filter(|((key, _), _)| key == stable_key)
            .map(|(_, sample)| sample.provider.clone())
            .collect()
    }
}

#[async_trait]
impl PricingStore for InMemoryStore {
    async fn replace_snapshot(
        &self,
        records: &[PricingRecord],
        chunk_size: usize,
    ) -> Result<u64, StoreError> {
        let fault = *self.insert_fault.lock().await;
        let mut table = self.pricing.write().await;

        let chunk_size = chunk_size.max(1);
        let chunk_count = records.len().div_ceil(chunk_size);
        let mut next = Vec::with_capacity(records.len());
        let mut ids = HashSet::with_capacity(records.len());

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            let injected = match fault {
                Some(InsertFault::Chunk(target)) => target == index,
                Some(InsertFault::LastChunk) => index + 1 == chunk_count,
                None => false,
            };
            if injected {
                warn!(chunk = index, "injected insert failure; snapshot left untouched");
                return Err(StoreError::Constraint(format!(
                    "injected insert failure on chunk {index}"
                )));
            }
            for record in chunk {
                if !ids.insert(record.id.as_str()) {
                    return Err(StoreError::Constraint(format!(
                        "duplicate key value violates gpu_pricing primary key: {}",
                        record.id
                    )));
                }
                next.push(record.clone());
            }
        }

        let stored = next.len() as u64;
        *table = next;
        Ok(stored)
    }

    async fn all_records(&self) -> Result<Vec<PricingRecord>, StoreError> {
        let mut records = self.pricing.read().await.clone();
        records.sort_by(|a, b| a.provider.cmp(&b.provider).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn records_by_provider(&self, provider: &str) -> Result<Vec<PricingRecord>, StoreError> {
        let mut records: Vec<_> = self
            .pricing
            .read()
            .await
            .iter()
            .filter(|r| r.provider == provider)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn records_by_stable_keys(
        &self,
        stable_keys: &[String],
    ) -> Result<Vec<PricingRecord>, StoreError> {
        if stable_keys.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = stable_keys.iter().map(String::as_str).collect();
        Ok(self
            .pricing
            .read()
            .await
            .iter()
            .filter(|r| wanted.contains(r.stable_key.as_str()))
            .cloned()
            .collect())
    }

    async fn find_instance(
        &self,
        provider: &str,
        instance_id: &str,
    ) -> Result<Option<PriceRow>, StoreError> {
        Ok(self
            .pricing
            .read()
            .await
            .iter()
            .find(|r| r.provider == provider && r.data.instance_id() == Some(instance_id))
            .map(|r| r.data.clone()))
    }

    async fn cache_stats(&self) -> Result<CacheStats, StoreError> {
        let table = self.pricing.read().await;
        let providers: BTreeSet<String> = table.iter().map(|r| r.provider.clone()).collect();
        Ok(CacheStats {
            total_rows: table.len() as u64,
            providers: providers.into_iter().collect(),
            last_scraped_at: table.iter().map(|r| r.observed_at).max().map(iso_millis),
        })
    }

    async fn clear_all(&self) -> Result<u64, StoreError> {
        let mut table = self.pricing.write().await;
        let deleted = table.len() as u64;
        table.clear();
        Ok(deleted)
    }
}

#[async_trait]
impl PriceHistoryStore for InMemoryStore {
    async fn append_samples(&self, samples: &[GpuPriceSample]) -> Result<Vec<String>, StoreError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let scraped_at = Utc::now();
        let mut table = self.samples.write().await;
        for sample in samples {
            table.insert(
                (sample.stable_key.clone(), sample.observed_at),
                StoredSample {
                    provider: sample.provider.clone(),
                    price_usd: sample.price_usd,
                    scraped_at,
                },
            );
        }
        Ok(dedup_preserving_order(
            samples.iter().map(|s| s.stable_key.clone()),
        ))
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut table = self.samples.write().await;
        let before = table.len();
        table.retain(|(_, observed_at), _| *observed_at > cutoff);
        Ok((before - table.len()) as u64)
    }

    async fn series(
        &self,
        stable_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, StoreError> {
        if stable_key.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.samples.read().await;
        Ok(table
            .range((stable_key.to_string(), since)..)
            .take_while(|((key, _), _)| key == stable_key)
            .map(|((_, observed_at), sample)| PricePoint {
                observed_at: iso_millis(*observed_at),
                price_usd: sample.price_usd,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use gpucat_core::stable_key_for_row;

    fn record(id: &str, provider: &str) -> PricingRecord {
        let data = PriceRow::new()
            .with("gpu_model", "H100")
            .with("instance_id", format!("{provider}-{id}"));
        PricingRecord {
            id: id.to_string(),
            provider: provider.to_string(),
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            version: 1,
            source_hash: None,
            stable_key: stable_key_for_row(provider, &data),
            data,
            price_usd: Some(1.0),
            gpu_count: None,
            vram_gb: None,
        }
    }

    #[tokio::test]
    async fn duplicate_key_in_last_chunk_rolls_back() {
        let store = InMemoryStore::new();
        let previous = vec![record("a", "lambda"), record("b", "lambda")];
        store.replace_snapshot(&previous, 100).await.unwrap();

        let mut next: Vec<_> = (0..5).map(|i| record(&format!("n{i}"), "runpod")).collect();
        next.push(record("n0", "runpod"));
        let err = store.replace_snapshot(&next, 2).await.unwrap_err();

        assert!(matches!(err, StoreError::Constraint(_)));
        assert_eq!(store.record_count().await, 2);
        assert_eq!(store.all_records().await.unwrap(), previous);
    }

    #[tokio::test]
    async fn injected_fault_targets_the_requested_chunk() {
        let store = InMemoryStore::new();
        store.replace_snapshot(&[record("keep", "oracle")], 10).await.unwrap();
        store.set_insert_fault(Some(InsertFault::Chunk(0))).await;

        let err = store
            .replace_snapshot(&[record("x", "oracle")], 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chunk 0"));
        assert_eq!(store.record_count().await, 1);

        store.set_insert_fault(None).await;
        assert_eq!(store.replace_snapshot(&[], 10).await.unwrap(), 0);
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn read_accessors_filter_and_order() {
        let store = InMemoryStore::new();
        let records = vec![record("z", "runpod"), record("b", "lambda"), record("a", "lambda")];
        store.replace_snapshot(&records, 100).await.unwrap();

        let all: Vec<_> = store
            .all_records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(all, vec!["a", "b", "z"]);

        let lambda = store.records_by_provider("lambda").await.unwrap();
        assert_eq!(lambda.len(), 2);

        let found = store.find_instance("runpod", "runpod-z").await.unwrap();
        assert_eq!(found.and_then(|r| r.instance_id().map(String::from)), Some("runpod-z".into()));
        assert!(store.find_instance("lambda", "runpod-z").await.unwrap().is_none());

        let by_key = store
            .records_by_stable_keys(&["lambda:h100".to_string()])
            .await
            .unwrap();
        assert_eq!(by_key.len(), 2);

        let stats = store.cache_stats().await.unwrap();
        assert_eq!(stats.total_rows, 3);
        assert_eq!(stats.providers, vec!["lambda", "runpod"]);
        assert_eq!(stats.last_scraped_at.as_deref(), Some("2024-01-01T00:00:00.000Z"));

        assert_eq!(store.clear_all().await.unwrap(), 3);
        assert_eq!(store.cache_stats().await.unwrap(), CacheStats::default());
    }

    #[tokio::test]
    async fn history_upserts_prunes_and_windows() {
        let store = InMemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let sample = |days_ago: i64, price: f64| GpuPriceSample {
            stable_key: "lambda:h100".into(),
            provider: "lambda".into(),
            observed_at: now - Duration::days(days_ago),
            price_usd: price,
        };

        let touched = store
            .append_samples(&[sample(40, 1.0), sample(10, 2.0), sample(1, 3.0)])
            .await
            .unwrap();
        assert_eq!(touched, vec!["lambda:h100"]);

        let first_write = store
            .sample_scraped_at("lambda:h100", now - Duration::days(1))
            .await
            .unwrap();
        store.append_samples(&[sample(1, 3.5)]).await.unwrap();
        assert_eq!(store.sample_count().await, 3);
        let rewrite = store
            .sample_scraped_at("lambda:h100", now - Duration::days(1))
            .await
            .unwrap();
        assert!(rewrite >= first_write);
        assert!(store.sample_scraped_at("lambda:h100", now).await.is_none());

        let pruned = store.prune_older_than(now - Duration::days(30)).await.unwrap();
        assert_eq!(pruned, 1);

        let series = store
            .series("lambda:h100", now - Duration::days(5))
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].price_usd, 3.5);
        assert!(store.series("", now).await.unwrap().is_empty());
        assert!(store.series("lambda", now - Duration::days(60)).await.unwrap().is_empty());
    }
}
