//! Snapshot replacement: the single write entry point of an ingestion cycle.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gpucat_core::{
    extract_price, iso_millis, normalize_gpu_model, row_id, stable_key_for_row, Clock,
    GpuPriceSample, IdentityError, PriceRow, PricingRecord, ProviderResult, ReplaceOutcome,
    SystemClock, HISTORY_RETENTION_DAYS,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    dedup_preserving_order, HistoryReader, PriceHistoryStore, PricingStore, StoreError,
    DEFAULT_CHUNK_SIZE,
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("snapshot replace failed, previous snapshot kept: {0}")]
    Snapshot(#[source] StoreError),
}

/// Records and history samples derived from one cycle's provider results.
#[derive(Debug, Clone, Default)]
pub struct StagedCycle {
    pub records: Vec<PricingRecord>,
    pub samples: Vec<GpuPriceSample>,
    pub skipped_rows: usize,
}

impl StagedCycle {
    pub fn touched_stable_keys(&self) -> Vec<String> {
        dedup_preserving_order(self.samples.iter().map(|s| s.stable_key.clone()))
    }
}

/// Normalize, key, hash and price every row. Rows that fail identity
/// derivation are skipped with a warning; byte-identical rows are staged once.
/// When several rows share a stable key, the first one supplies the sample.
pub fn stage_cycle(results: &[ProviderResult], now: DateTime<Utc>) -> StagedCycle {
    let mut staged = StagedCycle::default();
    let mut seen_ids = HashSet::new();
    let mut seen_samples = HashSet::new();

    for result in results {
        if result.rows.is_empty() {
            debug!(provider = %result.provider, "provider returned no rows");
            continue;
        }

        let observed_at = result.observed_at.normalize(now);
        let observed_iso = iso_millis(observed_at);

        for (index, raw) in result.rows.iter().enumerate() {
            let (record, sample) = match stage_row(result, observed_at, &observed_iso, raw) {
                Ok(staged_row) => staged_row,
                Err(err) => {
                    warn!(provider = %result.provider, row = index, error = %err, "skipping row");
                    staged.skipped_rows += 1;
                    continue;
                }
            };

            if !seen_ids.insert(record.id.clone()) {
                debug!(provider = %result.provider, id = %record.id, "identical row already staged");
                continue;
            }
            if let Some(sample) = sample {
                if seen_samples.insert((sample.stable_key.clone(), sample.observed_at)) {
                    staged.samples.push(sample);
                }
            }
            staged.records.push(record);
        }
    }

    staged
}

fn stage_row(
    result: &ProviderResult,
    observed_at: DateTime<Utc>,
    observed_iso: &str,
    raw: &PriceRow,
) -> Result<(PricingRecord, Option<GpuPriceSample>), IdentityError> {
    let mut data = raw.clone();
    if let Some(model) = raw.gpu_model() {
        let normalized = normalize_gpu_model(model);
        if !normalized.is_empty() {
            data.insert("gpu_model", normalized);
        }
    }

    let stable_key = stable_key_for_row(&result.provider, &data);
    let id = row_id(&result.provider, observed_iso, &data)?;
    let price_usd = extract_price(&data);

    let sample = price_usd.map(|price_usd| GpuPriceSample {
        stable_key: stable_key.clone(),
        provider: result.provider.clone(),
        observed_at,
        price_usd,
    });

    let record = PricingRecord {
        id,
        provider: result.provider.clone(),
        observed_at,
        version: result.version.max(1),
        source_hash: result.source_hash.clone(),
        gpu_count: data.gpu_count(),
        vram_gb: data.vram_gb(),
        data,
        stable_key,
        price_usd,
    };
    Ok((record, sample))
}

/// Replaces the pricing snapshot and feeds the price history.
///
/// Ordering per call: snapshot commit, then history append, then prune. The
/// snapshot and the history are not in one transaction; a history failure is
/// reported in [`ReplaceOutcome::history_error`] and never undoes the commit.
#[derive(Clone)]
pub struct SnapshotReplacer {
    pricing: Arc<dyn PricingStore>,
    history: Arc<dyn PriceHistoryStore>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
    retention: Duration,
}

impl SnapshotReplacer {
    pub fn new(pricing: Arc<dyn PricingStore>, history: Arc<dyn PriceHistoryStore>) -> Self {
        Self {
            pricing,
            history,
            clock: Arc::new(SystemClock),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retention: Duration::days(HISTORY_RETENTION_DAYS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention = Duration::days(days.max(1));
        self
    }

    pub fn pricing(&self) -> &Arc<dyn PricingStore> {
        &self.pricing
    }

    pub fn history(&self) -> &Arc<dyn PriceHistoryStore> {
        &self.history
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// History reads windowed with the same clock and retention as pruning.
    pub fn history_reader(&self) -> HistoryReader {
        HistoryReader::new(self.history.clone())
            .with_clock(self.clock.clone())
            .with_window(self.retention)
    }

    pub async fn replace_all(&self, results: &[ProviderResult]) -> Result<ReplaceOutcome, IngestError> {
        let now = self.clock.now();
        let staged = stage_cycle(results, now);
        info!(
            providers = results.len(),
            staged = staged.records.len(),
            samples = staged.samples.len(),
            skipped = staged.skipped_rows,
            "replacing gpu pricing snapshot"
        );

        let stored = self
            .pricing
            .replace_snapshot(&staged.records, self.chunk_size)
            .await
            .map_err(|err| {
                error!(error = %err, "snapshot replace failed; previous snapshot kept");
                IngestError::Snapshot(err)
            })?;

        let mut outcome = ReplaceOutcome {
            stored: stored as usize,
            touched_stable_keys: staged.touched_stable_keys(),
            skipped_rows: staged.skipped_rows,
            pruned_samples: 0,
            history_error: None,
        };

        let mut history_errors = Vec::new();
        match self.history.append_samples(&staged.samples).await {
            Ok(keys) => debug!(touched = keys.len(), "price samples appended"),
            Err(err) => {
                error!(error = %err, "price history append failed; snapshot already committed");
                history_errors.push(format!("append failed: {err}"));
            }
        }

        match self.history.prune_older_than(now - self.retention).await {
            Ok(pruned) => outcome.pruned_samples = pruned,
            Err(err) => {
                error!(error = %err, "price history prune failed");
                history_errors.push(format!("prune failed: {err}"));
            }
        }

        if !history_errors.is_empty() {
            outcome.history_error = Some(history_errors.join("; "));
        }

        info!(
            stored = outcome.stored,
            touched = outcome.touched_stable_keys.len(),
            pruned = outcome.pruned_samples,
            "gpu pricing snapshot replaced"
        );
        Ok(outcome)
    }
}
