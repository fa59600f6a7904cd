//! Cache invalidation fan-out after a committed snapshot.

use anyhow::Result;
use async_trait::async_trait;
use gpucat_core::{invalidation_tags, InvalidationTag, ReplaceOutcome};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, tag: &InvalidationTag) -> Result<()>;
}

/// Default invalidator for deployments without an external cache: logs each tag.
#[derive(Debug, Default)]
pub struct LoggingInvalidator;

#[async_trait]
impl CacheInvalidator for LoggingInvalidator {
    async fn invalidate(&self, tag: &InvalidationTag) -> Result<()> {
        info!(tag = %tag, "cache tag invalidated");
        Ok(())
    }
}

/// Collects tags in emission order.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    tags: Mutex<Vec<InvalidationTag>>,
}

impl RecordingInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tags(&self) -> Vec<InvalidationTag> {
        self.tags.lock().await.clone()
    }
}

#[async_trait]
impl CacheInvalidator for RecordingInvalidator {
    async fn invalidate(&self, tag: &InvalidationTag) -> Result<()> {
        self.tags.lock().await.push(tag.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvalidationReport {
    pub invalidated: Vec<String>,
    pub failed: Vec<String>,
}

/// Invalidate every tag for `outcome`. Failures are logged and reported,
/// never propagated: the snapshot is already committed.
pub async fn fan_out(invalidator: &dyn CacheInvalidator, outcome: &ReplaceOutcome) -> InvalidationReport {
    let mut report = InvalidationReport::default();
    for tag in invalidation_tags(outcome) {
        match invalidator.invalidate(&tag).await {
            Ok(()) => report.invalidated.push(tag.as_tag()),
            Err(err) => {
                warn!(tag = %tag, error = %err, "cache invalidation failed");
                report.failed.push(tag.as_tag());
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct FlakyInvalidator;

    #[async_trait]
    impl CacheInvalidator for FlakyInvalidator {
        async fn invalidate(&self, tag: &InvalidationTag) -> Result<()> {
            if matches!(tag, InvalidationTag::Favorites) {
                bail!("favorites cache offline");
            }
            Ok(())
        }
    }

    fn outcome(keys: &[&str]) -> ReplaceOutcome {
        ReplaceOutcome {
            touched_stable_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn recording_invalidator_keeps_emission_order() {
        let recorder = RecordingInvalidator::new();
        let report = fan_out(&recorder, &outcome(&["lambda:h100", "runpod:a100"])).await;
        assert_eq!(
            report.invalidated,
            vec![
                "pricing",
                "favorites",
                "gpu-price-history:lambda:h100",
                "gpu-price-history:runpod:a100"
            ]
        );
        assert_eq!(recorder.tags().await.len(), 4);
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() {
        let report = fan_out(&FlakyInvalidator, &outcome(&[])).await;
        assert_eq!(report.invalidated, vec!["pricing"]);
        assert_eq!(report.failed, vec!["favorites"]);
    }
}
