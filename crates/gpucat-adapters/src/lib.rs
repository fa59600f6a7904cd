//! Provider source contracts + fixture-backed sources.
//!
//! A source hands over one [`ProviderResult`] per cycle. Scraping itself lives
//! outside this workspace; sources here read what the scrapers produced.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpucat_core::ProviderResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gpucat-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error("bundle provider={found} does not match source provider={expected}")]
    ProviderMismatch { expected: String, found: String },
    #[error("all provider sources failed: {0}")]
    AllFailed(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait ProviderSource: Send + Sync {
    fn provider(&self) -> &str;

    async fn collect(&self) -> Result<ProviderResult, SourceError>;
}

/// `<root>/fixtures/<provider>/sample/bundle.json`
pub fn fixture_bundle_path(workspace_root: impl AsRef<Path>, provider: &str) -> PathBuf {
    workspace_root
        .as_ref()
        .join("fixtures")
        .join(provider)
        .join("sample")
        .join("bundle.json")
}

/// Reads one provider's scrape output from a JSON bundle on disk.
#[derive(Debug, Clone)]
pub struct JsonBundleSource {
    provider: String,
    path: PathBuf,
}

impl JsonBundleSource {
    pub fn new(provider: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            provider: provider.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProviderSource for JsonBundleSource {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn collect(&self) -> Result<ProviderResult, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut result: ProviderResult = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        if result.provider != self.provider {
            return Err(SourceError::ProviderMismatch {
                expected: self.provider.clone(),
                found: result.provider,
            });
        }
        if result.source_hash.is_none() {
            result.source_hash = Some(hex::encode(Sha256::digest(&bytes)));
        }
        Ok(result)
    }
}

/// In-process source returning a fixed result or a fixed failure.
#[derive(Debug, Clone)]
pub struct StaticSource {
    provider: String,
    outcome: Result<ProviderResult, String>,
}

impl StaticSource {
    pub fn new(result: ProviderResult) -> Self {
        Self {
            provider: result.provider.clone(),
            outcome: Ok(result),
        }
    }

    pub fn failing(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            outcome: Err(message.into()),
        }
    }
}

#[async_trait]
impl ProviderSource for StaticSource {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn collect(&self) -> Result<ProviderResult, SourceError> {
        self.outcome.clone().map_err(SourceError::Message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub provider: String,
    pub rows_scraped: usize,
    pub duration_ms: u64,
    pub success: bool,
    pub source_hash: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CollectedResults {
    pub provider_results: Vec<ProviderResult>,
    pub scraped_at: DateTime<Utc>,
    /// SHA-256 over every successful provider name and its source hash
    /// (or serialized rows when the provider supplied none).
    pub source_hash: String,
    pub summaries: Vec<ProviderSummary>,
}

/// Run every source in order. A failing source is summarized and skipped;
/// the cycle only fails when no source succeeded.
pub async fn collect_all(sources: &[Box<dyn ProviderSource>]) -> Result<CollectedResults, SourceError> {
    let scraped_at = Utc::now();
    let mut hasher = Sha256::new();
    let mut provider_results = Vec::new();
    let mut summaries = Vec::with_capacity(sources.len());

    for source in sources {
        let started = Instant::now();
        let outcome = source.collect().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                hasher.update(source.provider().as_bytes());
                match &result.source_hash {
                    Some(hash) => hasher.update(hash.as_bytes()),
                    None => hasher.update(
                        serde_json::to_vec(&result.rows)
                            .with_context(|| format!("serializing rows of {}", source.provider()))?,
                    ),
                }
                info!(provider = source.provider(), rows = result.rows.len(), duration_ms, "provider collected");
                summaries.push(ProviderSummary {
                    provider: source.provider().to_string(),
                    rows_scraped: result.rows.len(),
                    duration_ms,
                    success: true,
                    source_hash: result.source_hash.clone(),
                    error: None,
                });
                provider_results.push(result);
            }
            Err(err) => {
                warn!(provider = source.provider(), error = %err, "provider collection failed");
                summaries.push(ProviderSummary {
                    provider: source.provider().to_string(),
                    rows_scraped: 0,
                    duration_ms,
                    success: false,
                    source_hash: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    if provider_results.is_empty() {
        let failures = summaries
            .iter()
            .map(|s| format!("{}: {}", s.provider, s.error.as_deref().unwrap_or("unknown error")))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SourceError::AllFailed(failures));
    }

    Ok(CollectedResults {
        provider_results,
        scraped_at,
        source_hash: hex::encode(hasher.finalize()),
        summaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucat_core::PriceRow;

    fn result(provider: &str, hash: Option<&str>) -> ProviderResult {
        let mut result = ProviderResult::new(provider, "2024-01-01T00:00:00Z")
            .with_rows(vec![PriceRow::new().with("gpu_model", "H100")]);
        result.source_hash = hash.map(String::from);
        result
    }

    #[tokio::test]
    async fn bundle_source_reads_and_hashes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(
            &path,
            r#"{"provider":"lambda","observedAt":"2024-01-01T00:00:00Z","rows":[{"gpu_model":"A100"}]}"#,
        )
        .unwrap();

        let source = JsonBundleSource::new("lambda", &path);
        let collected = source.collect().await.unwrap();
        assert_eq!(collected.rows.len(), 1);
        assert_eq!(collected.source_hash.as_deref().map(str::len), Some(64));

        let wrong = JsonBundleSource::new("runpod", &path);
        assert!(matches!(
            wrong.collect().await.unwrap_err(),
            SourceError::ProviderMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn missing_bundle_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonBundleSource::new("oracle", fixture_bundle_path(dir.path(), "oracle"));
        let err = source.collect().await.unwrap_err();
        assert!(err.to_string().contains("bundle.json"), "{err}");
    }

    #[tokio::test]
    async fn collect_all_skips_failures_and_summarizes() {
        let sources: Vec<Box<dyn ProviderSource>> = vec![
            Box::new(StaticSource::new(result("coreweave", Some("abc")))),
            Box::new(StaticSource::failing("nebius", "timeout")),
            Box::new(StaticSource::new(result("lambda", None))),
        ];
        let collected = collect_all(&sources).await.unwrap();

        assert_eq!(collected.provider_results.len(), 2);
        assert_eq!(collected.summaries.len(), 3);
        assert!(!collected.summaries[1].success);
        assert_eq!(collected.summaries[1].error.as_deref(), Some("timeout"));
        assert_eq!(collected.summaries[0].source_hash.as_deref(), Some("abc"));
        assert_eq!(collected.source_hash.len(), 64);

        let again = collect_all(&sources).await.unwrap();
        assert_eq!(again.source_hash, collected.source_hash);
    }

    #[tokio::test]
    async fn combined_hash_tracks_source_hashes() {
        let first: Vec<Box<dyn ProviderSource>> =
            vec![Box::new(StaticSource::new(result("coreweave", Some("abc"))))];
        let second: Vec<Box<dyn ProviderSource>> =
            vec![Box::new(StaticSource::new(result("coreweave", Some("abd"))))];
        assert_ne!(
            collect_all(&first).await.unwrap().source_hash,
            collect_all(&second).await.unwrap().source_hash
        );
    }

    #[tokio::test]
    async fn collect_all_fails_when_every_source_fails() {
        let sources: Vec<Box<dyn ProviderSource>> = vec![
            Box::new(StaticSource::failing("crusoe", "http 500")),
            Box::new(StaticSource::failing("hyperstack", "bad json")),
        ];
        let err = collect_all(&sources).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("crusoe: http 500"), "{message}");
        assert!(message.contains("hyperstack: bad json"), "{message}");

        assert!(matches!(collect_all(&[]).await, Err(SourceError::AllFailed(_))));
    }
}
