//! Core domain model for the GPU pricing catalog: scrape handoff types,
//! stored records, history samples and the identity scheme that ties them together.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod clock;
pub mod identity;
pub mod invalidation;
pub mod price;

pub use clock::{Clock, FixedClock, SystemClock};
pub use identity::{
    canonical_json, normalize_gpu_model, row_id, stable_key, stable_key_for_row, IdentityError,
    StableKeyParts,
};
pub use invalidation::{invalidation_tags, InvalidationTag};
pub use price::{coerce_price, extract_price, PRICE_FIELDS};

pub const CRATE_NAME: &str = "gpucat-core";

/// Number of days a price sample stays visible to history reads.
pub const HISTORY_RETENTION_DAYS: i64 = 30;

/// Schemaless provider row. Providers populate different subsets of fields,
/// so the payload is kept as a JSON object with typed accessors for the
/// attributes the catalog cares about.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceRow(pub Map<String, JsonValue>);

impl PriceRow {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// String value of `key`; non-string JSON values yield `None`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    /// Numeric value of `key`. Only JSON numbers count; numeric-looking strings do not.
    pub fn number_field(&self, key: &str) -> Option<f64> {
        self.0
            .get(key)
            .and_then(JsonValue::as_f64)
            .filter(|v| v.is_finite())
    }

    pub fn gpu_model(&self) -> Option<&str> {
        self.str_field("gpu_model")
    }

    pub fn item(&self) -> Option<&str> {
        self.str_field("item")
    }

    pub fn sku(&self) -> Option<&str> {
        self.str_field("sku")
    }

    pub fn gpu_count(&self) -> Option<f64> {
        self.number_field("gpu_count")
    }

    pub fn vram_gb(&self) -> Option<f64> {
        self.number_field("vram_gb")
    }

    pub fn instance_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.str_field("instance_id")
    }
}

impl From<Map<String, JsonValue>> for PriceRow {
    fn from(value: Map<String, JsonValue>) -> Self {
        Self(value)
    }
}

/// Observation time as handed over by a scraper: either a timestamp or free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservedAt {
    At(DateTime<Utc>),
    EpochMillis(i64),
    Text(String),
}

impl ObservedAt {
    /// Resolve to a UTC instant with millisecond precision. Unparseable text
    /// falls back to `now` so a bad timestamp never drops a whole provider.
    pub fn normalize(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let resolved = match self {
            ObservedAt::At(at) => Some(*at),
            ObservedAt::EpochMillis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            ObservedAt::Text(text) => parse_observed_text(text),
        };
        resolved.unwrap_or(now).trunc_subsecs(3)
    }
}

impl From<DateTime<Utc>> for ObservedAt {
    fn from(value: DateTime<Utc>) -> Self {
        ObservedAt::At(value)
    }
}

impl From<&str> for ObservedAt {
    fn from(value: &str) -> Self {
        ObservedAt::Text(value.to_string())
    }
}

fn parse_observed_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Offsets without a colon (`+0200`), which RFC 3339 rejects.
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    // No zone: read as UTC. Seconds are optional.
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// ISO-8601 rendering used everywhere a timestamp leaves the store
/// (`2024-01-01T00:00:00.000Z`).
pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn default_version() -> i32 {
    1
}

/// One provider's scrape output for one ingestion cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub provider: String,
    #[serde(alias = "observed_at")]
    pub observed_at: ObservedAt,
    #[serde(default = "default_version")]
    pub version: i32,
    #[serde(default, alias = "source_hash")]
    pub source_hash: Option<String>,
    #[serde(default)]
    pub rows: Vec<PriceRow>,
}

impl ProviderResult {
    pub fn new(provider: impl Into<String>, observed_at: impl Into<ObservedAt>) -> Self {
        Self {
            provider: provider.into(),
            observed_at: observed_at.into(),
            version: 1,
            source_hash: None,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<PriceRow>) -> Self {
        self.rows = rows;
        self
    }
}

/// Stored snapshot row. `id` changes every cycle, `stable_key` does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRecord {
    pub id: String,
    pub provider: String,
    pub observed_at: DateTime<Utc>,
    pub version: i32,
    pub source_hash: Option<String>,
    pub data: PriceRow,
    pub stable_key: String,
    pub price_usd: Option<f64>,
    pub gpu_count: Option<f64>,
    pub vram_gb: Option<f64>,
}

/// One point of the price time series, keyed by `(stable_key, observed_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuPriceSample {
    pub stable_key: String,
    pub provider: String,
    pub observed_at: DateTime<Utc>,
    pub price_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub observed_at: String,
    pub price_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub provider: String,
    pub version: i32,
    pub last_updated: String,
    pub rows: Vec<PriceRow>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_rows: u64,
    pub providers: Vec<String>,
    pub last_scraped_at: Option<String>,
}

/// Result of one snapshot replacement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOutcome {
    pub stored: usize,
    pub touched_stable_keys: Vec<String>,
    pub skipped_rows: usize,
    pub pruned_samples: u64,
    /// Set when the history append or prune failed after the snapshot committed.
    pub history_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn provider_result_accepts_camel_and_snake_case() {
        let camel: ProviderResult = serde_json::from_str(
            r#"{"provider":"lambda","observedAt":"2024-01-01T00:00:00Z","version":2,"sourceHash":"abc","rows":[{"gpu_model":"H100"}]}"#,
        )
        .unwrap();
        assert_eq!(camel.version, 2);
        assert_eq!(camel.source_hash.as_deref(), Some("abc"));
        assert_eq!(camel.rows[0].gpu_model(), Some("H100"));

        let snake: ProviderResult = serde_json::from_str(
            r#"{"provider":"lambda","observed_at":"2024-01-01T00:00:00Z","rows":[]}"#,
        )
        .unwrap();
        assert_eq!(snake.version, 1);
        assert!(snake.source_hash.is_none());
    }

    #[test]
    fn observed_at_normalizes_to_millisecond_utc() {
        let now = utc("2025-06-01T00:00:00Z");
        let text = ObservedAt::Text("2024-01-01T02:00:00.123456+02:00".into());
        assert_eq!(iso_millis(text.normalize(now)), "2024-01-01T00:00:00.123Z");

        let millis = ObservedAt::EpochMillis(1_704_067_200_000);
        assert_eq!(iso_millis(millis.normalize(now)), "2024-01-01T00:00:00.000Z");

        let plain = ObservedAt::Text("2024-03-05 10:11:12".into());
        assert_eq!(iso_millis(plain.normalize(now)), "2024-03-05T10:11:12.000Z");
    }

    #[test]
    fn observed_at_without_seconds_is_read_as_utc() {
        let now = utc("2030-01-01T00:00:00Z");
        let iso = ObservedAt::Text("2024-01-01T10:30".into());
        assert_eq!(iso_millis(iso.normalize(now)), "2024-01-01T10:30:00.000Z");

        let spaced = ObservedAt::Text("2024-01-01 10:30".into());
        assert_eq!(iso_millis(spaced.normalize(now)), "2024-01-01T10:30:00.000Z");
    }

    #[test]
    fn observed_at_accepts_compact_offsets() {
        let now = utc("2030-01-01T00:00:00Z");
        let compact = ObservedAt::Text("2024-01-01T00:00:00+0200".into());
        assert_eq!(iso_millis(compact.normalize(now)), "2023-12-31T22:00:00.000Z");

        let spaced = ObservedAt::Text("2024-01-01 12:00:00.5-0130".into());
        assert_eq!(iso_millis(spaced.normalize(now)), "2024-01-01T13:30:00.500Z");
    }

    #[test]
    fn unparseable_observed_at_falls_back_to_now() {
        let now = utc("2025-06-01T08:30:00Z");
        let garbage = ObservedAt::Text("yesterday-ish".into());
        assert_eq!(garbage.normalize(now), now);
    }

    #[test]
    fn number_field_ignores_strings() {
        let row = PriceRow::new().with("gpu_count", "8").with("vram_gb", 80);
        assert_eq!(row.gpu_count(), None);
        assert_eq!(row.vram_gb(), Some(80.0));
    }
}
