//! Catalog read model over the current snapshot: per-provider snapshots,
//! filtering with offset pagination, and facet counts for the browse UI.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use gpucat_core::{coerce_price, iso_millis, PriceRow, PricingRecord, ProviderSnapshot};
use serde::{Deserialize, Serialize};

use crate::{PricingStore, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// Upper bounds at or above this are treated as "and higher".
const OPEN_RANGE_BOUND: f64 = 1_000_000.0;

/// Providers listed first in the provider facet; the rest follow alphabetically.
const PROVIDER_SORT_PRIORITY: &[(&str, u32)] = &[
    ("coreweave", 1),
    ("lambda", 2),
    ("runpod", 3),
    ("digitalocean", 4),
    ("oracle", 5),
    ("nebius", 6),
    ("hyperstack", 7),
    ("crusoe", 8),
];

const SEARCH_TEXT_FIELDS: &[&str] = &[
    "gpu_model",
    "item",
    "provider",
    "region",
    "zone",
    "sku",
    "billing_notes",
    "price_unit",
    "type",
    "network",
];

const SEARCH_NUMERIC_FIELDS: &[&str] = &[
    "gpu_count",
    "vram_gb",
    "system_ram_gb",
    "local_storage_tb",
    "vcpus",
    "price_hour_usd",
    "price_month_usd",
    "price_usd",
    "raw_cost",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Provider,
    GpuModel,
    PriceHourUsd,
    VramGb,
    ObservedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogQuery {
    /// Exact provider names.
    pub providers: Vec<String>,
    /// Instance types, matched case-insensitively.
    pub types: Vec<String>,
    /// Case-insensitive substrings of `gpu_model` (or `item` when absent).
    pub gpu_models: Vec<String>,
    pub vram_range: Option<(f64, f64)>,
    /// Range over the hourly price (`price_hour_usd`, else `price_usd`).
    pub price_range: Option<(f64, f64)>,
    pub search: Option<String>,
    pub sort: SortField,
    pub direction: SortDirection,
    /// Offset of the first row.
    pub cursor: usize,
    pub size: Option<usize>,
}

impl CatalogQuery {
    pub fn page_size(&self) -> usize {
        self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn matches(&self, record: &PricingRecord) -> bool {
        let row = &record.data;

        if !self.providers.is_empty() && !self.providers.iter().any(|p| p == &record.provider) {
            return false;
        }
        if !self.types.is_empty() {
            let Some(kind) = row.instance_type() else {
                return false;
            };
            if !self.types.iter().any(|t| t.eq_ignore_ascii_case(kind)) {
                return false;
            }
        }
        if !self.gpu_models.is_empty() {
            let Some(model) = model_label(row) else {
                return false;
            };
            let model = model.to_lowercase();
            if !self
                .gpu_models
                .iter()
                .any(|wanted| model.contains(&wanted.to_lowercase()))
            {
                return false;
            }
        }
        if let Some(range) = self.vram_range {
            if !in_range(row.vram_gb(), range) {
                return false;
            }
        }
        if let Some(range) = self.price_range {
            if !in_range(hourly_price(row), range) {
                return false;
            }
        }
        if let Some(term) = self.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if !matches_search(record, &term.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPage {
    pub rows: Vec<PricingRecord>,
    /// Rows matching the filters before pagination.
    pub filter_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetRow<T> {
    pub value: T,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facet<T> {
    pub rows: Vec<FacetRow<T>>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogFacets {
    pub provider: Facet<String>,
    #[serde(rename = "type")]
    pub instance_type: Facet<String>,
    pub gpu_model: Facet<String>,
    pub vram_gb: Facet<f64>,
    pub price_hour_usd: Facet<f64>,
}

/// `gpu_model`, falling back to the free-text `item` label.
fn model_label(row: &PriceRow) -> Option<&str> {
    row.gpu_model().or_else(|| row.item())
}

fn hourly_price(row: &PriceRow) -> Option<f64> {
    ["price_hour_usd", "price_usd"]
        .iter()
        .find_map(|field| row.get(field).and_then(coerce_price))
}

fn in_range(value: Option<f64>, (min, max): (f64, f64)) -> bool {
    match value {
        Some(v) if max >= OPEN_RANGE_BOUND => v >= min,
        Some(v) => v >= min && v <= max,
        None => false,
    }
}

fn matches_search(record: &PricingRecord, term: &str) -> bool {
    if record.provider.to_lowercase().contains(term) {
        return true;
    }
    let row = &record.data;
    let text_hit = SEARCH_TEXT_FIELDS
        .iter()
        .filter_map(|field| row.str_field(field))
        .any(|value| value.to_lowercase().contains(term));
    text_hit
        || SEARCH_NUMERIC_FIELDS
            .iter()
            .filter_map(|field| row.get(field))
            .filter(|value| value.is_number() || value.is_string())
            .any(|value| match value.as_str() {
                Some(text) => text.to_lowercase().contains(term),
                None => value.to_string().contains(term),
            })
}

/// Missing values sort last in either direction.
fn compare_optional<T: PartialOrd>(a: Option<T>, b: Option<T>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_records(a: &PricingRecord, b: &PricingRecord, field: SortField, direction: SortDirection) -> Ordering {
    let primary = match field {
        SortField::Provider => compare_optional(Some(&a.provider), Some(&b.provider), direction),
        SortField::GpuModel => compare_optional(model_label(&a.data), model_label(&b.data), direction),
        SortField::PriceHourUsd => {
            compare_optional(hourly_price(&a.data), hourly_price(&b.data), direction)
        }
        SortField::VramGb => compare_optional(a.data.vram_gb(), b.data.vram_gb(), direction),
        SortField::ObservedAt => compare_optional(Some(a.observed_at), Some(b.observed_at), direction),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

/// Filter, sort and paginate `records`.
pub fn filter_catalog(records: &[PricingRecord], query: &CatalogQuery) -> CatalogPage {
    let mut matching: Vec<&PricingRecord> = records.iter().filter(|r| query.matches(r)).collect();
    matching.sort_by(|a, b| compare_records(a, b, query.sort, query.direction));

    let filter_count = matching.len();
    let rows = matching
        .into_iter()
        .skip(query.cursor)
        .take(query.page_size())
        .cloned()
        .collect();
    CatalogPage { rows, filter_count }
}

fn provider_priority(provider: &str) -> u32 {
    let lower = provider.to_lowercase();
    PROVIDER_SORT_PRIORITY
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, priority)| *priority)
        .unwrap_or(999)
}

fn text_facet<'a, I>(values: I, total: usize) -> Facet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    Facet {
        rows: counts
            .into_iter()
            .map(|(value, total)| FacetRow {
                value: value.to_string(),
                total,
            })
            .collect(),
        total,
        min: None,
        max: None,
    }
}

fn numeric_facet<I>(values: I, total: usize) -> Facet<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);

    let mut rows: Vec<FacetRow<f64>> = Vec::new();
    for value in sorted {
        match rows.last_mut() {
            Some(last) if last.value == value => last.total += 1,
            _ => rows.push(FacetRow { value, total: 1 }),
        }
    }
    Facet {
        min: rows.first().map(|r| r.value),
        max: rows.last().map(|r| r.value),
        rows,
        total,
    }
}

pub fn catalog_facets(records: &[PricingRecord]) -> CatalogFacets {
    let total = records.len();

    let mut provider = text_facet(records.iter().map(|r| r.provider.as_str()), total);
    provider.rows.sort_by(|a, b| {
        provider_priority(&a.value)
            .cmp(&provider_priority(&b.value))
            .then_with(|| a.value.cmp(&b.value))
    });

    CatalogFacets {
        provider,
        instance_type: text_facet(records.iter().filter_map(|r| r.data.instance_type()), total),
        gpu_model: text_facet(records.iter().filter_map(|r| model_label(&r.data)), total),
        vram_gb: numeric_facet(records.iter().filter_map(|r| r.data.vram_gb()), total),
        price_hour_usd: numeric_facet(records.iter().filter_map(|r| hourly_price(&r.data)), total),
    }
}

/// Group records per provider: highest version, latest observation, all rows.
pub fn provider_snapshots(records: &[PricingRecord]) -> Vec<ProviderSnapshot> {
    let mut grouped: BTreeMap<&str, Vec<&PricingRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.provider.as_str()).or_default().push(record);
    }

    grouped
        .into_iter()
        .filter_map(|(provider, group)| {
            let version = group.iter().map(|r| r.version).max()?;
            let last_updated = group.iter().map(|r| r.observed_at).max()?;
            Some(ProviderSnapshot {
                provider: provider.to_string(),
                version,
                last_updated: iso_millis(last_updated),
                rows: group.into_iter().map(|r| r.data.clone()).collect(),
            })
        })
        .collect()
}

pub async fn snapshot_for_provider(
    store: &dyn PricingStore,
    provider: &str,
) -> Result<Option<ProviderSnapshot>, StoreError> {
    let records = store.records_by_provider(provider).await?;
    Ok(provider_snapshots(&records).into_iter().next())
}

/// Records per stable key, for favorites that outlive row ids.
pub fn index_by_stable_key(records: &[PricingRecord]) -> HashMap<&str, Vec<&PricingRecord>> {
    let mut index: HashMap<&str, Vec<&PricingRecord>> = HashMap::new();
    for record in records {
        index.entry(record.stable_key.as_str()).or_default().push(record);
    }
    index
}
