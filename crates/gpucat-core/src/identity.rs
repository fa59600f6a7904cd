//! Offering identity: GPU model normalization, the stable key that survives
//! re-scraping, and the content-addressed per-cycle row id.
//!
//! The stable key layout is a persisted contract. Favorites and price history
//! join on it, so the component order and formatting below must not drift
//! without a backfill of both tables.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::PriceRow;

pub const STABLE_KEY_DELIMITER: &str = ":";

const VENDOR_PREFIXES: [&str; 3] = ["nvidia", "amd", "tesla"];

const UPPERCASE_WORDS: [&str; 7] = ["rtx", "gtx", "sxm", "nvl", "hgx", "oam", "pro"];

/// SXM revision is fixed per chip (A100 is SXM4, H100/H200 SXM5, B200/B300 SXM6).
const SXM_REVISIONS: [&str; 3] = ["sxm4", "sxm5", "sxm6"];

/// Ampere workstation cards some providers list without the RTX prefix.
const RTX_A_SERIES: [&str; 3] = ["A4000", "A5000", "A6000"];

/// Provider spellings mapped onto one canonical model name. Keys are matched
/// case-insensitively against the token-normalized model.
const GPU_MODEL_ALIASES: &[(&str, &str)] = &[
    ("H100-SXM", "H100 SXM"),
    ("H100-PCIE", "H100 PCIe"),
    ("H100 NVLINK", "H100 NVL"),
    ("A100 80G", "A100 80GB"),
    ("A100-80GB", "A100 80GB"),
    ("A100-40GB", "A100 40GB"),
    ("A100-SXM4-80GB", "A100 SXM 80GB"),
    ("RTX4090", "RTX 4090"),
    ("RTX3090", "RTX 3090"),
    ("RTXA6000", "RTX A6000"),
    ("GH200 GRACE HOPPER", "GH200"),
    ("L40S 48GB", "L40S"),
    ("MI300X OAM", "MI300X"),
    ("INSTINCT MI300X", "MI300X"),
];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("provider name is empty")]
    MissingProvider,
    #[error("row payload is not serializable: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Canonical model string for free-text GPU descriptors.
pub fn normalize_gpu_model(raw: &str) -> String {
    let mut tokens: Vec<&str> = raw.split_whitespace().collect();
    while tokens.len() > 1
        && VENDOR_PREFIXES
            .iter()
            .any(|prefix| tokens[0].eq_ignore_ascii_case(prefix))
    {
        tokens.remove(0);
    }

    let mut tokens: Vec<String> = tokens.into_iter().map(canonical_token).collect();
    prefix_rtx_a_series(&mut tokens);
    drop_rtx_pro_blackwell_tag(&mut tokens);
    let normalized = tokens.join(" ");

    GPU_MODEL_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(&normalized))
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or(normalized)
}

fn canonical_token(token: &str) -> String {
    let lower = token.to_ascii_lowercase();
    if lower == "pcie" {
        return "PCIe".to_string();
    }
    if SXM_REVISIONS.contains(&lower.as_str()) {
        return "SXM".to_string();
    }
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    let has_alpha = token.chars().any(|c| c.is_ascii_alphabetic());
    if UPPERCASE_WORDS.contains(&lower.as_str()) || (has_digit && has_alpha) {
        token.to_ascii_uppercase()
    } else {
        token.to_string()
    }
}

fn prefix_rtx_a_series(tokens: &mut Vec<String>) {
    let mut idx = 0;
    while idx < tokens.len() {
        let bare = RTX_A_SERIES.contains(&tokens[idx].as_str())
            && (idx == 0 || tokens[idx - 1] != "RTX");
        if bare {
            tokens.insert(idx, "RTX".to_string());
            idx += 1;
        }
        idx += 1;
    }
}

/// `RTX PRO 6000 Blackwell SE` -> `RTX PRO 6000 SE`.
fn drop_rtx_pro_blackwell_tag(tokens: &mut Vec<String>) {
    let position = tokens.windows(5).position(|window| {
        window[0] == "RTX"
            && window[1] == "PRO"
            && window[2] == "6000"
            && window[3].eq_ignore_ascii_case("blackwell")
            && window[4].eq_ignore_ascii_case("se")
    });
    if let Some(start) = position {
        tokens.remove(start + 3);
    }
}

/// Inputs of the stable key. `gpu_model` is raw; it is normalized here.
#[derive(Debug, Clone, Copy, Default)]
pub struct StableKeyParts<'a> {
    pub provider: &'a str,
    pub sku: Option<&'a str>,
    pub gpu_model: Option<&'a str>,
    pub gpu_count: Option<f64>,
    pub vram_gb: Option<f64>,
    pub instance_type: Option<&'a str>,
}

impl<'a> StableKeyParts<'a> {
    pub fn from_row(provider: &'a str, row: &'a PriceRow) -> Self {
        Self {
            provider,
            sku: row.sku(),
            gpu_model: row.gpu_model(),
            gpu_count: row.gpu_count(),
            vram_gb: row.vram_gb(),
            instance_type: row.instance_type(),
        }
    }
}

/// `provider:sku:model:{count}x:{vram}gb:type`, empty components dropped.
pub fn stable_key(parts: &StableKeyParts<'_>) -> String {
    let components = [
        parts.provider.trim().to_lowercase(),
        parts.sku.unwrap_or_default().trim().to_lowercase(),
        parts
            .gpu_model
            .map(normalize_gpu_model)
            .unwrap_or_default()
            .trim()
            .to_lowercase(),
        parts
            .gpu_count
            .map(|n| format!("{}x", render_number(n)))
            .unwrap_or_default(),
        parts
            .vram_gb
            .map(|n| format!("{}gb", render_number(n)))
            .unwrap_or_default(),
        parts
            .instance_type
            .map(collapse_instance_type)
            .unwrap_or_default()
            .trim()
            .to_lowercase(),
    ];

    components
        .into_iter()
        .filter(|component| !component.is_empty())
        .collect::<Vec<_>>()
        .join(STABLE_KEY_DELIMITER)
}

pub fn stable_key_for_row(provider: &str, row: &PriceRow) -> String {
    stable_key(&StableKeyParts::from_row(provider, row))
}

fn collapse_instance_type(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("virtual machine") {
        "VM".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Integral values render without a fraction (`8`, not `8.0`).
fn render_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical `{provider, observed_at, row}` document.
pub fn row_id(provider: &str, observed_at_iso: &str, row: &PriceRow) -> Result<String, IdentityError> {
    if provider.trim().is_empty() {
        return Err(IdentityError::MissingProvider);
    }
    let mut document = serde_json::Map::new();
    document.insert("provider".into(), JsonValue::String(provider.to_string()));
    document.insert(
        "observed_at".into(),
        JsonValue::String(observed_at_iso.to_string()),
    );
    document.insert("row".into(), serde_json::to_value(row)?);

    let canonical = canonical_json(&JsonValue::Object(document));
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}
