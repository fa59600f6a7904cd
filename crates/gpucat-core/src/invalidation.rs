//! Cache invalidation domains emitted after a successful snapshot replace.
//!
//! The rendered tag strings are subscribed to literally by other subsystems
//! (listing/facet caches, favorites, per-instance history charts).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ReplaceOutcome;

pub const PRICING_TAG: &str = "pricing";
pub const FAVORITES_TAG: &str = "favorites";
pub const HISTORY_TAG_PREFIX: &str = "gpu-price-history:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationTag {
    /// Full listing and facet caches.
    Pricing,
    /// Favorites join against the snapshot.
    Favorites,
    /// One stable key's history chart.
    History(String),
}

impl InvalidationTag {
    pub fn as_tag(&self) -> String {
        match self {
            InvalidationTag::Pricing => PRICING_TAG.to_string(),
            InvalidationTag::Favorites => FAVORITES_TAG.to_string(),
            InvalidationTag::History(stable_key) => format!("{HISTORY_TAG_PREFIX}{stable_key}"),
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            PRICING_TAG => Some(InvalidationTag::Pricing),
            FAVORITES_TAG => Some(InvalidationTag::Favorites),
            other => other
                .strip_prefix(HISTORY_TAG_PREFIX)
                .filter(|key| !key.is_empty())
                .map(|key| InvalidationTag::History(key.to_string())),
        }
    }
}

impl fmt::Display for InvalidationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_tag())
    }
}

/// Tags a caller must invalidate after `outcome`: the two global domains
/// first, then one history tag per touched stable key.
pub fn invalidation_tags(outcome: &ReplaceOutcome) -> Vec<InvalidationTag> {
    let mut tags = Vec::with_capacity(outcome.touched_stable_keys.len() + 2);
    tags.push(InvalidationTag::Pricing);
    tags.push(InvalidationTag::Favorites);
    tags.extend(
        outcome
            .touched_stable_keys
            .iter()
            .map(|key| InvalidationTag::History(key.clone())),
    );
    tags
}
