//! Price extraction for history samples.

use serde_json::Value as JsonValue;

use crate::PriceRow;

/// Checked in order; the first field holding a usable number wins.
pub const PRICE_FIELDS: [&str; 3] = ["price_hour_usd", "price_usd", "price_month_usd"];

/// Coerce a JSON number or numeric-looking string into a finite price.
pub fn coerce_price(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(number) => number.as_f64(),
        JsonValue::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                text.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub fn extract_price(row: &PriceRow) -> Option<f64> {
    PRICE_FIELDS
        .iter()
        .filter_map(|field| row.get(field))
        .find_map(coerce_price)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hourly_price_wins_over_flat_price() {
        let row = PriceRow::new()
            .with("price_hour_usd", 2.5)
            .with("price_usd", 99);
        assert_eq!(extract_price(&row), Some(2.5));
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let row = PriceRow::new().with("price_usd", "3.10");
        assert_eq!(extract_price(&row), Some(3.10));
    }

    #[test]
    fn invalid_higher_priority_field_falls_through() {
        let row = PriceRow::new()
            .with("price_hour_usd", "call us")
            .with("price_usd", JsonValue::Null)
            .with("price_month_usd", 1200);
        assert_eq!(extract_price(&row), Some(1200.0));
    }

    #[test]
    fn rows_without_numeric_price_yield_nothing() {
        let row = PriceRow::new()
            .with("gpu_model", "H100")
            .with("price_hour_usd", "")
            .with("price_usd", "NaN");
        assert_eq!(extract_price(&row), None);
    }
}
