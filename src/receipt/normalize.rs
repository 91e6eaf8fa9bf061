use super::{ExtractedLineItem, ExtractedReceipt, ItemStatus, SummaryFilter};
use crate::llm_extract::ExtractionError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use time::macros::format_description;
use time::{Date, Month};
use tracing::{debug, info};

/// Bare count unit ("kappale").
pub const DEFAULT_UNIT: &str = "kpl";

const UNKNOWN_ITEM: &str = "Unknown Item";
const UNKNOWN_SUPPLIER: &str = "Unknown";

static NUMERIC_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?").unwrap());

/// Turn the model's answer text into a receipt. The model is untrusted:
/// summary lines are dropped, numbers are coerced field by field and
/// missing header fields fall back to defaults.
pub fn parse_model_response(
    text: &str,
    filter: &SummaryFilter,
    today: Date,
) -> Result<ExtractedReceipt, ExtractionError> {
    let json_str = json_object_span(strip_fences(text));

    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| ExtractionError::Unreadable(format!("response is not valid JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(ExtractionError::Unreadable(
            "response is not a JSON object".to_string(),
        ));
    };

    if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
        let reason = err.as_str().unwrap_or("model reported an error");
        return Err(ExtractionError::Unreadable(reason.to_string()));
    }

    let raw_items = obj
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut items = Vec::with_capacity(raw_items.len());
    let mut dropped = 0usize;
    for raw in raw_items {
        let Some(raw) = raw.as_object() else {
            dropped += 1;
            continue;
        };
        let name = string_field(raw, "name").unwrap_or_default();
        if filter.is_summary(&name) {
            debug!(name = %name, "Dropping summary line");
            dropped += 1;
            continue;
        }
        items.push(to_line_item(raw, name, items.len() + 1));
    }

    info!(kept = items.len(), dropped, "Receipt items normalized");

    Ok(ExtractedReceipt {
        supplier_name: string_field(&obj, "supplier_name")
            .unwrap_or_else(|| UNKNOWN_SUPPLIER.to_string()),
        date: string_field(&obj, "date")
            .and_then(|d| parse_date(&d))
            .unwrap_or(today),
        order_number: string_field(&obj, "order_number"),
        items,
        total_value: non_negative(obj.get("totalValue")).unwrap_or(0.0),
    })
}

fn to_line_item(raw: &Map<String, Value>, name: String, position: usize) -> ExtractedLineItem {
    ExtractedLineItem {
        id: format!("item-{position}"),
        name: if name.is_empty() {
            UNKNOWN_ITEM.to_string()
        } else {
            name
        },
        quantity: coerce_number(raw.get("quantity"))
            .filter(|q| *q > 0.0)
            .unwrap_or(1.0),
        unit: string_field(raw, "unit").unwrap_or_else(|| DEFAULT_UNIT.to_string()),
        price_per_unit: non_negative(raw.get("pricePerUnit")).unwrap_or(0.0),
        total_price: non_negative(raw.get("totalPrice")).unwrap_or(0.0),
        received_quantity: None,
        status: ItemStatus::Pending,
    }
}

/// Models sometimes wrap JSON in markdown fences despite instructions.
fn strip_fences(s: &str) -> &str {
    s.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Some local models put reasoning text around the answer. Keep the
/// outermost `{...}` when there is one.
fn json_object_span(s: &str) -> &str {
    match (s.find('{'), s.rfind('}')) {
        (Some(start), Some(end)) if start < end => &s[start..=end],
        _ => s,
    }
}

/// Trimmed, non-empty text. Numbers are accepted and printed.
fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    let s = match obj.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// JSON numbers, or strings with a leading numeric part ("4,50 €" → 4.5).
fn coerce_number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim().replace(',', ".");
            NUMERIC_PREFIX.find(&s)?.as_str().parse().ok()?
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn non_negative(value: Option<&Value>) -> Option<f64> {
    coerce_number(value).filter(|n| *n >= 0.0)
}

/// `YYYY-MM-DD` (optionally followed by a time) or Finnish `D.M.YYYY`.
fn parse_date(s: &str) -> Option<Date> {
    let iso = format_description!("[year]-[month]-[day]");
    if let Some(head) = s.get(..10) {
        if let Ok(date) = Date::parse(head, &iso) {
            return Some(date);
        }
    }

    let mut parts = s.split('.').map(str::trim);
    let day: u8 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let year: i32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}
