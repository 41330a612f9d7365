//! Concrete search backends.

pub mod lastfm;
pub mod ytdlp;

use serde_json::Value;

/// Treats a single object as a one-element array; Last.fm collapses
/// singleton lists that way.
pub(crate) fn array_or_single(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

/// Reads a string field, accepting numbers written as strings or vice versa.
pub(crate) fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
