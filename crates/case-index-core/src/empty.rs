//! Semantic emptiness checks shared by the extractor and the normalizer.
//!
//! "Empty" here is looser than `is_null`: a blank string, a sequence of
//! blank strings, or a sequence with no truthy element all count as absent
//! data, because scraped tables routinely carry placeholder cells.

use serde_json::Value;

/// Returns `true` if the string is empty after trimming whitespace.
pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Truthiness as the rule engine understands it: `null`, `false`, `0`,
/// and `""` are falsy; everything else (including empty containers) is
/// truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Returns `true` if a single value is semantically empty.
///
/// - `null` is empty.
/// - A string is empty when blank after trimming.
/// - An array is empty when it has no elements, when every element is a
///   blank string, or when no element is truthy.
/// - Numbers, booleans and objects are never empty on their own.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => is_blank(s),
        Value::Array(items) => is_empty_sequence(items.iter()),
        _ => false,
    }
}

/// Emptiness for a sequence of matched values, such as the result of a
/// path query.
pub fn is_empty_sequence<'a, I>(items: I) -> bool
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut saw_any = false;
    let mut all_blank = true;
    let mut any_truthy = false;
    for item in items {
        saw_any = true;
        let blank = match item {
            Value::String(s) => is_blank(s),
            _ => false,
        };
        if !blank {
            all_blank = false;
        }
        if is_truthy(item) {
            any_truthy = true;
        }
    }
    !saw_any || all_blank || !any_truthy
}
