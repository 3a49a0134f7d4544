//! Rule-driven document normalization.
//!
//! For every field of the [`RuleSet`], candidate locations are tried in
//! order. A location whose matches are empty (see [`crate::empty`]) is
//! skipped. The first location with a non-empty match is converted with the
//! field's [`FieldType`]; a usable (truthy) result ends the search, anything
//! else falls through to the next location.
//!
//! After the rule fields, derived fields are added:
//!
//! - `participants_and_defendants`: `defendants` and `participants` joined
//!   by newlines, skipping empty ones;
//! - `case_type` / `instance` replaced from the case-subtype table when the
//!   input carries a known `type_instance` marker;
//! - `main_document_text_length`: character count of `main_document_text`.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;
use thiserror::Error;

use crate::empty::{is_empty_sequence, is_truthy};
use crate::models::NormalizedDocument;
use crate::path::PathCache;
use crate::rules::{FieldRule, FieldType, RuleError, RuleSet, CANONICAL_DATE_FORMAT};

pub const PARTICIPANTS_AND_DEFENDANTS: &str = "participants_and_defendants";
pub const MAIN_DOCUMENT_TEXT: &str = "main_document_text";
pub const MAIN_DOCUMENT_TEXT_LENGTH: &str = "main_document_text_length";
const DEFENDANTS: &str = "defendants";
const PARTICIPANTS: &str = "participants";
const TYPE_INSTANCE: &str = "type_instance";
const CASE_TYPE: &str = "case_type";
const INSTANCE: &str = "instance";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("`{field_type}` conversion cannot take a {found} value")]
    NotScalar {
        field_type: &'static str,
        found: &'static str,
    },
}

/// A rule could not be evaluated against an input. This points at a rule
/// configuration defect rather than bad data.
#[derive(Debug, Error)]
#[error("failed to evaluate field `{field}` with rule {rule}: {source}")]
pub struct NormalizeError {
    pub field: String,
    pub rule: String,
    /// The input the rule was evaluated against.
    pub raw: Value,
    #[source]
    pub source: ConversionError,
}

pub struct Normalizer {
    rules: RuleSet,
    cache: Arc<PathCache>,
}

impl Normalizer {
    pub fn new(rules: RuleSet, cache: Arc<PathCache>) -> Self {
        Self { rules, cache }
    }

    /// Build from rule JSON, compiling paths into a fresh cache.
    pub fn from_json(rules_json: &str, type_instances_json: &str) -> Result<Self, RuleError> {
        let cache = Arc::new(PathCache::new());
        let rules = RuleSet::from_json(rules_json, type_instances_json, &cache)?;
        Ok(Self::new(rules, cache))
    }

    pub fn builtin() -> Result<Self, RuleError> {
        let cache = Arc::new(PathCache::new());
        let rules = RuleSet::builtin(&cache)?;
        Ok(Self::new(rules, cache))
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn cache(&self) -> &Arc<PathCache> {
        &self.cache
    }

    pub fn normalize(&self, raw: &Value) -> Result<NormalizedDocument, NormalizeError> {
        let mut doc = NormalizedDocument::new();

        for rule in &self.rules.fields {
            let value = resolve_field(raw, rule).map_err(|source| NormalizeError {
                field: rule.field.clone(),
                rule: rule.to_string(),
                raw: raw.clone(),
                source,
            })?;
            if let Some(value) = value {
                doc.insert(rule.field.clone(), value);
            }
        }

        let joined = [DEFENDANTS, PARTICIPANTS]
            .iter()
            .filter_map(|k| doc.get(*k))
            .filter(|v| is_truthy(v))
            .map(display_text)
            .collect::<Vec<_>>()
            .join("\n");
        doc.insert(PARTICIPANTS_AND_DEFENDANTS.to_string(), Value::String(joined));

        if let Some(marker) = raw.get(TYPE_INSTANCE).and_then(Value::as_str) {
            if let Some(override_) = self.rules.type_instance(marker) {
                if let Some(case_type) = &override_.case_type {
                    doc.insert(CASE_TYPE.to_string(), Value::String(case_type.clone()));
                }
                if let Some(instance) = &override_.instance {
                    doc.insert(INSTANCE.to_string(), Value::String(instance.clone()));
                }
            }
        }

        if let Some(text) = doc.get(MAIN_DOCUMENT_TEXT).and_then(Value::as_str) {
            let len = text.chars().count();
            doc.insert(MAIN_DOCUMENT_TEXT_LENGTH.to_string(), Value::from(len));
        }

        Ok(doc)
    }
}

/// Evaluate one field. `Ok(None)` means no location produced a usable value.
fn resolve_field(raw: &Value, rule: &FieldRule) -> Result<Option<Value>, ConversionError> {
    let mut locations_with_values = 0usize;

    for location in &rule.locations {
        let matches = location.path.find(raw);
        if is_empty_sequence(matches.iter().copied()) {
            continue;
        }
        locations_with_values += 1;

        let converted = convert(rule.field_type, &matches, location.format.as_deref())?;
        if is_usable(&converted) {
            return Ok(Some(converted));
        }
    }

    if locations_with_values > 0 {
        tracing::debug!(
            field = %rule.field,
            rule = %rule,
            locations_with_values,
            "values found but none converted"
        );
    }
    Ok(None)
}

fn is_usable(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        other => is_truthy(other),
    }
}

pub fn convert(
    field_type: FieldType,
    values: &[&Value],
    format: Option<&str>,
) -> Result<Value, ConversionError> {
    match field_type {
        FieldType::String => Ok(Value::String(string_value(values))),
        FieldType::List => list_value(values),
        FieldType::Merge => Ok(Value::String(merge_value(values))),
        FieldType::Date => date_value(values, format),
        FieldType::Boolean => Ok(Value::Bool(matches!(values.first(), Some(Value::Bool(true))))),
    }
}

fn string_value(values: &[&Value]) -> String {
    match values.iter().find(|v| !v.is_null()) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn list_value(values: &[&Value]) -> Result<Value, ConversionError> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    out.push(Value::String(trimmed.to_string()));
                }
            }
            Value::Array(items) if !items.is_empty() => {
                return Err(ConversionError::NotScalar {
                    field_type: "list",
                    found: "array",
                })
            }
            _ => {}
        }
    }
    Ok(Value::Array(out))
}

fn merge_value(values: &[&Value]) -> String {
    values
        .iter()
        .filter(|v| is_truthy(v))
        .map(|v| match v {
            Value::Array(items) => items
                .iter()
                .filter(|item| is_truthy(item))
                .map(display_name)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("; "),
            other => display_name(other),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn date_value(values: &[&Value], format: Option<&str>) -> Result<Value, ConversionError> {
    let raw = match values.first() {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Array(_)) => {
            return Err(ConversionError::NotScalar {
                field_type: "date",
                found: "array",
            })
        }
        Some(Value::Object(_)) => {
            return Err(ConversionError::NotScalar {
                field_type: "date",
                found: "object",
            })
        }
        _ => return Ok(Value::Null),
    };

    let format = format.unwrap_or(CANONICAL_DATE_FORMAT);
    let parsed = NaiveDate::parse_from_str(&raw, format)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(&raw, format).ok().map(|dt| dt.date()));

    Ok(parsed
        .map(|d| Value::String(d.format(CANONICAL_DATE_FORMAT).to_string()))
        .unwrap_or(Value::Null))
}

/// Short human label for a value: objects reduce to their `name` member,
/// or to their non-empty scalar members joined by ` - `.
fn display_name(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(display_name)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => match map.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => map
                .values()
                .filter(|v| is_truthy(v))
                .map(display_name)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" - "),
        },
    }
}

fn display_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
