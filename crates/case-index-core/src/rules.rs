//! Declarative normalization rules.
//!
//! A rule set maps each output field to a type tag and an ordered list of
//! candidate locations:
//!
//! ```json
//! {
//!   "judge":    { "type": "string", "locations": ["$.raw_tables['ДЕЛО']['Судья']"] },
//!   "date_reg": { "type": "date", "locations": [
//!       { "key": "$.raw_tables['ДЕЛО']['Дата поступления']", "format": "%d.%m.%Y" },
//!       "$.date_reg"
//!   ] }
//! }
//! ```
//!
//! Type tags are parsed into [`FieldType`] and every location path is
//! compiled once, when the rule set is loaded. A missing `type` means
//! `string`. Date formats use `chrono` strftime syntax.
//!
//! The case-subtype table maps a `type_instance` marker to replacement
//! `case_type` / `instance` values.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::path::{JsonPath, PathCache, PathError};

/// Built-in rule set shipped with the binary.
pub const DEFAULT_RULES: &str = include_str!("../rules/default_rules.json");

/// Built-in case-subtype table shipped with the binary.
pub const DEFAULT_TYPE_INSTANCES: &str = include_str!("../rules/type_instance.json");

/// Canonical output format for `date` fields.
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to parse rule set: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("field `{field}`: {source}")]
    Path {
        field: String,
        #[source]
        source: PathError,
    },
    #[error("field `{0}` declares no locations")]
    NoLocations(String),
}

/// Conversion applied to the raw values found at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    List,
    Merge,
    Date,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::List => "list",
            FieldType::Merge => "merge",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
        }
    }
}

/// One candidate location of a field.
#[derive(Debug, Clone)]
pub struct Location {
    pub path: Arc<JsonPath>,
    /// Input date format; only meaningful for `date` fields.
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: String,
    pub field_type: FieldType,
    pub locations: Vec<Location>,
}

impl std::fmt::Display for FieldRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} [", self.field, self.field_type.as_str())?;
        for (i, loc) in self.locations.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", loc.path.as_str())?;
            if let Some(fmt) = &loc.format {
                write!(f, " ({})", fmt)?;
            }
        }
        write!(f, "]")
    }
}

/// Replacement values for a recognized case subtype.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TypeInstance {
    #[serde(default)]
    pub case_type: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    pub fields: Vec<FieldRule>,
    pub type_instances: HashMap<String, TypeInstance>,
}

#[derive(Deserialize)]
struct RuleSpec {
    #[serde(rename = "type", default)]
    field_type: FieldType,
    locations: Vec<LocationSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocationSpec {
    Path(String),
    Keyed {
        key: String,
        #[serde(default)]
        format: Option<String>,
    },
}

impl RuleSet {
    /// Parse a rule set and a case-subtype table, compiling every path
    /// through `cache`.
    pub fn from_json(
        rules_json: &str,
        type_instances_json: &str,
        cache: &PathCache,
    ) -> Result<Self, RuleError> {
        let specs: std::collections::BTreeMap<String, RuleSpec> =
            serde_json::from_str(rules_json)?;
        let type_instances: HashMap<String, TypeInstance> =
            serde_json::from_str(type_instances_json)?;

        let mut fields = Vec::with_capacity(specs.len());
        for (field, spec) in specs {
            if spec.locations.is_empty() {
                return Err(RuleError::NoLocations(field));
            }
            let mut locations = Vec::with_capacity(spec.locations.len());
            for loc in spec.locations {
                let (expr, format) = match loc {
                    LocationSpec::Path(p) => (p, None),
                    LocationSpec::Keyed { key, format } => (key, format),
                };
                let path = cache.get_or_compile(&expr).map_err(|source| RuleError::Path {
                    field: field.clone(),
                    source,
                })?;
                locations.push(Location { path, format });
            }
            fields.push(FieldRule {
                field,
                field_type: spec.field_type,
                locations,
            });
        }

        Ok(Self {
            fields,
            type_instances,
        })
    }

    /// The rule set embedded in the binary.
    pub fn builtin(cache: &PathCache) -> Result<Self, RuleError> {
        Self::from_json(DEFAULT_RULES, DEFAULT_TYPE_INSTANCES, cache)
    }

    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|r| r.field == name)
    }

    pub fn type_instance(&self, marker: &str) -> Option<&TypeInstance> {
        self.type_instances.get(marker)
    }
}
