//! Core data models that flow through the case-index pipeline.
//!
//! ```text
//! CaseUnit ──▶ VersionedSnapshot ──▶ RawExtraction ──▶ NormalizedDocument
//!                                                         │
//!                                                         ▼
//!                                                  IndexedDocument ──▶ backend
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value of one cell in an extracted table: either plain text or the
/// recursive extraction of a table nested inside that cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Scalar(String),
    Nested(Box<TableVariant>),
}

/// One key-value record (field label → cell).
pub type Record = BTreeMap<String, CellValue>;

/// Shape of one extracted table.
///
/// The variant is decided by the first data row: exactly two data cells
/// produce a [`TableVariant::Record`], any other count a
/// [`TableVariant::RecordList`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TableVariant {
    Record(Record),
    RecordList(Vec<Record>),
}

impl TableVariant {
    pub fn empty() -> Self {
        TableVariant::Record(Record::new())
    }

    pub fn is_record(&self) -> bool {
        matches!(self, TableVariant::Record(_))
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            TableVariant::Record(r) => Some(r),
            TableVariant::RecordList(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Record]> {
        match self {
            TableVariant::RecordList(rows) => Some(rows),
            TableVariant::Record(_) => None,
        }
    }
}

/// One top-level entry of a [`RawExtraction`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawEntry {
    Table(TableVariant),
    /// Verdict / full-text block. `None` marks a verdict container that
    /// was present but had no panel.
    Text(Option<String>),
}

/// Output of the table extractor for one HTML snapshot.
pub type RawExtraction = BTreeMap<String, RawEntry>;

/// Manifest fields carried by every case directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_number: Option<String>,
    /// Registration date, normalized to `YYYY-MM-DD` when the manifest
    /// carries `DD.MM.YYYY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_reg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub court_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub court_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Case-subtype marker used to override `case_type` / `instance`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_instance: Option<String>,
}

/// One case directory: manifest plus its HTML snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseUnit {
    pub group_id: String,
    /// Manifest path with forward slashes.
    pub manifest_path: String,
    /// Case directory relative to the ingestion root, forward slashes.
    pub rel_dir: String,
    pub manifest: ManifestFields,
    /// Snapshot file names as found on disk; ordering is done by the
    /// versioning resolver.
    pub html_files: Vec<String>,
}

/// One snapshot of a case with its resolved version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedSnapshot {
    pub file: String,
    /// 1-based chronological rank.
    pub version: u32,
    /// ISO-8601 UTC timestamp with milliseconds.
    pub version_ts: Option<String>,
    pub is_latest: bool,
}

/// Canonical flat document produced by the normalizer.
pub type NormalizedDocument = BTreeMap<String, Value>;

/// Bookkeeping attached to every delivered document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMeta {
    pub path_manifest: String,
    pub rel_dir: String,
    pub html_file: String,
    pub html_files: Vec<String>,
    pub version: u32,
    pub version_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Delivery envelope: a normalized document plus its versioning data.
///
/// [`IndexedDocument::to_json`] renders it flat: envelope fields sit next
/// to the normalized fields and win if the rule set produces the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub fields: NormalizedDocument,
    pub group_id: String,
    pub version: u32,
    pub version_ts: Option<String>,
    pub is_latest: bool,
    pub meta: DocumentMeta,
    pub files: Vec<FileInfo>,
    pub html_file: String,
    pub tag: Option<String>,
}

impl IndexedDocument {
    /// Backend identifier, stable across runs for the same snapshot.
    pub fn document_id(&self) -> String {
        document_id(&self.group_id, self.version)
    }

    pub fn to_json(&self) -> Value {
        let mut body = serde_json::Map::new();
        for (k, v) in &self.fields {
            body.insert(k.clone(), v.clone());
        }
        if let Ok(Value::Object(envelope)) = serde_json::to_value(EnvelopeView(self)) {
            body.extend(envelope);
        }
        Value::Object(body)
    }
}

/// Serializes only the envelope part of an [`IndexedDocument`].
struct EnvelopeView<'a>(&'a IndexedDocument);

impl Serialize for EnvelopeView<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let d = self.0;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("group_id", &d.group_id)?;
        map.serialize_entry("version", &d.version)?;
        if let Some(ts) = &d.version_ts {
            map.serialize_entry("version_ts", ts)?;
        }
        map.serialize_entry("is_latest", &d.is_latest)?;
        map.serialize_entry("meta", &d.meta)?;
        map.serialize_entry("files", &d.files)?;
        map.serialize_entry("html_file", &d.html_file)?;
        if let Some(tag) = &d.tag {
            map.serialize_entry("tag", tag)?;
        }
        map.end()
    }
}

pub fn document_id(group_id: &str, version: u32) -> String {
    format!("{}::{}", group_id, version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_variant_serializes_untagged() {
        let mut inner = Record::new();
        inner.insert("a".into(), CellValue::Scalar("1".into()));
        let mut outer = Record::new();
        outer.insert(
            "nested".into(),
            CellValue::Nested(Box::new(TableVariant::RecordList(vec![inner]))),
        );
        let v = serde_json::to_value(TableVariant::Record(outer)).unwrap();
        assert_eq!(v, json!({"nested": [{"a": "1"}]}));
    }

    #[test]
    fn null_text_entry_serializes_as_null() {
        let v = serde_json::to_value(RawEntry::Text(None)).unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn envelope_overrides_normalized_fields() {
        let mut fields = NormalizedDocument::new();
        fields.insert("case_number".into(), json!("2-1/2020"));
        fields.insert("version".into(), json!("bogus"));
        let doc = IndexedDocument {
            fields,
            group_id: "g1".into(),
            version: 2,
            version_ts: None,
            is_latest: true,
            meta: DocumentMeta {
                path_manifest: "a/manifest.json".into(),
                rel_dir: "a".into(),
                html_file: "x.html".into(),
                html_files: vec!["x.html".into()],
                version: 2,
                version_ts: None,
                error: None,
            },
            files: vec![],
            html_file: "x.html".into(),
            tag: None,
        };
        let v = doc.to_json();
        assert_eq!(v["version"], json!(2));
        assert_eq!(v["case_number"], json!("2-1/2020"));
        assert!(v.get("version_ts").is_none());
        assert_eq!(doc.document_id(), "g1::2");
    }
}
