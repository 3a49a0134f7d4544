//! Assembly of delivery documents for one case.
//!
//! Each snapshot is turned into the combined raw structure the normalizer
//! reads:
//!
//! ```text
//! { <manifest fields>, raw_tables, path_manifest, rel_dir, html_file,
//!   html_files, version, version_ts, is_latest, file_error? }
//! ```
//!
//! and the normalized result is wrapped in an [`IndexedDocument`].

use serde_json::{Map, Value};

use crate::models::{
    CaseUnit, DocumentMeta, FileInfo, IndexedDocument, RawExtraction, VersionedSnapshot,
};
use crate::normalize::{NormalizeError, Normalizer};

/// Prefix of the per-file error marker.
pub const FILE_ERROR_PREFIX: &str = "read_or_parse_error";

/// Extraction result for one versioned snapshot.
#[derive(Debug, Clone)]
pub struct ParsedSnapshot {
    pub snapshot: VersionedSnapshot,
    pub tables: RawExtraction,
    /// Set when the file could not be read or parsed; `tables` is then empty.
    pub error: Option<String>,
}

impl ParsedSnapshot {
    pub fn extracted(snapshot: VersionedSnapshot, tables: RawExtraction) -> Self {
        Self {
            snapshot,
            tables,
            error: None,
        }
    }

    pub fn failed(snapshot: VersionedSnapshot, reason: impl std::fmt::Display) -> Self {
        Self {
            snapshot,
            tables: RawExtraction::new(),
            error: Some(format!("{}: {}", FILE_ERROR_PREFIX, reason)),
        }
    }
}

/// The normalizer input for one snapshot.
pub fn combined_raw(unit: &CaseUnit, parsed: &ParsedSnapshot, html_files: &[String]) -> Value {
    let mut raw = match serde_json::to_value(&unit.manifest) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let snap = &parsed.snapshot;
    raw.insert(
        "raw_tables".into(),
        serde_json::to_value(&parsed.tables).unwrap_or_else(|_| Value::Object(Map::new())),
    );
    raw.insert("path_manifest".into(), Value::from(unit.manifest_path.as_str()));
    raw.insert("rel_dir".into(), Value::from(unit.rel_dir.as_str()));
    raw.insert("html_file".into(), Value::from(snap.file.as_str()));
    raw.insert("html_files".into(), Value::from(html_files.to_vec()));
    raw.insert("version".into(), Value::from(snap.version));
    raw.insert(
        "version_ts".into(),
        snap.version_ts.clone().map(Value::from).unwrap_or(Value::Null),
    );
    raw.insert("is_latest".into(), Value::Bool(snap.is_latest));
    if let Some(err) = &parsed.error {
        raw.insert("file_error".into(), Value::from(err.as_str()));
    }
    Value::Object(raw)
}

/// Normalize every snapshot of `unit`. `parsed` is expected in version
/// order; the output keeps that order.
pub fn prepare_case(
    normalizer: &Normalizer,
    unit: &CaseUnit,
    parsed: &[ParsedSnapshot],
    tag: Option<&str>,
) -> Result<Vec<IndexedDocument>, NormalizeError> {
    let html_files: Vec<String> = parsed.iter().map(|p| p.snapshot.file.clone()).collect();

    parsed
        .iter()
        .map(|p| {
            let raw = combined_raw(unit, p, &html_files);
            let fields = normalizer.normalize(&raw)?;
            let snap = &p.snapshot;
            Ok(IndexedDocument {
                fields,
                group_id: unit.group_id.clone(),
                version: snap.version,
                version_ts: snap.version_ts.clone(),
                is_latest: snap.is_latest,
                meta: DocumentMeta {
                    path_manifest: unit.manifest_path.clone(),
                    rel_dir: unit.rel_dir.clone(),
                    html_file: snap.file.clone(),
                    html_files: html_files.clone(),
                    version: snap.version,
                    version_ts: snap.version_ts.clone(),
                    error: p.error.clone(),
                },
                files: vec![FileInfo {
                    name: snap.file.clone(),
                    collected_at: snap.version_ts.clone(),
                    error: p.error.clone(),
                }],
                html_file: snap.file.clone(),
                tag: tag.map(str::to_string),
            })
        })
        .collect()
}
