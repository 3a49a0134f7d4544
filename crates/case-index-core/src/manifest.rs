//! Reading `manifest.json` payloads into [`ManifestFields`].

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::models::ManifestFields;

/// Manifest file name that marks a case directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Identifier keys in precedence order.
const GROUP_ID_KEYS: [&str; 3] = ["hashed_id", "ID", "id_final"];

fn manifest_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2})\.(\d{2})\.(\d{4})$").expect("valid manifest date pattern"))
}

/// `DD.MM.YYYY` becomes `YYYY-MM-DD`; anything else passes through.
pub fn normalize_manifest_date(s: &str) -> String {
    match manifest_date_re().captures(s) {
        Some(c) => format!("{}-{}-{}", &c[3], &c[2], &c[1]),
        None => s.to_string(),
    }
}

fn scalar_string(manifest: &Value, key: &str) -> Option<String> {
    match manifest.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn manifest_fields(manifest: &Value) -> ManifestFields {
    ManifestFields {
        case_number: scalar_string(manifest, "case_number"),
        date_reg: scalar_string(manifest, "date_reg").map(|d| normalize_manifest_date(&d)),
        link: scalar_string(manifest, "link"),
        instance: scalar_string(manifest, "instance"),
        case_type: scalar_string(manifest, "case_type"),
        court_code: scalar_string(manifest, "court_id"),
        court_name: scalar_string(manifest, "court_name"),
        region: scalar_string(manifest, "region"),
        type_instance: scalar_string(manifest, "type_instance"),
    }
}

/// Stable case identifier: the first non-blank of `hashed_id`, `ID`,
/// `id_final`, else the case directory relative to the root.
pub fn resolve_group_id(manifest: &Value, rel_dir: &str) -> String {
    GROUP_ID_KEYS
        .iter()
        .filter_map(|k| scalar_string(manifest, k))
        .find(|s| !s.trim().is_empty())
        .unwrap_or_else(|| rel_dir.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_dates_are_normalized() {
        assert_eq!(normalize_manifest_date("31.01.2020"), "2020-01-31");
        assert_eq!(normalize_manifest_date("2020-01-31"), "2020-01-31");
        assert_eq!(normalize_manifest_date("31.1.2020"), "31.1.2020");
    }

    #[test]
    fn fields_are_read_and_renamed() {
        let m = json!({
            "case_number": "2-15/2020",
            "date_reg": "14.02.2020",
            "court_id": 7701,
            "court_name": "Тверской районный суд",
            "region": "77",
            "extra": {"ignored": true}
        });
        let f = manifest_fields(&m);
        assert_eq!(f.case_number.as_deref(), Some("2-15/2020"));
        assert_eq!(f.date_reg.as_deref(), Some("2020-02-14"));
        assert_eq!(f.court_code.as_deref(), Some("7701"));
        assert_eq!(f.link, None);
    }

    #[test]
    fn group_id_precedence() {
        let m = json!({"hashed_id": "h", "ID": "i", "id_final": "f"});
        assert_eq!(resolve_group_id(&m, "2020/01/01/x"), "h");
        let m = json!({"hashed_id": "  ", "ID": 42, "id_final": "f"});
        assert_eq!(resolve_group_id(&m, "2020/01/01/x"), "42");
        let m = json!({"id_final": "f"});
        assert_eq!(resolve_group_id(&m, "2020/01/01/x"), "f");
        assert_eq!(resolve_group_id(&json!({}), "2020/01/01/x"), "2020/01/01/x");
    }
}
