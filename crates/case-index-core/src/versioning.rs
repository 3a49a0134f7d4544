//! Snapshot ordering and calendar bucketing.
//!
//! Snapshot files are named after their capture time, `DD-MM-YYYY.HH:MM:SS`
//! followed by anything (usually `.html`). Files are ranked by that
//! timestamp; files without a parseable one go last, ordered by name.

use std::cmp::Ordering;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::models::VersionedSnapshot;

/// Default number of leading path segments in a bucket key
/// (`year/month/day`).
pub const DEFAULT_BUCKET_DEPTH: usize = 3;

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{2})-(\d{2})-(\d{4})\.(\d{2}):(\d{2}):(\d{2})")
            .expect("valid snapshot filename pattern")
    })
}

/// Capture time encoded in a snapshot file name.
pub fn parse_snapshot_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let caps = filename_re().captures(name)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let date = NaiveDate::from_ymd_opt(num(3)? as i32, num(2)?, num(1)?)?;
    let naive = date.and_hms_opt(num(4)?, num(5)?, num(6)?)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// `2020-01-31T10:00:00.000Z`
pub fn format_version_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn compare_snapshots(
    a: &(String, Option<DateTime<Utc>>),
    b: &(String, Option<DateTime<Utc>>),
) -> Ordering {
    match (&a.1, &b.1) {
        (Some(x), Some(y)) => x.cmp(y).then_with(|| a.0.cmp(&b.0)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.0.cmp(&b.0),
    }
}

/// Order the snapshots of one case and assign versions.
///
/// `fallback_date` (a `YYYY-MM-DD` registration date) supplies the version
/// timestamp, at midnight UTC, for files whose name carries none.
pub fn resolve_versions<S: AsRef<str>>(
    files: &[S],
    fallback_date: Option<&str>,
) -> Vec<VersionedSnapshot> {
    let mut entries: Vec<(String, Option<DateTime<Utc>>)> = files
        .iter()
        .map(|f| {
            let name = f.as_ref().to_string();
            let ts = parse_snapshot_timestamp(&name);
            (name, ts)
        })
        .collect();
    entries.sort_by(compare_snapshots);

    let fallback_ts = fallback_date
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive: NaiveDateTime| Utc.from_utc_datetime(&naive));

    let last = entries.len().saturating_sub(1);
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, (file, ts))| VersionedSnapshot {
            file,
            version: idx as u32 + 1,
            version_ts: ts.or(fallback_ts).as_ref().map(format_version_ts),
            is_latest: idx == last,
        })
        .collect()
}

/// Calendar partition of a case: the first `depth` segments of its
/// directory relative to the ingestion root.
pub fn bucket_key(rel_dir: &str, depth: usize) -> String {
    rel_dir
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .take(depth)
        .collect::<Vec<_>>()
        .join("/")
}
