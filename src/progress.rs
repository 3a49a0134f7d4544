//! Import progress reporting.
//!
//! Reports observable progress during `cidx import` so users see how many
//! cases have been read and how many documents have reached the index.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::str::FromStr;

use anyhow::{bail, Result};

/// A single progress event for an import run.
#[derive(Clone, Debug)]
pub enum ImportProgressEvent {
    /// Walking the ingestion root; totals unknown.
    Discovering { root: String },
    /// `units` cases read so far, `docs_indexed` documents written.
    Importing {
        units: u64,
        docs_prepared: u64,
        docs_indexed: u64,
    },
}

/// Reports import progress. Implementations write to stderr (human or JSON).
pub trait ImportProgressReporter: Send + Sync {
    fn report(&self, event: ImportProgressEvent);
}

/// Human-friendly progress on stderr: "import  1,234 cases  5,000 prepared  4,000 indexed".
pub struct StderrProgress;

impl ImportProgressReporter for StderrProgress {
    fn report(&self, event: ImportProgressEvent) {
        let line = match &event {
            ImportProgressEvent::Discovering { root } => {
                format!("import {}  discovering...\n", root)
            }
            ImportProgressEvent::Importing {
                units,
                docs_prepared,
                docs_indexed,
            } => format!(
                "import  {} cases  {} prepared  {} indexed\n",
                group_digits(*units),
                group_digits(*docs_prepared),
                group_digits(*docs_indexed)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ImportProgressReporter for JsonProgress {
    fn report(&self, event: ImportProgressEvent) {
        let obj = match &event {
            ImportProgressEvent::Discovering { root } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "root": root
            }),
            ImportProgressEvent::Importing {
                units,
                docs_prepared,
                docs_indexed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "importing",
                "units": units,
                "docs_prepared": docs_prepared,
                "docs_indexed": docs_indexed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ImportProgressReporter for NoProgress {
    fn report(&self, _event: ImportProgressEvent) {}
}

/// Digits grouped in threes with commas: `1234567` → `1,234,567`.
fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let groups: Vec<&str> = digits
        .as_bytes()
        .rchunks(3)
        .rev()
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();
    groups.join(",")
}

/// Where `cidx import` sends progress events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl FromStr for ProgressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => bail!("Unknown progress mode: '{}'. Must be human, json, or off.", other),
        }
    }
}

impl ProgressMode {
    /// The requested mode, or human output when stderr is a terminal and
    /// nothing when it is redirected.
    pub fn resolve(requested: Option<&str>) -> Result<Self> {
        match requested {
            Some(s) => s.parse(),
            None if atty::is(atty::Stream::Stderr) => Ok(ProgressMode::Human),
            None => Ok(ProgressMode::Off),
        }
    }

    pub fn reporter(self) -> Box<dyn ImportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
