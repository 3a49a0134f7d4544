use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted when `backend.api_key` is not set.
pub const API_KEY_ENV: &str = "CASE_INDEX_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_url")]
    pub url: String,
    pub index: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Accept invalid TLS certificates on `https://` endpoints.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub root: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_files_per_unit")]
    pub files_per_unit: usize,
    #[serde(default = "default_backpressure_multiplier")]
    pub backpressure_multiplier: usize,
    #[serde(default = "default_bucket_depth")]
    pub bucket_depth: usize,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_workers() -> usize {
    8
}
fn default_files_per_unit() -> usize {
    4
}
fn default_backpressure_multiplier() -> usize {
    4
}
fn default_bucket_depth() -> usize {
    case_index_core::versioning::DEFAULT_BUCKET_DEPTH
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default = "default_flush_docs")]
    pub flush_docs: usize,
    #[serde(default = "default_idle_flush_ms")]
    pub idle_flush_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_invalidate_chunk")]
    pub invalidate_chunk: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            flush_docs: default_flush_docs(),
            idle_flush_ms: default_idle_flush_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            invalidate_chunk: default_invalidate_chunk(),
        }
    }
}

fn default_flush_docs() -> usize {
    2000
}
fn default_idle_flush_ms() -> u64 {
    2000
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_invalidate_chunk() -> usize {
    800
}

/// Replacement rule files; the built-in set is used when unset.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RulesConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub type_instance_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_log_every_secs")]
    pub log_every_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_every_secs: default_log_every_secs(),
        }
    }
}

fn default_log_every_secs() -> u64 {
    5
}

impl BackendConfig {
    /// API key from the config file, else from [`API_KEY_ENV`].
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Checks shared by config loading and CLI overrides.
pub fn validate(config: &Config) -> Result<()> {
    if config.backend.index.trim().is_empty() {
        anyhow::bail!("backend.index must not be empty");
    }
    if !(config.backend.url.starts_with("http://") || config.backend.url.starts_with("https://")) {
        anyhow::bail!(
            "backend.url must start with http:// or https://, got '{}'",
            config.backend.url
        );
    }
    if config.backend.username.is_some() != config.backend.password.is_some() {
        anyhow::bail!("backend.username and backend.password must be set together");
    }
    if config.backend.timeout_secs == 0 {
        anyhow::bail!("backend.timeout_secs must be > 0");
    }

    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }
    if config.ingest.files_per_unit == 0 {
        anyhow::bail!("ingest.files_per_unit must be >= 1");
    }
    if config.ingest.backpressure_multiplier == 0 {
        anyhow::bail!("ingest.backpressure_multiplier must be >= 1");
    }
    if config.ingest.bucket_depth == 0 {
        anyhow::bail!("ingest.bucket_depth must be >= 1");
    }

    if config.delivery.flush_docs == 0 {
        anyhow::bail!("delivery.flush_docs must be >= 1");
    }
    if config.delivery.invalidate_chunk == 0 {
        anyhow::bail!("delivery.invalidate_chunk must be >= 1");
    }

    if config.rules.type_instance_path.is_some() && config.rules.path.is_none() {
        anyhow::bail!("rules.type_instance_path requires rules.path");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[backend]
index = "cases"

[ingest]
root = "/data/cases"
"#;

    #[test]
    fn defaults_fill_optional_sections() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.backend.url, "http://localhost:9200");
        assert_eq!(cfg.backend.timeout_secs, 120);
        assert_eq!(cfg.ingest.workers, 8);
        assert_eq!(cfg.ingest.files_per_unit, 4);
        assert_eq!(cfg.ingest.bucket_depth, 3);
        assert_eq!(cfg.delivery.flush_docs, 2000);
        assert_eq!(cfg.delivery.max_retries, 3);
        assert_eq!(cfg.delivery.base_delay_ms, 500);
        assert_eq!(cfg.delivery.invalidate_chunk, 800);
        assert_eq!(cfg.metrics.log_every_secs, 5);
        assert!(cfg.rules.path.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let bad_workers = format!("{}\nworkers = 0\n", MINIMAL);
        assert!(parse_config(&bad_workers)
            .unwrap_err()
            .to_string()
            .contains("ingest.workers"));

        let half_auth = MINIMAL.replace("index = \"cases\"", "index = \"cases\"\nusername = \"elastic\"");
        assert!(parse_config(&half_auth).is_err());

        let bad_url = MINIMAL.replace("index = \"cases\"", "index = \"cases\"\nurl = \"localhost:9200\"");
        assert!(parse_config(&bad_url).is_err());
    }

    #[test]
    fn missing_index_is_a_parse_error() {
        let err = parse_config("[backend]\n[ingest]\nroot = \"/x\"\n").unwrap_err();
        assert!(err.to_string().contains("parse"));
    }
}
