//! # Case Index CLI (`cidx`)
//!
//! The `cidx` binary imports scraped court-case directories into an
//! Elasticsearch index and offers offline commands for inspecting what the
//! pipeline would produce.
//!
//! ## Usage
//!
//! ```bash
//! cidx --config ./config/cidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cidx import` | Walk the ingestion root and deliver every case to the index |
//! | `cidx extract <file.html>` | Print the raw table extraction of one snapshot |
//! | `cidx prepare <case-dir>` | Print the documents of one case without delivering them |
//! | `cidx rules` | Print the loaded normalization rules |
//!
//! ## Examples
//!
//! ```bash
//! # Full import with a run tag and JSON progress
//! cidx import --tag 2024-05-backfill --progress json
//!
//! # Override index and root from the command line
//! cidx import --index cases-v2 --root /data/sud
//!
//! # Inspect one case offline
//! cidx prepare /data/sud/2020/01/31/2-15-2020
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use case_index::config::{self, Config};
use case_index::elastic::ElasticBackend;
use case_index::ingest::{self, ImportOptions};
use case_index::metrics::Metrics;
use case_index::progress::ProgressMode;
use case_index_core::extract::extract;
use case_index_core::normalize::Normalizer;

/// Case Index CLI: court-case HTML ingestion into a search index.
///
/// `import` reads the `--config` TOML file; `extract`, `prepare` and
/// `rules` use it only for rule overrides and work without one.
#[derive(Parser)]
#[command(
    name = "cidx",
    about = "Case Index: extract, normalize and index scraped court-case pages",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cidx.toml`. See `config/cidx.example.toml`.
    #[arg(long, global = true, default_value = "./config/cidx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: traverse, extract, normalize, deliver.
    ///
    /// Prints the run counters on completion. Any fatal error (rule
    /// defect, exhausted backend retries) stops the run with a non-zero
    /// exit status after the counters are printed.
    Import {
        /// Target index (overrides `backend.index`).
        #[arg(long)]
        index: Option<String>,

        /// Ingestion root (overrides `ingest.root`).
        #[arg(long)]
        root: Option<PathBuf>,

        /// Tag attached to every document (overrides `ingest.tag`).
        #[arg(long)]
        tag: Option<String>,

        /// Progress output on stderr: `human`, `json` or `off`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Print the raw table extraction of one HTML snapshot as JSON.
    Extract {
        /// Path to the HTML file.
        file: PathBuf,
    },

    /// Print the documents one case directory would produce, as JSON.
    Prepare {
        /// Directory containing `manifest.json` and the HTML snapshots.
        dir: PathBuf,

        /// Ingestion root used for the relative path and bucket
        /// (default: the directory's parent).
        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// List the normalization rules in effect.
    Rules,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Rules from the config file when one exists, else the built-in set.
fn offline_normalizer(config_path: &Path) -> Result<Normalizer> {
    if config_path.exists() {
        let cfg = config::load_config(config_path)?;
        ingest::load_normalizer(&cfg)
    } else {
        Normalizer::builtin().context("Failed to load built-in rules")
    }
}

async fn cmd_import(
    mut cfg: Config,
    index: Option<String>,
    root: Option<PathBuf>,
    tag: Option<String>,
    progress: Option<String>,
) -> Result<()> {
    if let Some(index) = index {
        cfg.backend.index = index;
    }
    if let Some(root) = root {
        cfg.ingest.root = root;
    }
    if tag.is_some() {
        cfg.ingest.tag = tag;
    }
    config::validate(&cfg)?;

    let reporter = ProgressMode::resolve(progress.as_deref())?.reporter();

    let normalizer = Arc::new(ingest::load_normalizer(&cfg)?);
    let backend = Arc::new(ElasticBackend::new(&cfg.backend)?);
    let metrics = Arc::new(Metrics::new());
    let opts = ImportOptions::from_config(&cfg);

    let result =
        ingest::run_import(&opts, normalizer, backend, Arc::clone(&metrics), reporter.as_ref()).await;

    metrics.snapshot().print_report();
    match result {
        Ok(_) => {
            println!("ok");
            Ok(())
        }
        Err(e) => Err(e.context("import aborted")),
    }
}

fn cmd_extract(file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let tables = extract(&String::from_utf8_lossy(&bytes));
    println!("{}", serde_json::to_string_pretty(&tables)?);
    Ok(())
}

fn cmd_prepare(config_path: &Path, dir: &Path, root: Option<PathBuf>, tag: Option<String>) -> Result<()> {
    let normalizer = offline_normalizer(config_path)?;
    let root = root
        .or_else(|| dir.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| dir.to_path_buf());
    let docs = ingest::prepare_dir(&normalizer, &root, dir, tag.as_deref())?;
    let out: Vec<serde_json::Value> = docs
        .iter()
        .map(|d| serde_json::json!({ "_id": d.document_id(), "doc": d.to_json() }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_rules(config_path: &Path) -> Result<()> {
    let normalizer = offline_normalizer(config_path)?;
    for line in ingest::describe_rules(normalizer.rules()) {
        println!("{}", line);
    }
    println!("type instances: {}", normalizer.rules().type_instances.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Import {
            index,
            root,
            tag,
            progress,
        } => {
            let cfg = config::load_config(&cli.config)?;
            cmd_import(cfg, index, root, tag, progress).await?;
        }
        Commands::Extract { file } => cmd_extract(&file)?,
        Commands::Prepare { dir, root, tag } => cmd_prepare(&cli.config, &dir, root, tag)?,
        Commands::Rules => cmd_rules(&cli.config)?,
    }

    Ok(())
}
