//! Import pipeline orchestration.
//!
//! Coordinates the full import flow: traversal → per-case extraction and
//! normalization → bucketed delivery.
//!
//! Concurrency is bounded at three levels:
//!
//! - `workers` cases are processed at once;
//! - within a case, `files_per_unit` snapshots are read and extracted at once
//!   (on the blocking pool);
//! - at most `workers × backpressure_multiplier` cases may be admitted but
//!   not yet fully delivered. Admission waits on a semaphore whose permit
//!   travels with the case's documents and is released after their batch is
//!   written.
//!
//! A failing snapshot becomes an error marker on its document. A
//! normalization error or a fatal delivery error stops admission; queued
//! work is drained and the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use case_index_core::backend::IndexBackend;
use case_index_core::document::{prepare_case, ParsedSnapshot};
use case_index_core::extract::TableExtractor;
use case_index_core::models::{CaseUnit, IndexedDocument, VersionedSnapshot};
use case_index_core::normalize::Normalizer;
use case_index_core::rules::{RuleSet, DEFAULT_TYPE_INSTANCES};
use case_index_core::versioning::{bucket_key, resolve_versions};

use crate::config::Config;
use crate::delivery::{
    Delivery, DeliveryHandle, DeliveryOptions, DeliveryStopped, PendingDoc, UnitTicket,
};
use crate::metrics::{Counter, Metrics, MetricsSnapshot, Timer};
use crate::progress::{ImportProgressEvent, ImportProgressReporter};
use crate::traverse::{load_case_dir, spawn_traversal, Discovered};

const PROGRESS_EVERY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub root: PathBuf,
    pub exclude_globs: Vec<String>,
    pub workers: usize,
    pub files_per_unit: usize,
    pub backpressure_multiplier: usize,
    pub bucket_depth: usize,
    pub tag: Option<String>,
    pub delivery: DeliveryOptions,
    pub log_every: Duration,
}

impl ImportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.ingest.root.clone(),
            exclude_globs: config.ingest.exclude_globs.clone(),
            workers: config.ingest.workers.max(1),
            files_per_unit: config.ingest.files_per_unit.max(1),
            backpressure_multiplier: config.ingest.backpressure_multiplier.max(1),
            bucket_depth: config.ingest.bucket_depth,
            tag: config.ingest.tag.clone(),
            delivery: DeliveryOptions::from_config(&config.backend.index, &config.delivery),
            log_every: Duration::from_secs(config.metrics.log_every_secs.max(1)),
        }
    }
}

/// Build the normalizer from the configured rule files, or the built-in set.
pub fn load_normalizer(config: &Config) -> Result<Normalizer> {
    let Some(rules_path) = &config.rules.path else {
        return Normalizer::builtin().context("Failed to load built-in rules");
    };
    let rules = std::fs::read_to_string(rules_path)
        .with_context(|| format!("Failed to read rules file: {}", rules_path.display()))?;
    let type_instances = match &config.rules.type_instance_path {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("Failed to read type instance file: {}", p.display()))?,
        None => DEFAULT_TYPE_INSTANCES.to_string(),
    };
    Normalizer::from_json(&rules, &type_instances)
        .with_context(|| format!("Invalid rules file: {}", rules_path.display()))
}

/// Shared state of the per-case tasks.
struct UnitContext {
    normalizer: Arc<Normalizer>,
    extractor: Arc<TableExtractor>,
    metrics: Arc<Metrics>,
    delivery: DeliveryHandle,
    files_per_unit: usize,
    bucket_depth: usize,
    tag: Option<String>,
}

pub async fn run_import(
    opts: &ImportOptions,
    normalizer: Arc<Normalizer>,
    backend: Arc<dyn IndexBackend>,
    metrics: Arc<Metrics>,
    progress: &dyn ImportProgressReporter,
) -> Result<MetricsSnapshot> {
    progress.report(ImportProgressEvent::Discovering {
        root: opts.root.display().to_string(),
    });
    tracing::info!(root = %opts.root.display(), index = %opts.delivery.index, "import started");

    let logger = metrics.spawn_logger(opts.log_every);
    let delivery = Delivery::spawn(backend, opts.delivery.clone(), Arc::clone(&metrics));
    let ctx = Arc::new(UnitContext {
        normalizer,
        extractor: Arc::new(TableExtractor::new()),
        metrics: Arc::clone(&metrics),
        delivery: delivery.handle(),
        files_per_unit: opts.files_per_unit,
        bucket_depth: opts.bucket_depth,
        tag: opts.tag.clone(),
    });

    let admission = Arc::new(Semaphore::new(opts.workers * opts.backpressure_multiplier));
    let workers = Arc::new(Semaphore::new(opts.workers));
    let (mut units_rx, walker) =
        spawn_traversal(opts.root.clone(), opts.exclude_globs.clone(), opts.workers * 2);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let mut first_error: Option<anyhow::Error> = None;
    let mut last_report = Instant::now();

    while let Some(found) = units_rx.recv().await {
        let unit = match found {
            Discovered::Unit(u) => u,
            Discovered::Skipped { manifest, reason } => {
                tracing::warn!(manifest = %manifest.display(), %reason, "skipping case directory");
                metrics.inc(Counter::ManifestsSkipped);
                continue;
            }
        };

        while let Some(joined) = tasks.try_join_next() {
            record_outcome(joined, &mut first_error);
        }
        if first_error.is_some() || ctx.delivery.has_failed() {
            break;
        }

        let ticket: UnitTicket = Arc::new(
            Arc::clone(&admission)
                .acquire_owned()
                .await
                .context("admission semaphore closed")?,
        );
        let worker = Arc::clone(&workers)
            .acquire_owned()
            .await
            .context("worker semaphore closed")?;

        let ctx = Arc::clone(&ctx);
        tasks.spawn(async move {
            let result = process_unit(&ctx, unit, ticket).await;
            drop(worker);
            result
        });

        if last_report.elapsed() >= PROGRESS_EVERY {
            last_report = Instant::now();
            report_progress(progress, &metrics);
        }
    }
    drop(units_rx);

    while let Some(joined) = tasks.join_next().await {
        record_outcome(joined, &mut first_error);
    }

    match walker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            first_error.get_or_insert(e);
        }
        Err(e) => {
            first_error.get_or_insert(anyhow::Error::new(e).context("traversal task panicked"));
        }
    }

    drop(ctx);
    if let Err(e) = delivery.shutdown().await {
        first_error.get_or_insert(e);
    }
    logger.abort();
    report_progress(progress, &metrics);

    match first_error {
        Some(e) => Err(e),
        None => {
            metrics.log();
            tracing::info!("import finished");
            Ok(metrics.snapshot())
        }
    }
}

fn record_outcome(
    joined: Result<Result<()>, tokio::task::JoinError>,
    first_error: &mut Option<anyhow::Error>,
) {
    let err = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) => anyhow::Error::new(e).context("case task panicked"),
    };
    // The flush failure itself comes back from `Delivery::shutdown`.
    if err.downcast_ref::<DeliveryStopped>().is_some() {
        tracing::debug!("case dropped after delivery stopped");
        return;
    }
    tracing::error!(error = %format!("{:#}", err), "case processing failed");
    first_error.get_or_insert(err);
}

fn report_progress(progress: &dyn ImportProgressReporter, metrics: &Metrics) {
    progress.report(ImportProgressEvent::Importing {
        units: metrics.get(Counter::UnitsSeen),
        docs_prepared: metrics.get(Counter::DocsPrepared),
        docs_indexed: metrics.get(Counter::DocsIndexed),
    });
}

async fn process_unit(ctx: &UnitContext, unit: CaseUnit, ticket: UnitTicket) -> Result<()> {
    ctx.metrics.inc(Counter::UnitsSeen);

    let snapshots = resolve_versions(&unit.html_files, unit.manifest.date_reg.as_deref());
    ctx.metrics.add(Counter::HtmlFilesSeen, snapshots.len() as u64);
    if snapshots.is_empty() {
        tracing::debug!(rel_dir = %unit.rel_dir, "case has no snapshots");
        return Ok(());
    }

    let dir = case_dir(&unit);
    let parsed = parse_snapshots(ctx, &dir, snapshots).await?;

    let normalizer = Arc::clone(&ctx.normalizer);
    let tag = ctx.tag.clone();
    let (unit, docs) = tokio::task::spawn_blocking(move || {
        let docs = prepare_case(&normalizer, &unit, &parsed, tag.as_deref());
        (unit, docs)
    })
    .await
    .context("normalization task panicked")?;
    let docs = docs.with_context(|| format!("Failed to normalize case {}", unit.rel_dir))?;
    ctx.metrics.add(Counter::DocsPrepared, docs.len() as u64);

    let bucket = bucket_key(&unit.rel_dir, ctx.bucket_depth);
    for doc in &docs {
        ctx.delivery
            .push(bucket.clone(), PendingDoc::new(doc, Some(Arc::clone(&ticket))))
            .await?;
    }
    Ok(())
}

fn case_dir(unit: &CaseUnit) -> PathBuf {
    Path::new(&unit.manifest_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Read and extract one snapshot file. IO failures become an error marker.
pub fn parse_snapshot_file(
    extractor: &TableExtractor,
    dir: &Path,
    snapshot: VersionedSnapshot,
) -> ParsedSnapshot {
    match std::fs::read(dir.join(&snapshot.file)) {
        Ok(bytes) => {
            let html = String::from_utf8_lossy(&bytes);
            let tables = extractor.extract(&html);
            ParsedSnapshot::extracted(snapshot, tables)
        }
        Err(e) => ParsedSnapshot::failed(snapshot, e),
    }
}

/// Extract the snapshots of one case, at most `files_per_unit` at a time.
/// The result keeps version order.
async fn parse_snapshots(
    ctx: &UnitContext,
    dir: &Path,
    snapshots: Vec<VersionedSnapshot>,
) -> Result<Vec<ParsedSnapshot>> {
    let limit = Arc::new(Semaphore::new(ctx.files_per_unit));
    let mut set = JoinSet::new();

    for (idx, snapshot) in snapshots.into_iter().enumerate() {
        let permit = Arc::clone(&limit)
            .acquire_owned()
            .await
            .context("file semaphore closed")?;
        let extractor = Arc::clone(&ctx.extractor);
        let dir = dir.to_path_buf();
        set.spawn_blocking(move || {
            let started = Instant::now();
            let parsed = parse_snapshot_file(&extractor, &dir, snapshot);
            drop(permit);
            (idx, parsed, started.elapsed())
        });
    }

    let mut out = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        let (idx, parsed, elapsed) = joined.context("extraction task panicked")?;
        ctx.metrics.add_time(Timer::Parse, elapsed);
        if let Some(err) = &parsed.error {
            ctx.metrics.inc(Counter::ParseErrors);
            tracing::warn!(dir = %dir.display(), file = %parsed.snapshot.file, error = %err, "snapshot unreadable");
        }
        out.push((idx, parsed));
    }
    out.sort_by_key(|(idx, _)| *idx);
    Ok(out.into_iter().map(|(_, p)| p).collect())
}

/// Documents of one case directory, without delivery. `root` is the
/// ingestion root the directory is resolved against.
pub fn prepare_dir(
    normalizer: &Normalizer,
    root: &Path,
    dir: &Path,
    tag: Option<&str>,
) -> Result<Vec<IndexedDocument>> {
    let unit = match load_case_dir(root, dir)? {
        Discovered::Unit(u) => u,
        Discovered::Skipped { manifest, reason } => {
            bail!("Invalid manifest {}: {}", manifest.display(), reason)
        }
    };
    let extractor = TableExtractor::new();
    let parsed: Vec<ParsedSnapshot> =
        resolve_versions(&unit.html_files, unit.manifest.date_reg.as_deref())
            .into_iter()
            .map(|s| parse_snapshot_file(&extractor, dir, s))
            .collect();
    prepare_case(normalizer, &unit, &parsed, tag)
        .with_context(|| format!("Failed to normalize case {}", unit.rel_dir))
}

/// Rule set summary used by `cidx rules`.
pub fn describe_rules(rules: &RuleSet) -> Vec<String> {
    rules.fields.iter().map(|r| r.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use case_index_core::backend::memory::InMemoryBackend;
    use case_index_core::document::FILE_ERROR_PREFIX;
    use std::fs;

    const CARD: &str = "<table><tr><th colspan=2>ДЕЛО</th></tr>\
                        <tr><td>Номер дела</td><td>2-1/2020</td></tr></table>";

    fn snapshot(file: &str, version: u32) -> VersionedSnapshot {
        VersionedSnapshot {
            file: file.to_string(),
            version,
            version_ts: None,
            is_latest: false,
        }
    }

    #[test]
    fn missing_snapshot_becomes_error_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let parsed = parse_snapshot_file(&TableExtractor::new(), tmp.path(), snapshot("gone.html", 1));
        let err = parsed.error.expect("error marker");
        assert!(err.starts_with(&format!("{}: ", FILE_ERROR_PREFIX)), "{}", err);
        assert!(parsed.tables.is_empty());
        assert_eq!(parsed.snapshot.file, "gone.html");
    }

    #[test]
    fn invalid_utf8_is_still_extracted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bytes = CARD.as_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        fs::write(tmp.path().join("a.html"), bytes).unwrap();
        let parsed = parse_snapshot_file(&TableExtractor::new(), tmp.path(), snapshot("a.html", 1));
        assert!(parsed.error.is_none());
        assert!(parsed.tables.contains_key("ДЕЛО"));
    }

    #[tokio::test]
    async fn unreadable_snapshots_are_counted_and_keep_order() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("1.html"), CARD).unwrap();
        fs::write(tmp.path().join("3.html"), CARD).unwrap();

        let metrics = Arc::new(Metrics::new());
        let delivery = Delivery::spawn(
            Arc::new(InMemoryBackend::new()),
            DeliveryOptions {
                index: "i".into(),
                flush_docs: 10,
                idle_flush: Duration::from_secs(60),
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                invalidate_chunk: 10,
            },
            Arc::clone(&metrics),
        );
        let ctx = UnitContext {
            normalizer: Arc::new(Normalizer::builtin().unwrap()),
            extractor: Arc::new(TableExtractor::new()),
            metrics: Arc::clone(&metrics),
            delivery: delivery.handle(),
            files_per_unit: 1,
            bucket_depth: 3,
            tag: None,
        };

        let parsed = parse_snapshots(
            &ctx,
            tmp.path(),
            vec![snapshot("1.html", 1), snapshot("2.html", 2), snapshot("3.html", 3)],
        )
        .await
        .unwrap();

        let files: Vec<&str> = parsed.iter().map(|p| p.snapshot.file.as_str()).collect();
        assert_eq!(files, vec!["1.html", "2.html", "3.html"]);
        assert!(parsed[0].error.is_none());
        assert!(parsed[1].error.is_some());
        assert!(parsed[2].error.is_none());
        assert_eq!(metrics.get(Counter::ParseErrors), 1);

        drop(ctx);
        delivery.shutdown().await.unwrap();
    }
}
