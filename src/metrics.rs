//! Run counters and timers.
//!
//! A [`Metrics`] is shared by every pipeline stage through an `Arc`; all
//! fields are relaxed atomics. [`Metrics::spawn_logger`] emits a one-line
//! summary every few seconds and the full [`MetricsSnapshot`] is printed at
//! the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Counter {
    UnitsSeen,
    HtmlFilesSeen,
    DocsPrepared,
    DocsIndexed,
    BulkCalls,
    BulkDocsTotal,
    BulkFailedDocs,
    ParseErrors,
    IndexErrors,
    ManifestsSkipped,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timer {
    Parse,
    Bulk,
}

pub struct Metrics {
    started: Instant,
    counters: [AtomicU64; 10],
    timers_ms: [AtomicU64; 2],
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub elapsed_secs: f64,
    pub units_seen: u64,
    pub html_files_seen: u64,
    pub docs_prepared: u64,
    pub docs_indexed: u64,
    pub bulk_calls: u64,
    pub bulk_docs_total: u64,
    pub bulk_failed_docs: u64,
    pub parse_errors: u64,
    pub index_errors: u64,
    pub manifests_skipped: u64,
    pub parse_ms: u64,
    pub bulk_ms: u64,
    pub avg_bulk_size: f64,
    pub docs_per_sec: f64,
    pub units_per_sec: f64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Default::default(),
            timers_ms: Default::default(),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn add_time(&self, timer: Timer, elapsed: Duration) {
        self.timers_ms[timer as usize].fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed_secs = self.started.elapsed().as_secs_f64().max(0.001);
        let c = |counter| self.get(counter);
        let bulk_calls = c(Counter::BulkCalls);
        let bulk_docs_total = c(Counter::BulkDocsTotal);
        MetricsSnapshot {
            elapsed_secs,
            units_seen: c(Counter::UnitsSeen),
            html_files_seen: c(Counter::HtmlFilesSeen),
            docs_prepared: c(Counter::DocsPrepared),
            docs_indexed: c(Counter::DocsIndexed),
            bulk_calls,
            bulk_docs_total,
            bulk_failed_docs: c(Counter::BulkFailedDocs),
            parse_errors: c(Counter::ParseErrors),
            index_errors: c(Counter::IndexErrors),
            manifests_skipped: c(Counter::ManifestsSkipped),
            parse_ms: self.timers_ms[Timer::Parse as usize].load(Ordering::Relaxed),
            bulk_ms: self.timers_ms[Timer::Bulk as usize].load(Ordering::Relaxed),
            avg_bulk_size: if bulk_calls > 0 {
                bulk_docs_total as f64 / bulk_calls as f64
            } else {
                0.0
            },
            docs_per_sec: c(Counter::DocsIndexed) as f64 / elapsed_secs,
            units_per_sec: c(Counter::UnitsSeen) as f64 / elapsed_secs,
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        tracing::info!(
            time_s = %format!("{:.1}", s.elapsed_secs),
            units = s.units_seen,
            html = s.html_files_seen,
            docs_prepared = s.docs_prepared,
            docs_indexed = s.docs_indexed,
            avg_bulk_size = %format!("{:.1}", s.avg_bulk_size),
            bulk_calls = s.bulk_calls,
            bulk_failed_docs = s.bulk_failed_docs,
            docs_per_sec = %format!("{:.1}", s.docs_per_sec),
            parse_ms = s.parse_ms,
            bulk_ms = s.bulk_ms,
            "progress"
        );
    }

    /// Log every `every` until the returned handle is aborted.
    pub fn spawn_logger(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                metrics.log();
            }
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// Final report, one `key: value` line per counter.
    pub fn print_report(&self) {
        println!("Import summary:");
        println!("  elapsed:           {:.1}s", self.elapsed_secs);
        println!("  units seen:        {}", self.units_seen);
        println!("  manifests skipped: {}", self.manifests_skipped);
        println!("  html files seen:   {}", self.html_files_seen);
        println!("  parse errors:      {}", self.parse_errors);
        println!("  docs prepared:     {}", self.docs_prepared);
        println!("  docs indexed:      {}", self.docs_indexed);
        println!("  bulk calls:        {}", self.bulk_calls);
        println!("  bulk docs total:   {}", self.bulk_docs_total);
        println!("  bulk failed docs:  {}", self.bulk_failed_docs);
        println!("  index errors:      {}", self.index_errors);
        println!("  avg bulk size:     {:.1}", self.avg_bulk_size);
        println!("  rate docs/s:       {:.1}", self.docs_per_sec);
        println!("  rate units/s:      {:.2}", self.units_per_sec);
        println!("  parse ms:          {}", self.parse_ms);
        println!("  bulk ms:           {}", self.bulk_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_derived_rates() {
        let m = Metrics::new();
        m.add(Counter::BulkCalls, 2);
        m.add(Counter::BulkDocsTotal, 5);
        m.inc(Counter::UnitsSeen);
        m.add_time(Timer::Bulk, Duration::from_millis(40));
        m.add_time(Timer::Bulk, Duration::from_millis(2));

        let s = m.snapshot();
        assert_eq!(s.bulk_calls, 2);
        assert_eq!(s.units_seen, 1);
        assert_eq!(s.bulk_ms, 42);
        assert!((s.avg_bulk_size - 2.5).abs() < f64::EPSILON);
        assert_eq!(s.docs_indexed, 0);
    }

    #[test]
    fn avg_bulk_size_without_calls_is_zero() {
        assert_eq!(Metrics::new().snapshot().avg_bulk_size, 0.0);
    }
}
