//! Bucketed, serialized delivery of documents to the index backend.
//!
//! # Structure
//!
//! ```text
//! producers ──Push──▶ router task ──FlushJob──▶ flush task ──▶ IndexBackend
//!                       ▲    │
//!                       │    └─ idle timer per bucket (sleep task)
//!                       └───────── IdleExpired(bucket, generation)
//! ```
//!
//! The router owns every bucket buffer, so no buffer is ever shared. A
//! bucket flushes when its buffer reaches `flush_docs` or when its idle
//! timer fires; either way the bucket leaves the map with its buffer before
//! the job is queued. The single flush task handles jobs one at a time, so
//! at most one bulk write is in flight.
//!
//! Per job the flush task clears `is_latest` for the batch's groups (in
//! chunks of `invalidate_chunk` ids) and then bulk-writes the batch. Both
//! calls are retried on transient errors with delays of
//! `base_delay * 2^attempt`, up to `max_retries` retries. Exhausted retries
//! or a non-transient error stop the pipeline: later pushes are refused and
//! queued jobs are dropped.
//!
//! Each document may carry a ticket (a semaphore permit shared by all
//! documents of one case); it is released once the document's batch has
//! been written or dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;

use case_index_core::backend::{BackendError, BulkItem, IndexBackend};
use case_index_core::models::IndexedDocument;

use crate::config::DeliveryConfig;
use crate::metrics::{Counter, Metrics, Timer};

const COMMAND_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub index: String,
    pub flush_docs: usize,
    pub idle_flush: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub invalidate_chunk: usize,
}

impl DeliveryOptions {
    pub fn from_config(index: &str, cfg: &DeliveryConfig) -> Self {
        Self {
            index: index.to_string(),
            flush_docs: cfg.flush_docs.max(1),
            idle_flush: Duration::from_millis(cfg.idle_flush_ms),
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            invalidate_chunk: cfg.invalidate_chunk.max(1),
        }
    }
}

/// Releases a unit's admission permit when the last of its documents is
/// dropped.
pub type UnitTicket = Arc<OwnedSemaphorePermit>;

/// A document waiting in a bucket.
#[derive(Debug)]
pub struct PendingDoc {
    pub group_id: String,
    pub item: BulkItem,
    ticket: Option<UnitTicket>,
}

impl PendingDoc {
    pub fn new(doc: &IndexedDocument, ticket: Option<UnitTicket>) -> Self {
        Self {
            group_id: doc.group_id.clone(),
            item: BulkItem {
                id: doc.document_id(),
                body: doc.to_json(),
            },
            ticket,
        }
    }
}

enum Command {
    Push { bucket: String, doc: PendingDoc },
    Drain { reply: oneshot::Sender<()> },
}

struct IdleExpired {
    bucket: String,
    generation: u64,
}

struct FlushJob {
    bucket: String,
    docs: Vec<PendingDoc>,
}

#[derive(Default)]
struct Bucket {
    buffer: Vec<PendingDoc>,
    timer: Option<JoinHandle<()>>,
    /// Generation of the armed timer; stale expiries are ignored.
    generation: u64,
}

impl Bucket {
    fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.abort();
        }
    }
}

/// Returned by [`DeliveryHandle::push`] once the pipeline no longer accepts
/// documents. The cause is the error returned by [`Delivery::shutdown`].
#[derive(Debug, Error)]
#[error("delivery has stopped")]
pub struct DeliveryStopped;

/// Cloneable producer side of the pipeline.
#[derive(Clone)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<Command>,
    failed: Arc<AtomicBool>,
}

impl DeliveryHandle {
    pub async fn push(&self, bucket: impl Into<String>, doc: PendingDoc) -> Result<()> {
        if self.has_failed() {
            return Err(DeliveryStopped.into());
        }
        self.tx
            .send(Command::Push {
                bucket: bucket.into(),
                doc,
            })
            .await
            .map_err(|_| DeliveryStopped.into())
    }

    /// True once a flush has failed fatally.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

pub struct Delivery {
    handle: DeliveryHandle,
    router: JoinHandle<Result<()>>,
}

impl Delivery {
    pub fn spawn(
        backend: Arc<dyn IndexBackend>,
        opts: DeliveryOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        let failed = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let flusher = tokio::spawn(run_flusher(
            backend,
            opts.clone(),
            metrics,
            Arc::clone(&failed),
            flush_rx,
        ));

        let router = Router {
            opts,
            buckets: BTreeMap::new(),
            flush_tx,
            next_generation: 0,
        };
        let router = tokio::spawn(router.run(cmd_rx, flusher));

        Self {
            handle: DeliveryHandle { tx: cmd_tx, failed },
            router,
        }
    }

    pub fn handle(&self) -> DeliveryHandle {
        self.handle.clone()
    }

    /// Cancel idle timers, flush every non-empty bucket once more and wait
    /// for all queued writes. Returns the first fatal flush error.
    pub async fn shutdown(self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self.handle.tx.send(Command::Drain { reply }).await.is_ok() {
            let _ = done.await;
        }
        drop(self.handle);
        self.router.await.context("delivery router panicked")?
    }
}

struct Router {
    opts: DeliveryOptions,
    buckets: BTreeMap<String, Bucket>,
    flush_tx: mpsc::UnboundedSender<FlushJob>,
    /// Unique across buckets, so an expiry from a removed bucket never
    /// matches its successor.
    next_generation: u64,
}

impl Router {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        flusher: JoinHandle<Result<()>>,
    ) -> Result<()> {
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<IdleExpired>();

        let reply = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Push { bucket, doc }) => self.push(bucket, doc, &timer_tx),
                    Some(Command::Drain { reply }) => break Some(reply),
                    None => break None,
                },
                Some(expired) = timer_rx.recv() => self.on_idle(expired),
            }
        };

        self.drain();
        drop(self.flush_tx);
        let result = flusher.await.context("flush task panicked")?;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
        result
    }

    fn push(&mut self, key: String, doc: PendingDoc, timer_tx: &mpsc::UnboundedSender<IdleExpired>) {
        let flush_docs = self.opts.flush_docs;
        let idle = self.opts.idle_flush;
        let bucket = self.buckets.entry(key.clone()).or_default();

        if bucket.buffer.is_empty() {
            self.next_generation += 1;
            let generation = self.next_generation;
            bucket.generation = generation;
            let tx = timer_tx.clone();
            let timer_key = key.clone();
            bucket.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                let _ = tx.send(IdleExpired {
                    bucket: timer_key,
                    generation,
                });
            }));
        }

        bucket.buffer.push(doc);
        if bucket.buffer.len() >= flush_docs {
            self.flush_bucket(key, "threshold flush");
        }
    }

    fn on_idle(&mut self, expired: IdleExpired) {
        let current = self
            .buckets
            .get(&expired.bucket)
            .is_some_and(|b| b.generation == expired.generation && !b.buffer.is_empty());
        if current {
            self.flush_bucket(expired.bucket, "idle flush");
        }
    }

    /// Take the bucket out of the map and queue its buffer. Buckets only
    /// exist while they hold documents.
    fn flush_bucket(&mut self, key: String, reason: &'static str) {
        let Some(mut bucket) = self.buckets.remove(&key) else {
            return;
        };
        bucket.cancel_timer();
        tracing::debug!(bucket = %key, docs = bucket.buffer.len(), reason, "bucket flush");
        self.enqueue(key, bucket.buffer);
    }

    fn drain(&mut self) {
        let buckets = std::mem::take(&mut self.buckets);
        for (key, mut bucket) in buckets {
            bucket.cancel_timer();
            if !bucket.buffer.is_empty() {
                tracing::debug!(bucket = %key, docs = bucket.buffer.len(), "drain flush");
                self.enqueue(key, bucket.buffer);
            }
        }
    }

    fn enqueue(&self, bucket: String, docs: Vec<PendingDoc>) {
        // Fails only after the flush task stopped on a fatal error; the
        // documents (and their tickets) are dropped.
        let _ = self.flush_tx.send(FlushJob { bucket, docs });
    }
}

async fn run_flusher(
    backend: Arc<dyn IndexBackend>,
    opts: DeliveryOptions,
    metrics: Arc<Metrics>,
    failed: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<FlushJob>,
) -> Result<()> {
    while let Some(job) = rx.recv().await {
        let docs = job.docs.len();
        if let Err(e) = flush_batch(backend.as_ref(), &opts, &metrics, &job).await {
            failed.store(true, Ordering::SeqCst);
            metrics.inc(Counter::IndexErrors);
            rx.close();
            while rx.try_recv().is_ok() {}
            return Err(e).with_context(|| {
                format!("Failed to deliver {} documents from bucket '{}'", docs, job.bucket)
            });
        }
    }
    Ok(())
}

async fn flush_batch(
    backend: &dyn IndexBackend,
    opts: &DeliveryOptions,
    metrics: &Metrics,
    job: &FlushJob,
) -> Result<()> {
    let groups: Vec<String> = job
        .docs
        .iter()
        .map(|d| d.group_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    for chunk in groups.chunks(opts.invalidate_chunk) {
        with_backoff(opts.max_retries, opts.base_delay, || {
            backend.clear_latest(&opts.index, chunk)
        })
        .await
        .context("clear_latest failed")?;
    }

    let items: Vec<BulkItem> = job.docs.iter().map(|d| d.item.clone()).collect();
    let started = Instant::now();
    let outcome = with_backoff(opts.max_retries, opts.base_delay, || {
        backend.bulk_index(&opts.index, &items)
    })
    .await
    .context("bulk write failed")?;
    metrics.add_time(Timer::Bulk, started.elapsed());

    metrics.inc(Counter::BulkCalls);
    metrics.add(Counter::BulkDocsTotal, items.len() as u64);
    metrics.add(Counter::DocsIndexed, outcome.indexed as u64);
    if outcome.rejected > 0 {
        metrics.add(Counter::BulkFailedDocs, outcome.rejected as u64);
        tracing::warn!(
            bucket = %job.bucket,
            rejected = outcome.rejected,
            errors = ?outcome.errors,
            "bulk write partially rejected"
        );
    }
    tracing::debug!(
        bucket = %job.bucket,
        docs = items.len(),
        groups = groups.len(),
        "bulk write done"
    );
    Ok(())
}

/// Run `op`, retrying transient failures after `base * 2^attempt`.
pub async fn with_backoff<T, F, Fut>(
    max_retries: u32,
    base: Duration,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = base.saturating_mul(2u32.saturating_pow(attempt));
                tracing::warn!(attempt = attempt + 1, ?delay, error = %e, "transient backend error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_from_base() {
        let start = tokio::time::Instant::now();
        let calls = Mutex::new(Vec::new());
        let result = with_backoff(3, Duration::from_millis(500), || {
            calls.lock().unwrap().push(start.elapsed());
            let n = calls.lock().unwrap().len();
            async move {
                if n <= 2 {
                    Err(BackendError::from_status(429, "busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        let calls = calls.into_inner().unwrap();
        assert_eq!(
            calls,
            vec![
                Duration::ZERO,
                Duration::from_millis(500),
                Duration::from_millis(1500)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_gives_up_after_max_retries() {
        let mut attempts = 0;
        let result: Result<(), _> = with_backoff(2, Duration::from_millis(10), || {
            attempts += 1;
            async { Err(BackendError::from_status(503, "overloaded")) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 3);
    }

    fn pending(group: &str, version: u32) -> PendingDoc {
        PendingDoc {
            group_id: group.to_string(),
            item: BulkItem {
                id: format!("{}::{}", group, version),
                body: serde_json::json!({ "group_id": group }),
            },
            ticket: None,
        }
    }

    fn router(flush_docs: usize) -> (Router, mpsc::UnboundedReceiver<FlushJob>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let opts = DeliveryOptions {
            index: "i".into(),
            flush_docs,
            idle_flush: Duration::from_millis(100),
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            invalidate_chunk: 10,
        };
        let router = Router {
            opts,
            buckets: BTreeMap::new(),
            flush_tx,
            next_generation: 0,
        };
        (router, flush_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn flushed_buckets_are_removed() {
        let (mut router, mut jobs) = router(2);
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();

        for day in 1..=5 {
            let key = format!("2020/01/{:02}", day);
            router.push(key.clone(), pending("g", day * 2 - 1), &timer_tx);
            router.push(key, pending("g", day * 2), &timer_tx);
        }
        assert!(router.buckets.is_empty());
        for _ in 0..5 {
            assert_eq!(jobs.try_recv().unwrap().docs.len(), 2);
        }

        router.push("2020/02/01".into(), pending("h", 1), &timer_tx);
        assert_eq!(router.buckets.len(), 1);
        let expired = timer_rx.recv().await.unwrap();
        router.on_idle(expired);
        assert!(router.buckets.is_empty());
        assert_eq!(jobs.try_recv().unwrap().bucket, "2020/02/01");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_does_not_flush_recreated_bucket() {
        let (mut router, mut jobs) = router(1);
        let (timer_tx, _timer_rx) = mpsc::unbounded_channel();

        router.push("b".into(), pending("g", 1), &timer_tx);
        let first_generation = router.next_generation;
        assert!(jobs.try_recv().is_ok());

        router.opts.flush_docs = 10;
        router.push("b".into(), pending("g", 2), &timer_tx);
        router.on_idle(IdleExpired {
            bucket: "b".into(),
            generation: first_generation,
        });
        assert_eq!(router.buckets["b"].buffer.len(), 1);
        assert!(jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let mut attempts = 0;
        let result: Result<(), _> = with_backoff(5, Duration::from_millis(10), || {
            attempts += 1;
            async { Err(BackendError::from_status(400, "bad request")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
