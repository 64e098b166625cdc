//! Background queue and processor
//!
//! The queue is an append-only log under `queue:item:{seq}`. The ingestion
//! path appends and wakes the processor; the processor drains in sequence
//! order, feeds each item to the aggregator and deletes it only after the
//! update committed. A failed or timed-out item stays at the head of the log
//! with its attempt count bumped and is retried after a backoff, so ordering
//! holds and nothing is dropped. Items that can never succeed are moved to
//! `queue:dead:` for inspection.

use crate::{
    analytics::AnalyticsAggregator,
    config::DrawGuardConfig,
    errors::{DrawGuardError, StorageError},
    metrics::DrawGuardMetrics,
    security::AccessGuard,
    storage::{key_number, numbered_key, DbTransaction, DrawStorage},
    types::QueueItem,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{error, info, warn};

const QUEUE_PREFIX: &[u8] = b"queue:item:";
const DEAD_LETTER_PREFIX: &[u8] = b"queue:dead:";

/// A queued entry as read back from the log
#[derive(Debug)]
pub enum PendingEntry {
    Item { seq: u64, item: QueueItem },
    Unreadable { seq: u64, raw: Vec<u8>, reason: String },
}

#[derive(Clone)]
pub struct BackgroundQueue {
    storage: DrawStorage,
    next_seq: Arc<AtomicU64>,
    notify: Arc<Notify>,
    metrics: DrawGuardMetrics,
}

impl BackgroundQueue {
    pub fn new(storage: DrawStorage, metrics: DrawGuardMetrics) -> Result<Self, StorageError> {
        let last_in = |prefix: &[u8]| -> Result<u64, StorageError> {
            Ok(storage
                .scan_prefix_rev(prefix, 1)?
                .first()
                .and_then(|(key, _)| key_number(prefix, key))
                .unwrap_or(0))
        };
        // Dead letters share the sequence space
        let last_seq = last_in(QUEUE_PREFIX)?.max(last_in(DEAD_LETTER_PREFIX)?);

        let queue = Self {
            storage,
            next_seq: Arc::new(AtomicU64::new(last_seq + 1)),
            notify: Arc::new(Notify::new()),
            metrics,
        };
        let backlog = queue.len()?;
        queue.metrics.queue_depth.set(backlog as i64);
        if backlog > 0 {
            info!(backlog, "📦 Resuming queue with pending items");
        }
        Ok(queue)
    }

    /// Append an item and wake the processor
    pub fn enqueue(&self, item: &QueueItem) -> Result<u64, StorageError> {
        let seq = self.reserve();
        self.storage.put(&numbered_key(QUEUE_PREFIX, seq), &serde_json::to_vec(item)?)?;
        self.committed(seq);
        Ok(seq)
    }

    /// Sequence number for an item staged inside another transaction
    pub fn reserve(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Write an encoded item as part of `txn`.
    ///
    /// Nothing is visible to the processor until `txn` commits; call
    /// [`BackgroundQueue::committed`] afterwards.
    pub fn stage(&self, txn: &DbTransaction<'_>, seq: u64, encoded: &[u8]) -> Result<(), rocksdb::Error> {
        txn.put(numbered_key(QUEUE_PREFIX, seq), encoded)
    }

    /// Account for a committed item and wake the processor
    pub fn committed(&self, seq: u64) {
        self.metrics.queue_enqueued.inc();
        self.metrics.queue_depth.inc();
        self.notify.notify_one();
        tracing::debug!(seq, "Queue item committed");
    }

    /// Oldest `limit` entries in append order
    pub fn pending(&self, limit: usize) -> Result<Vec<PendingEntry>, StorageError> {
        let rows = self.storage.scan_prefix(QUEUE_PREFIX, None, limit)?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, value)| {
                let seq = key_number(QUEUE_PREFIX, &key)?;
                Some(match serde_json::from_slice(&value) {
                    Ok(item) => PendingEntry::Item { seq, item },
                    Err(e) => PendingEntry::Unreadable {
                        seq,
                        raw: value,
                        reason: e.to_string(),
                    },
                })
            })
            .collect())
    }

    /// Remove a processed entry
    pub fn ack(&self, seq: u64) -> Result<(), StorageError> {
        self.storage.delete(&numbered_key(QUEUE_PREFIX, seq))?;
        self.metrics.queue_depth.dec();
        Ok(())
    }

    /// Keep an entry in place with its attempt count bumped
    pub fn requeue(&self, seq: u64, item: &QueueItem) -> Result<(), StorageError> {
        let mut retry = item.clone();
        retry.attempts += 1;
        self.storage.put(&numbered_key(QUEUE_PREFIX, seq), &serde_json::to_vec(&retry)?)?;
        self.metrics.queue_retried.inc();
        Ok(())
    }

    /// Move an entry out of the live log
    pub fn dead_letter(&self, seq: u64, raw: &[u8]) -> Result<(), StorageError> {
        self.storage.put(&numbered_key(DEAD_LETTER_PREFIX, seq), raw)?;
        self.ack(seq)
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        Ok(self
            .storage
            .scan_prefix(DEAD_LETTER_PREFIX, None, limit)?
            .into_iter()
            .filter_map(|(key, value)| Some((key_number(DEAD_LETTER_PREFIX, &key)?, value)))
            .collect())
    }

    /// Number of live entries
    pub fn len(&self) -> Result<usize, StorageError> {
        let mut count = 0;
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let page = self.storage.scan_prefix(QUEUE_PREFIX, cursor.as_deref(), 1024)?;
            count += page.len();
            if page.len() < 1024 {
                return Ok(count);
            }
            cursor = page.into_iter().last().map(|(key, _)| key);
        }
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.storage.scan_prefix(QUEUE_PREFIX, None, 1)?.is_empty())
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// Processor counters
#[derive(Debug, Default)]
pub struct ProcessorStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl ProcessorStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Result of one drain pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainSummary {
    pub processed: u64,
    pub failed: u64,
    /// Set when the pass stopped early on a retryable failure
    pub stalled: bool,
    pub elapsed: Duration,
}

enum ItemResult {
    Done,
    Retry(String),
    Fatal(String),
}

/// Single consumer of the background queue
pub struct QueueProcessor {
    queue: BackgroundQueue,
    aggregator: Arc<AnalyticsAggregator>,
    guard: Arc<AccessGuard>,
    metrics: DrawGuardMetrics,
    stats: Arc<ProcessorStats>,
    batch_size: usize,
    poll_interval: Duration,
    item_timeout: Duration,
    retry_backoff: Duration,
}

impl QueueProcessor {
    pub fn new(
        queue: BackgroundQueue,
        aggregator: Arc<AnalyticsAggregator>,
        guard: Arc<AccessGuard>,
        metrics: DrawGuardMetrics,
        config: &DrawGuardConfig,
    ) -> Self {
        Self {
            queue,
            aggregator,
            guard,
            metrics,
            stats: Arc::new(ProcessorStats::default()),
            batch_size: config.queue.batch_size,
            poll_interval: config.queue_poll_interval(),
            item_timeout: config.queue_item_timeout(),
            retry_backoff: config.queue_retry_backoff(),
        }
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("🔄 Queue processor started");
            let notify = self.queue.notifier();

            loop {
                let summary = self.drain_once().await;
                if summary.stalled {
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_backoff) => continue,
                        _ = shutdown.changed() => break,
                    }
                }

                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }

            info!(
                processed = self.stats.processed(),
                failed = self.stats.failed(),
                "🛑 Queue processor stopped"
            );
        })
    }

    /// Process pending items in order until the log is empty or an item must be retried
    pub async fn drain_once(&self) -> DrainSummary {
        let started = Instant::now();
        let mut summary = DrainSummary::default();

        'drain: loop {
            let entries = match self.queue.pending(self.batch_size) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "Failed to read queue");
                    summary.stalled = true;
                    break;
                }
            };
            if entries.is_empty() {
                break;
            }

            for entry in entries {
                match entry {
                    PendingEntry::Item { seq, item } => match self.process_item(seq, &item).await {
                        ItemResult::Done => {
                            summary.processed += 1;
                            self.stats.processed.fetch_add(1, Ordering::Relaxed);
                            self.metrics.queue_processed.inc();
                        }
                        ItemResult::Retry(reason) => {
                            self.record_failure(&mut summary);
                            warn!(seq, draw_number = item.draw_number, attempts = item.attempts + 1, %reason, "Queue item will be retried");
                            if let Err(e) = self.queue.requeue(seq, &item) {
                                error!(seq, error = %e, "Failed to requeue item");
                            }
                            summary.stalled = true;
                            break 'drain;
                        }
                        ItemResult::Fatal(reason) => {
                            self.record_failure(&mut summary);
                            error!(seq, draw_number = item.draw_number, %reason, "Queue item moved to dead letters");
                            let raw = serde_json::to_vec(&item).unwrap_or_default();
                            if let Err(e) = self.queue.dead_letter(seq, &raw) {
                                error!(seq, error = %e, "Failed to dead-letter item");
                                summary.stalled = true;
                                break 'drain;
                            }
                        }
                    },
                    PendingEntry::Unreadable { seq, raw, reason } => {
                        self.record_failure(&mut summary);
                        error!(seq, %reason, "Unreadable queue item moved to dead letters");
                        if let Err(e) = self.queue.dead_letter(seq, &raw) {
                            error!(seq, error = %e, "Failed to dead-letter item");
                            summary.stalled = true;
                            break 'drain;
                        }
                    }
                }
            }
        }

        summary.elapsed = started.elapsed();
        if summary.processed + summary.failed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                total_processed = self.stats.processed(),
                "📊 Queue drain complete"
            );
        }
        summary
    }

    async fn process_item(&self, seq: u64, item: &QueueItem) -> ItemResult {
        let ctx = match self.guard.internal_context("queue-processor", format!("queue-{}", seq)) {
            Ok(ctx) => ctx,
            Err(e) => return ItemResult::Retry(e.to_string()),
        };

        let update = self.aggregator.update(item.winning_number, item.draw_number, &ctx);
        match tokio::time::timeout(self.item_timeout, update).await {
            Ok(Ok(_)) => match self.queue.ack(seq) {
                Ok(()) => ItemResult::Done,
                Err(e) => ItemResult::Retry(format!("ack failed: {}", e)),
            },
            Ok(Err(DrawGuardError::Validation(e))) => ItemResult::Fatal(e.to_string()),
            Ok(Err(e)) => ItemResult::Retry(e.to_string()),
            Err(_) => ItemResult::Retry(format!("timed out after {:?}", self.item_timeout)),
        }
    }

    fn record_failure(&self, summary: &mut DrainSummary) {
        summary.failed += 1;
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.queue_failed.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analytics::{SnapshotSealer, SNAPSHOT_KEY},
        security::ForensicLog,
        types::DrawColor,
    };
    use chrono::Utc;
    use tempfile::TempDir;

    fn item(draw_number: u64, winning_number: u8) -> QueueItem {
        QueueItem {
            winning_number,
            draw_number,
            color: DrawColor::for_number(winning_number),
            timestamp: Utc::now(),
            queued_at: 0.0,
            attempts: 0,
        }
    }

    fn processor(temp: &TempDir) -> (QueueProcessor, BackgroundQueue, Arc<AnalyticsAggregator>) {
        let config = DrawGuardConfig::for_testing(temp.path().to_string_lossy());
        let storage = DrawStorage::open(&config.storage).unwrap();
        let metrics = DrawGuardMetrics::new().unwrap();
        let forensic = Arc::new(ForensicLog::new(None));
        let queue = BackgroundQueue::new(storage.clone(), metrics.clone()).unwrap();
        let aggregator = Arc::new(AnalyticsAggregator::new(
            storage,
            SnapshotSealer::new(&config.security.seal_key),
            forensic.clone(),
            metrics.clone(),
            config.write_timeout(),
        ));
        let guard = Arc::new(AccessGuard::new(&config.security, forensic, metrics.clone()));
        let processor = QueueProcessor::new(queue.clone(), aggregator.clone(), guard, metrics, &config);
        (processor, queue, aggregator)
    }

    fn with_item_timeout(processor: &QueueProcessor, item_timeout: Duration) -> QueueProcessor {
        QueueProcessor {
            queue: processor.queue.clone(),
            aggregator: processor.aggregator.clone(),
            guard: processor.guard.clone(),
            metrics: processor.metrics.clone(),
            stats: Arc::new(ProcessorStats::default()),
            batch_size: processor.batch_size,
            poll_interval: processor.poll_interval,
            item_timeout,
            retry_backoff: processor.retry_backoff,
        }
    }

    fn head(queue: &BackgroundQueue) -> (u64, QueueItem) {
        match queue.pending(1).unwrap().into_iter().next() {
            Some(PendingEntry::Item { seq, item }) => (seq, item),
            other => panic!("Expected a readable head item, got {other:?}"),
        }
    }

    #[test]
    fn test_append_order_and_ack() {
        let temp = TempDir::new().unwrap();
        let storage = DrawStorage::open_path(temp.path()).unwrap();
        let queue = BackgroundQueue::new(storage, DrawGuardMetrics::new().unwrap()).unwrap();

        let first = queue.enqueue(&item(1, 3)).unwrap();
        let second = queue.enqueue(&item(2, 4)).unwrap();
        assert!(first < second);
        assert_eq!(queue.len().unwrap(), 2);

        queue.ack(first).unwrap();
        match &queue.pending(10).unwrap()[..] {
            [PendingEntry::Item { seq, item }] => {
                assert_eq!(*seq, second);
                assert_eq!(item.draw_number, 2);
            }
            other => panic!("Unexpected pending entries: {other:?}"),
        }
    }

    #[test]
    fn test_requeue_keeps_position() {
        let temp = TempDir::new().unwrap();
        let storage = DrawStorage::open_path(temp.path()).unwrap();
        let queue = BackgroundQueue::new(storage, DrawGuardMetrics::new().unwrap()).unwrap();

        let seq = queue.enqueue(&item(7, 1)).unwrap();
        queue.enqueue(&item(8, 2)).unwrap();
        queue.requeue(seq, &item(7, 1)).unwrap();

        match &queue.pending(1).unwrap()[..] {
            [PendingEntry::Item { seq: head, item }] => {
                assert_eq!(*head, seq);
                assert_eq!(item.attempts, 1);
            }
            other => panic!("Unexpected pending entries: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drain_applies_in_order() {
        let temp = TempDir::new().unwrap();
        let (processor, queue, aggregator) = processor(&temp);

        for (draw, number) in [(1u64, 10u8), (2, 20), (3, 30)] {
            queue.enqueue(&item(draw, number)).unwrap();
        }
        let summary = processor.drain_once().await;

        assert_eq!(summary.processed, 3);
        assert!(!summary.stalled);
        assert!(queue.is_empty().unwrap());
        let snapshot = aggregator.current_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.recent_spins, vec![30, 20, 10]);
        assert_eq!(processor.stats().processed(), 3);
    }

    #[tokio::test]
    async fn test_replayed_item_not_double_counted() {
        let temp = TempDir::new().unwrap();
        let (processor, queue, aggregator) = processor(&temp);

        queue.enqueue(&item(4, 9)).unwrap();
        queue.enqueue(&item(4, 9)).unwrap();
        processor.drain_once().await;

        assert!(queue.is_empty().unwrap());
        assert_eq!(aggregator.current_snapshot().unwrap().unwrap().total_spins(), 1);
    }

    #[tokio::test]
    async fn test_failed_item_stays_at_head_until_it_applies() {
        let temp = TempDir::new().unwrap();
        let (processor, queue, aggregator) = processor(&temp);

        queue.storage.put(SNAPSHOT_KEY, b"{broken").unwrap();
        let first = queue.enqueue(&item(1, 11)).unwrap();
        queue.enqueue(&item(2, 22)).unwrap();

        let summary = processor.drain_once().await;
        assert!(summary.stalled);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed, 1);
        let (seq, stuck) = head(&queue);
        assert_eq!(seq, first);
        assert_eq!(stuck.draw_number, 1);
        assert_eq!(stuck.attempts, 1);

        let summary = processor.drain_once().await;
        assert!(summary.stalled);
        let (seq, stuck) = head(&queue);
        assert_eq!(seq, first);
        assert_eq!(stuck.attempts, 2);
        assert_eq!(queue.len().unwrap(), 2);
        assert!(queue.dead_letters(10).unwrap().is_empty());

        queue.storage.delete(SNAPSHOT_KEY).unwrap();
        let summary = processor.drain_once().await;
        assert!(!summary.stalled);
        assert_eq!(summary.processed, 2);
        assert!(queue.is_empty().unwrap());
        let snapshot = aggregator.current_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.recent_spins, vec![22, 11]);
        assert_eq!(processor.stats().failed(), 2);
    }

    #[tokio::test]
    async fn test_timed_out_item_retried_without_double_count() {
        let temp = TempDir::new().unwrap();
        let (processor, queue, aggregator) = processor(&temp);
        let hasty = with_item_timeout(&processor, Duration::ZERO);

        let seq = queue.enqueue(&item(3, 7)).unwrap();
        let summary = hasty.drain_once().await;
        if summary.stalled {
            let (head_seq, retry) = head(&queue);
            assert_eq!(head_seq, seq);
            assert_eq!(retry.attempts, 1);
        }

        // The abandoned update may still commit in the background; the retry must not count it twice
        let summary = processor.drain_once().await;
        assert!(!summary.stalled);
        assert!(queue.is_empty().unwrap());
        let snapshot = aggregator.current_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.total_spins(), 1);
        assert_eq!(snapshot.frequency[7], 1);
    }

    #[tokio::test]
    async fn test_unreadable_item_dead_lettered() {
        let temp = TempDir::new().unwrap();
        let (processor, queue, _aggregator) = processor(&temp);

        queue.storage.put(&numbered_key(QUEUE_PREFIX, 0), b"{not json").unwrap();
        queue.enqueue(&item(2, 5)).unwrap();
        let summary = processor.drain_once().await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(queue.dead_letters(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_processor_wakes_on_enqueue() {
        let temp = TempDir::new().unwrap();
        let (processor, queue, aggregator) = processor(&temp);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = processor.spawn(shutdown_rx);

        queue.enqueue(&item(1, 36)).unwrap();
        let mut applied = false;
        for _ in 0..100 {
            if aggregator.is_applied(1).unwrap() {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(applied);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
