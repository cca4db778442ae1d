//! Offline retry queue for undelivered telemetry.
//!
//! When a remote write fails (or the platform reports the network down),
//! the record is parked here and replayed later by the sync scheduler.
//! The queue is a thin ordering/serialization layer over a
//! [`DurableStore`](crate::store::DurableStore):
//!
//! - `enqueue` assigns the `queued_at` key - epoch milliseconds, strictly
//!   monotonic within the process - and persists the record
//! - `drain` replays records FIFO through the writer, removing each on
//!   success and stopping at the first failure so ordering is preserved and
//!   a systemic outage is not amplified
//!
//! The read-modify-write of a drain (deliver, then remove) is serialized by
//! an internal mutex, so overlapping drains (foreground timer vs. background
//! wake) cannot double-deliver a record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::record::{QueuedTelemetryRecord, TelemetryRecord};
use crate::stats::PipelineStats;
use crate::store::{DurableStore, QueueError};
use crate::writer::{RemoteStore, TelemetryWriter};

/// Name of the queue table holding undelivered telemetry.
pub const PENDING_QUEUE: &str = "pendingLocations";

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Records delivered and removed this pass.
    pub delivered: usize,

    /// Records still queued after the pass.
    pub remaining: usize,

    /// True if the pass stopped early on a failure.
    pub failed: bool,
}

/// Durable FIFO queue of not-yet-delivered telemetry records.
pub struct OfflineQueue {
    store: Arc<dyn DurableStore>,
    stats: Arc<PipelineStats>,

    /// Serializes drain passes and key assignment against each other.
    lock: Mutex<()>,

    /// Last assigned `queued_at` key.
    last_key: AtomicU64,
}

impl OfflineQueue {
    /// Create a queue over the given durable store.
    pub fn new(store: Arc<dyn DurableStore>, stats: Arc<PipelineStats>) -> Self {
        Self {
            store,
            stats,
            lock: Mutex::new(()),
            last_key: AtomicU64::new(0),
        }
    }

    /// Park a record for later delivery.
    ///
    /// Assigns the monotonic `queued_at` key and persists the record. The
    /// caller decides what a failure here means - in the write path it is
    /// the single true data-loss case.
    pub async fn enqueue(&self, record: TelemetryRecord) -> Result<u64, QueueError> {
        let _guard = self.lock.lock().await;

        let queued_at = self.next_queued_at();
        let queued = QueuedTelemetryRecord { queued_at, record };
        let bytes = serde_json::to_vec(&queued)?;
        self.store.append(PENDING_QUEUE, queued_at, &bytes)?;

        self.stats.record_queued();
        debug!(queued_at, user_id = %queued.record.user_id, "Telemetry record queued for retry");
        Ok(queued_at)
    }

    /// Replay queued records FIFO through the writer.
    ///
    /// Each delivered record is removed from the store; the pass stops at
    /// the first delivery failure, leaving that record and everything behind
    /// it queued in order.
    pub async fn drain<S: RemoteStore>(&self, writer: &TelemetryWriter<S>) -> DrainReport {
        let _guard = self.lock.lock().await;

        let entries = match self.store.read_all(PENDING_QUEUE) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to read offline queue, skipping drain");
                return DrainReport {
                    failed: true,
                    ..Default::default()
                };
            }
        };

        if entries.is_empty() {
            return DrainReport::default();
        }

        let total = entries.len();
        debug!(queued = total, "Draining offline telemetry queue");

        let mut delivered = 0;
        let mut dropped = 0;
        let mut failed = false;

        for (key, bytes) in entries {
            let queued: QueuedTelemetryRecord = match serde_json::from_slice(&bytes) {
                Ok(queued) => queued,
                Err(e) => {
                    // Undecodable entries would wedge the queue head forever.
                    warn!(queued_at = key, error = %e, "Removing undecodable queue entry");
                    if self.store.remove(PENDING_QUEUE, key).is_ok() {
                        dropped += 1;
                    }
                    continue;
                }
            };

            match writer.deliver(&queued.record).await {
                Ok(()) => {
                    if let Err(e) = self.store.remove(PENDING_QUEUE, key) {
                        warn!(queued_at = key, error = %e, "Failed to remove delivered queue entry");
                        failed = true;
                        break;
                    }
                    self.stats.record_drained();
                    delivered += 1;
                }
                Err(e) => {
                    debug!(queued_at = key, error = %e, "Drain stopped at first failing record");
                    failed = true;
                    break;
                }
            }
        }

        let report = DrainReport {
            delivered,
            remaining: total - delivered - dropped,
            failed,
        };

        if report.delivered > 0 || report.failed {
            debug!(
                delivered = report.delivered,
                remaining = report.remaining,
                failed = report.failed,
                "Offline queue drain finished"
            );
        }
        report
    }

    /// Number of records currently queued.
    pub fn len(&self) -> usize {
        self.store
            .read_all(PENDING_QUEUE)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next `queued_at` key: wall-clock milliseconds, bumped past the last
    /// assigned key so concurrent enqueues in the same millisecond stay
    /// strictly ordered.
    fn next_queued_at(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last_key.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_key.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Identity;
    use crate::store::MemoryQueueStore;
    use crate::writer::{AlwaysOnline, MemoryRemoteStore, TelemetryWriter};

    fn record(user_id: &str) -> TelemetryRecord {
        let identity = Identity::new(user_id, "Ana", "fretista");
        let sample = crate::position::PositionSample::new(-23.55, -46.63, 20.0);
        TelemetryRecord::from_sample(&identity, &sample, None, true)
    }

    fn create_queue() -> Arc<OfflineQueue> {
        Arc::new(OfflineQueue::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(PipelineStats::new()),
        ))
    }

    fn create_writer(
        queue: Arc<OfflineQueue>,
        remote: Arc<MemoryRemoteStore>,
    ) -> TelemetryWriter<MemoryRemoteStore> {
        TelemetryWriter::new(
            remote,
            queue,
            Arc::new(AlwaysOnline),
            Arc::new(PipelineStats::new()),
        )
    }

    #[tokio::test]
    async fn test_enqueue_assigns_strictly_increasing_keys() {
        let queue = create_queue();

        let k1 = queue.enqueue(record("u-1")).await.unwrap();
        let k2 = queue.enqueue(record("u-1")).await.unwrap();
        let k3 = queue.enqueue(record("u-1")).await.unwrap();

        assert!(k1 < k2 && k2 < k3);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_drain_delivers_fifo_and_empties_queue() {
        let queue = create_queue();
        let remote = Arc::new(MemoryRemoteStore::new());
        let writer = create_writer(Arc::clone(&queue), Arc::clone(&remote));

        queue.enqueue(record("first")).await.unwrap();
        queue.enqueue(record("second")).await.unwrap();
        queue.enqueue(record("third")).await.unwrap();

        let report = queue.drain(&writer).await;

        assert_eq!(report.delivered, 3);
        assert_eq!(report.remaining, 0);
        assert!(!report.failed);
        assert!(queue.is_empty());

        let history = remote.history();
        let order: Vec<_> = history.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_failure() {
        let queue = create_queue();
        let remote = Arc::new(MemoryRemoteStore::new());
        let writer = create_writer(Arc::clone(&queue), Arc::clone(&remote));

        queue.enqueue(record("first")).await.unwrap();
        queue.enqueue(record("second")).await.unwrap();
        queue.enqueue(record("third")).await.unwrap();

        // First record delivers, then the store goes down.
        remote.set_failures_after(1);

        let report = queue.drain(&writer).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 2);
        assert!(report.failed);
        assert_eq!(queue.len(), 2);

        // Order is preserved for the next pass.
        remote.set_fail_all(false);
        let report = queue.drain(&writer).await;
        assert_eq!(report.delivered, 2);
        assert!(queue.is_empty());

        let history = remote.history();
        let order: Vec<_> = history.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_drain_empty_queue_is_noop() {
        let queue = create_queue();
        let remote = Arc::new(MemoryRemoteStore::new());
        let writer = create_writer(Arc::clone(&queue), Arc::clone(&remote));

        let report = queue.drain(&writer).await;
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn test_drain_removes_undecodable_entry() {
        let store = Arc::new(MemoryQueueStore::new());
        store.append(PENDING_QUEUE, 1, b"not json").unwrap();

        let queue = Arc::new(OfflineQueue::new(
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Arc::new(PipelineStats::new()),
        ));
        let remote = Arc::new(MemoryRemoteStore::new());
        let writer = create_writer(Arc::clone(&queue), remote);

        let report = queue.drain(&writer).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.remaining, 0);
        assert!(queue.is_empty());
    }
}
