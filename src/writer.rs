//! Telemetry writer - durable dual-write with local-queue fallback.
//!
//! Every accepted record is written to the remote store twice: the
//! current-location projection (one row per user, overwritten) and the
//! history projection (append-only audit trail). The two writes are
//! deliberately independent - the history append is attempted even when the
//! current-location write has already failed, so the audit trail survives a
//! partial outage.
//!
//! A record is never discarded on failure: it is either delivered (both
//! projections) or parked in the offline queue. The only loss case is the
//! local queue write itself failing, which is logged at error level and
//! counted in [`PipelineStats`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::queue::OfflineQueue;
use crate::record::TelemetryRecord;
use crate::stats::PipelineStats;

/// Errors from the remote document store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store was unreachable (connectivity, DNS, 5xx).
    #[error("Remote store unreachable: {0}")]
    Network(String),

    /// The store rejected the write (auth expired, rules).
    #[error("Remote store rejected the write: {0}")]
    Permission(String),
}

/// Remote document store collaborator.
///
/// Both operations may fail with a network or permission error; neither
/// failure is surfaced to callers of the pipeline - the record is queued
/// instead.
pub trait RemoteStore: Send + Sync {
    /// Overwrite the user's current-location row.
    fn put_current_location(
        &self,
        record: &TelemetryRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Append one history row.
    fn append_history(
        &self,
        record: &TelemetryRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Platform connectivity collaborator.
///
/// Reports whether the device currently has network connectivity. Used to
/// skip doomed remote attempts and to stamp `is_online` on records.
pub trait ConnectivityProbe: Send + Sync {
    /// True if the platform reports the network as up.
    fn is_online(&self) -> bool;
}

/// Connectivity probe for hosts without an offline signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Outcome of one write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Both projections reached the remote store.
    Delivered,

    /// The record is parked in the offline queue for retry.
    Queued,

    /// The local queue write failed - the record is gone. This is the
    /// pipeline's only data-loss path and must stay rare.
    Lost,
}

/// Performs the dual write with local-queue fallback.
pub struct TelemetryWriter<S: RemoteStore> {
    store: Arc<S>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<dyn ConnectivityProbe>,
    stats: Arc<PipelineStats>,
}

impl<S: RemoteStore> TelemetryWriter<S> {
    /// Create a writer over the remote store and offline queue.
    pub fn new(
        store: Arc<S>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<dyn ConnectivityProbe>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            queue,
            connectivity,
            stats,
        }
    }

    /// Write a record, queueing it on any failure.
    ///
    /// When the platform already reports the network down, the remote
    /// attempt is skipped and the record goes straight to the queue.
    pub async fn write(&self, record: TelemetryRecord) -> WriteOutcome {
        if !self.connectivity.is_online() {
            debug!(
                user_id = %record.user_id,
                "Platform reports offline, queueing without remote attempt"
            );
            return self.enqueue(record).await;
        }

        match self.deliver(&record).await {
            Ok(()) => {
                self.stats.record_delivered();
                WriteOutcome::Delivered
            }
            Err(e) => {
                warn!(user_id = %record.user_id, error = %e, "Remote write failed, queueing record");
                self.enqueue(record).await
            }
        }
    }

    /// Attempt both remote projections, without queue fallback.
    ///
    /// The history append runs regardless of the current-location outcome.
    /// Succeeds only if both writes succeed; a record is not considered
    /// delivered while either projection is missing.
    pub async fn deliver(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        let current = self.store.put_current_location(record).await;
        let history = self.store.append_history(record).await;

        if let Err(e) = &current {
            debug!(user_id = %record.user_id, error = %e, "Current-location write failed");
        }
        if let Err(e) = &history {
            debug!(user_id = %record.user_id, error = %e, "History append failed");
        }

        current.and(history)
    }

    /// Offline queue this writer falls back to.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    async fn enqueue(&self, record: TelemetryRecord) -> WriteOutcome {
        let user_id = record.user_id.clone();
        match self.queue.enqueue(record).await {
            Ok(_) => WriteOutcome::Queued,
            Err(e) => {
                error!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to queue undelivered telemetry record - record lost"
                );
                self.stats.record_lost();
                WriteOutcome::Lost
            }
        }
    }
}

/// In-memory remote store for tests and local development.
///
/// Failure injection mirrors the outages the pipeline must survive:
/// per-projection flags, plus an operation budget for "store went down
/// mid-drain" scenarios.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    current: Mutex<HashMap<String, TelemetryRecord>>,
    history: Mutex<Vec<TelemetryRecord>>,
    fail_current: AtomicBool,
    fail_history: AtomicBool,

    /// Remaining successful operations before everything fails; negative
    /// means unlimited.
    allowed_ops: AtomicI64,
}

impl MemoryRemoteStore {
    /// Create an empty store that accepts every write.
    pub fn new() -> Self {
        Self {
            allowed_ops: AtomicI64::new(-1),
            ..Default::default()
        }
    }

    /// Make current-location writes fail.
    pub fn set_fail_current(&self, fail: bool) {
        self.fail_current.store(fail, Ordering::SeqCst);
    }

    /// Make history appends fail.
    pub fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail (`true`), or clear all injected failures
    /// including any operation budget (`false`).
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_current.store(fail, Ordering::SeqCst);
        self.fail_history.store(fail, Ordering::SeqCst);
        if !fail {
            self.allowed_ops.store(-1, Ordering::SeqCst);
        }
    }

    /// Let `records` full dual-writes succeed, then fail everything.
    pub fn set_failures_after(&self, records: u64) {
        self.allowed_ops.store(records as i64 * 2, Ordering::SeqCst);
    }

    /// Current-location row for a user, if written.
    pub fn current_of(&self, user_id: &str) -> Option<TelemetryRecord> {
        self.current.lock().unwrap().get(user_id).cloned()
    }

    /// All history rows, in append order.
    pub fn history(&self) -> Vec<TelemetryRecord> {
        self.history.lock().unwrap().clone()
    }

    /// Number of history rows.
    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    fn check_op(&self) -> Result<(), StoreError> {
        let budget = self.allowed_ops.load(Ordering::SeqCst);
        if budget >= 0 {
            let previous = self.allowed_ops.fetch_sub(1, Ordering::SeqCst);
            if previous <= 0 {
                self.allowed_ops.store(0, Ordering::SeqCst);
                return Err(StoreError::Network("simulated outage".to_string()));
            }
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemoteStore {
    async fn put_current_location(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        self.check_op()?;
        if self.fail_current.load(Ordering::SeqCst) {
            return Err(StoreError::Network("simulated outage".to_string()));
        }
        self.current
            .lock()
            .unwrap()
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn append_history(&self, record: &TelemetryRecord) -> Result<(), StoreError> {
        self.check_op()?;
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(StoreError::Network("simulated outage".to_string()));
        }
        self.history.lock().unwrap().push(record.clone());
        Ok(())
    }
}
