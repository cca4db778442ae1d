//! Pipeline statistics for monitoring and debugging.
//!
//! Counters are atomic so every task in a session can record events on a
//! shared [`PipelineStats`] without locking. `records_lost` is the one
//! counter that must stay at zero in a healthy deployment - it counts the
//! only true data-loss path in the design (the local queue write itself
//! failing).

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for the telemetry pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Samples accepted from the acquisition engine.
    samples_acquired: AtomicU64,

    /// Per-reading platform failures (logged, tick skipped).
    reading_failures: AtomicU64,

    /// Successful reverse-geocode calls.
    geocode_calls: AtomicU64,

    /// Enrichment attempts skipped by the throttle window or accuracy gate.
    geocode_skipped: AtomicU64,

    /// Records with both projections delivered directly.
    records_delivered: AtomicU64,

    /// Records parked in the offline queue.
    records_queued: AtomicU64,

    /// Queued records delivered by a drain.
    records_drained: AtomicU64,

    /// Records lost because the local queue write failed.
    records_lost: AtomicU64,
}

impl PipelineStats {
    /// Create a zeroed statistics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sample(&self) {
        self.samples_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reading_failure(&self) {
        self.reading_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_geocode_call(&self) {
        self.geocode_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_geocode_skipped(&self) {
        self.geocode_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.records_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self) {
        self.records_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drained(&self) {
        self.records_drained.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self) {
        self.records_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_acquired: self.samples_acquired.load(Ordering::Relaxed),
            reading_failures: self.reading_failures.load(Ordering::Relaxed),
            geocode_calls: self.geocode_calls.load(Ordering::Relaxed),
            geocode_skipped: self.geocode_skipped.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            records_queued: self.records_queued.load(Ordering::Relaxed),
            records_drained: self.records_drained.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub samples_acquired: u64,
    pub reading_failures: u64,
    pub geocode_calls: u64,
    pub geocode_skipped: u64,
    pub records_delivered: u64,
    pub records_queued: u64,
    pub records_drained: u64,
    pub records_lost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_are_zero() {
        let stats = PipelineStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = PipelineStats::new();

        stats.record_sample();
        stats.record_sample();
        stats.record_delivered();
        stats.record_queued();
        stats.record_lost();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.samples_acquired, 2);
        assert_eq!(snapshot.records_delivered, 1);
        assert_eq!(snapshot.records_queued, 1);
        assert_eq!(snapshot.records_lost, 1);
        assert_eq!(snapshot.reading_failures, 0);
    }
}
