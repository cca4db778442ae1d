//! Integration tests for the location telemetry pipeline.
//!
//! These tests verify the complete flows end to end:
//! - Sample → enrichment → dual write (current + history)
//! - Outage → offline queue → drain on wake
//! - Lifecycle idempotency and resource cleanup
//! - The geocode throttle law across a running session
//!
//! Run with: `cargo test --test tracking_integration`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use fieldtrack::controller::{StartOutcome, TrackingConfig, TrackingController};
use fieldtrack::geocode::{GeocodeError, Geocoder, GeocodeThrottlerConfig};
use fieldtrack::permission::{PermissionProbe, PlatformPermission, ProbeError};
use fieldtrack::position::{LocationError, LocationSource, PositionRequest, PositionSample};
use fieldtrack::queue::{OfflineQueue, PENDING_QUEUE};
use fieldtrack::record::{Identity, QueuedTelemetryRecord, TelemetryRecord};
use fieldtrack::scheduler::{flush_tag, NoopWakeScheduler, WakeScheduler};
use fieldtrack::stats::PipelineStats;
use fieldtrack::store::{DurableStore, MemoryQueueStore};
use fieldtrack::writer::{ConnectivityProbe, MemoryRemoteStore, TelemetryWriter, WriteOutcome};

// ============================================================================
// Test Helpers
// ============================================================================

/// Mock platform location source: a test-fed watch plus scripted polls.
struct MockSource {
    watch_rx: Mutex<Option<mpsc::Receiver<Result<PositionSample, LocationError>>>>,
    poll_results: Mutex<VecDeque<Result<PositionSample, LocationError>>>,
    watch_calls: AtomicU64,
}

impl MockSource {
    fn new() -> (Arc<Self>, mpsc::Sender<Result<PositionSample, LocationError>>) {
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let source = Arc::new(Self {
            watch_rx: Mutex::new(Some(feed_rx)),
            poll_results: Mutex::new(VecDeque::new()),
            watch_calls: AtomicU64::new(0),
        });
        (source, feed_tx)
    }

    fn script_poll(&self, result: Result<PositionSample, LocationError>) {
        self.poll_results.lock().unwrap().push_back(result);
    }
}

impl LocationSource for MockSource {
    async fn current_position(
        &self,
        _request: PositionRequest,
    ) -> Result<PositionSample, LocationError> {
        self.poll_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LocationError::Unavailable(
                "no scripted reading".to_string(),
            )))
    }

    fn watch_position(
        &self,
        _request: PositionRequest,
    ) -> mpsc::Receiver<Result<PositionSample, LocationError>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.watch_rx.lock().unwrap().take().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::channel(1);
            rx
        })
    }
}

/// Mock permission probe reporting a fixed state.
struct MockProbe(PlatformPermission);

impl PermissionProbe for MockProbe {
    async fn query(&self) -> Result<PlatformPermission, ProbeError> {
        Ok(self.0)
    }
}

/// Mock geocoder counting successful calls.
struct MockGeocoder {
    calls: AtomicU64,
}

impl MockGeocoder {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Geocoder for MockGeocoder {
    async fn reverse_geocode(&self, _: f64, _: f64) -> Result<String, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("Rua Vergueiro, São Paulo".to_string())
    }
}

/// Connectivity probe the test can flip.
struct SwitchableConnectivity(AtomicBool);

impl SwitchableConnectivity {
    fn online() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityProbe for SwitchableConnectivity {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type TestController = TrackingController<MockSource, MockProbe, MockGeocoder, MemoryRemoteStore>;

struct Harness {
    controller: Arc<TestController>,
    feed: mpsc::Sender<Result<PositionSample, LocationError>>,
    source: Arc<MockSource>,
    remote: Arc<MemoryRemoteStore>,
    durable: Arc<MemoryQueueStore>,
    geocoder: Arc<MockGeocoder>,
    connectivity: Arc<SwitchableConnectivity>,
}

fn create_harness(permission: PlatformPermission, config: TrackingConfig) -> Harness {
    let (source, feed) = MockSource::new();
    let remote = Arc::new(MemoryRemoteStore::new());
    let durable = Arc::new(MemoryQueueStore::new());
    let geocoder = Arc::new(MockGeocoder::new());
    let connectivity = SwitchableConnectivity::online();

    let controller = Arc::new(TrackingController::new(
        Arc::clone(&source),
        MockProbe(permission),
        Arc::clone(&geocoder),
        Arc::clone(&remote),
        Arc::clone(&durable) as Arc<dyn DurableStore>,
        Arc::new(NoopWakeScheduler) as Arc<dyn WakeScheduler>,
        Arc::clone(&connectivity) as Arc<dyn ConnectivityProbe>,
        config,
    ));

    Harness {
        controller,
        feed,
        source,
        remote,
        durable,
        geocoder,
        connectivity,
    }
}

fn fretista() -> Identity {
    Identity::new("u-1", "Ana", "fretista")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

fn sample(accuracy_meters: f64) -> PositionSample {
    PositionSample::new(-23.5505, -46.6333, accuracy_meters)
}

fn queued_records(durable: &MemoryQueueStore) -> Vec<QueuedTelemetryRecord> {
    durable
        .read_all(PENDING_QUEUE)
        .unwrap()
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).unwrap())
        .collect()
}

// ============================================================================
// Happy-path scenarios
// ============================================================================

/// Tracked role, granted permission, accurate sample: one geocode call and
/// both projections written.
#[tokio::test]
async fn test_accurate_sample_enriched_and_dual_written() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());

    assert_eq!(
        harness.controller.start(fretista()).await,
        StartOutcome::Started
    );

    harness.feed.send(Ok(sample(50.0))).await.unwrap();
    settle().await;

    assert_eq!(harness.geocoder.calls(), 1);

    let current = harness.remote.current_of("u-1").expect("current row");
    assert_eq!(current.latitude, -23.5505);
    assert_eq!(
        current.address.as_deref(),
        Some("Rua Vergueiro, São Paulo")
    );
    assert!(current.is_online);

    assert_eq!(harness.remote.history_len(), 1);
    assert!(harness.controller.queue().is_empty());

    harness.controller.stop_all().await;
}

/// A coarse sample skips enrichment but both writes still happen.
#[tokio::test]
async fn test_coarse_sample_skips_geocode_but_writes() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());
    harness.controller.start(fretista()).await;

    harness.feed.send(Ok(sample(150.0))).await.unwrap();
    settle().await;

    assert_eq!(harness.geocoder.calls(), 0);

    let current = harness.remote.current_of("u-1").expect("current row");
    assert!(current.address.is_none());
    assert_eq!(harness.remote.history_len(), 1);

    harness.controller.stop_all().await;
}

// ============================================================================
// Outage and retry
// ============================================================================

/// Store outage: the record lands in the queue with a `queued_at` key; a
/// wake after recovery empties the queue and writes both projections.
#[tokio::test]
async fn test_outage_queues_then_wake_delivers() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());
    harness.controller.start(fretista()).await;

    harness.remote.set_fail_all(true);
    harness.feed.send(Ok(sample(150.0))).await.unwrap();
    settle().await;

    let queued = queued_records(&harness.durable);
    assert_eq!(queued.len(), 1);
    assert!(queued[0].queued_at > 0);
    assert_eq!(queued[0].record.user_id, "u-1");
    assert_eq!(harness.remote.history_len(), 0);

    // Connectivity restored; the background wake drains the queue.
    harness.remote.set_fail_all(false);
    harness.controller.handle_wake(&flush_tag("u-1")).await;
    settle().await;

    assert!(harness.controller.queue().is_empty());
    assert!(harness.remote.current_of("u-1").is_some());
    assert!(harness.remote.history_len() >= 1);

    harness.controller.stop_all().await;
}

/// Platform-reported offline skips the doomed remote attempt entirely.
#[tokio::test]
async fn test_platform_offline_queues_without_remote_attempt() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());
    harness.controller.start(fretista()).await;

    harness.connectivity.set_online(false);
    harness.feed.send(Ok(sample(150.0))).await.unwrap();
    settle().await;

    assert_eq!(harness.controller.queue().len(), 1);
    assert_eq!(harness.remote.history_len(), 0);

    let queued = queued_records(&harness.durable);
    assert!(!queued[0].record.is_online);

    harness.controller.stop_all().await;
}

/// FIFO drain through the writer: records queued during an outage are
/// replayed oldest-first, and a mid-drain failure leaves the tail queued in
/// order.
#[tokio::test]
async fn test_fifo_drain_stops_at_first_failure() {
    let stats = Arc::new(PipelineStats::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let queue = Arc::new(OfflineQueue::new(
        Arc::new(MemoryQueueStore::new()),
        Arc::clone(&stats),
    ));
    let connectivity = SwitchableConnectivity::online();
    let writer = TelemetryWriter::new(
        Arc::clone(&remote),
        Arc::clone(&queue),
        Arc::clone(&connectivity) as Arc<dyn ConnectivityProbe>,
        stats,
    );

    // Queue three records while the platform is offline.
    connectivity.set_online(false);
    for name in ["t1", "t2", "t3"] {
        let identity = Identity::new(name, name, "fretista");
        let record = TelemetryRecord::from_sample(&identity, &sample(40.0), None, false);
        assert_eq!(writer.write(record).await, WriteOutcome::Queued);
    }
    connectivity.set_online(true);

    // First drain: one success, then the store fails.
    remote.set_failures_after(1);
    let report = queue.drain(&writer).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 2);
    assert!(report.failed);

    // Second drain after recovery delivers the rest, still in order.
    remote.set_fail_all(false);
    let report = queue.drain(&writer).await;
    assert_eq!(report.delivered, 2);
    assert!(queue.is_empty());

    let order: Vec<_> = remote
        .history()
        .iter()
        .map(|record| record.user_id.clone())
        .collect();
    assert_eq!(order, vec!["t1", "t2", "t3"]);
}

/// Partial failure: current projection fails, history succeeds, and the
/// record still retries until both projections have landed.
#[tokio::test]
async fn test_partial_failure_still_queues_for_retry() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());
    harness.controller.start(fretista()).await;

    harness.remote.set_fail_current(true);
    harness.feed.send(Ok(sample(150.0))).await.unwrap();
    settle().await;

    // The audit trail got its row, but the record is not considered
    // delivered while the current projection is missing.
    assert_eq!(harness.remote.history_len(), 1);
    assert!(harness.remote.current_of("u-1").is_none());
    assert_eq!(harness.controller.queue().len(), 1);

    harness.remote.set_fail_current(false);
    harness.controller.handle_wake(&flush_tag("u-1")).await;
    settle().await;

    assert!(harness.controller.queue().is_empty());
    assert!(harness.remote.current_of("u-1").is_some());

    harness.controller.stop_all().await;
}

/// Every accepted sample is either delivered or queued - never neither.
#[tokio::test]
async fn test_at_least_once_accounting() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());
    harness.controller.start(fretista()).await;

    for i in 0..6 {
        // Store down for half the samples.
        harness.remote.set_fail_all(i % 2 == 0);
        harness.feed.send(Ok(sample(150.0))).await.unwrap();
        settle().await;
    }

    let stats = harness.controller.stats();
    assert_eq!(stats.samples_acquired, 6);
    assert_eq!(stats.records_lost, 0);
    // Opportunistic drains may re-deliver queued records, so the direct
    // outcomes must cover every sample exactly once.
    assert_eq!(stats.records_delivered + stats.records_queued, 6);

    harness.controller.stop_all().await;
}

// ============================================================================
// Throttle law
// ============================================================================

/// No two successful geocode calls inside the window, across a session.
#[tokio::test]
async fn test_geocode_throttle_window_across_session() {
    let config = TrackingConfig {
        geocode: GeocodeThrottlerConfig {
            min_interval: Duration::from_millis(250),
            ..Default::default()
        },
        ..Default::default()
    };
    let harness = create_harness(PlatformPermission::Granted, config);
    harness.controller.start(fretista()).await;

    for _ in 0..3 {
        harness.feed.send(Ok(sample(50.0))).await.unwrap();
    }
    settle().await;
    assert_eq!(harness.geocoder.calls(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    harness.feed.send(Ok(sample(50.0))).await.unwrap();
    settle().await;
    assert_eq!(harness.geocoder.calls(), 2);

    harness.controller.stop_all().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Double start: one watcher, one session; stop when not started: no-op.
#[tokio::test]
async fn test_lifecycle_idempotency() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());

    harness.controller.stop("u-1").await;

    assert_eq!(
        harness.controller.start(fretista()).await,
        StartOutcome::Started
    );
    assert_eq!(
        harness.controller.start(fretista()).await,
        StartOutcome::AlreadyActive
    );
    settle().await;

    assert_eq!(harness.source.watch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.controller.session_count().await, 1);

    harness.controller.stop_all().await;
}

/// Denied permission: no session, no watcher, no timers.
#[tokio::test]
async fn test_denied_permission_starts_nothing() {
    let harness = create_harness(PlatformPermission::Denied, TrackingConfig::default());

    assert_eq!(
        harness.controller.start(fretista()).await,
        StartOutcome::NotPermitted
    );
    assert_eq!(harness.controller.session_count().await, 0);
    assert_eq!(harness.source.watch_calls.load(Ordering::SeqCst), 0);
}

/// After stop: the watch is released, no further record is produced, and a
/// late wake for the stopped identity is ignored.
#[tokio::test]
async fn test_stop_cleans_up_and_late_wake_is_ignored() {
    let harness = create_harness(PlatformPermission::Granted, TrackingConfig::default());
    harness.controller.start(fretista()).await;

    harness.feed.send(Ok(sample(150.0))).await.unwrap();
    settle().await;
    assert_eq!(harness.remote.history_len(), 1);

    harness.controller.stop("u-1").await;

    // The platform watch handle was released.
    assert!(harness.feed.is_closed());

    // A wake delivered after stop finds no session and changes nothing.
    harness
        .controller
        .queue()
        .enqueue(TelemetryRecord::from_sample(
            &fretista(),
            &sample(150.0),
            None,
            false,
        ))
        .await
        .unwrap();
    harness.controller.handle_wake(&flush_tag("u-1")).await;
    assert_eq!(harness.controller.queue().len(), 1);
    assert_eq!(harness.remote.history_len(), 1);
}
