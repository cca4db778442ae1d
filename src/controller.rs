//! Tracking lifecycle controller - the single start/stop entry point.
//!
//! The controller composes the whole pipeline: permission gate, acquisition
//! engine, dispatcher, offline queue, and retry scheduling. It owns every
//! per-session resource (task handles, cancellation token, wake
//! registrations), enforces at most one session per identity, and guarantees
//! that `stop` releases everything - no leaked watchers, timers, or wake
//! sources.
//!
//! # Session anatomy
//!
//! One [`TrackingSession`] holds four tasks sharing a cancellation token:
//! the continuous watcher, the safety-net poller, the telemetry dispatcher,
//! and the foreground retry timer. The retry timer re-arms the one-off
//! background wake and drains the offline queue every couple of minutes, so
//! retry delivery works even on hosts with no background wake support.
//!
//! # Failure posture
//!
//! Nothing here surfaces errors to the caller. A refused gate, a dead
//! watcher, an unreachable store - all degrade to logs, queued records, or
//! a session that simply does not start. The only caller-visible signal is
//! [`StartOutcome`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::acquisition::{AcquisitionConfig, AcquisitionEngine};
use crate::dispatch::TelemetryDispatcher;
use crate::geocode::{Geocoder, GeocodeThrottler, GeocodeThrottlerConfig};
use crate::permission::{PermissionGate, PermissionGateConfig, PermissionProbe};
use crate::position::{LocationSource, PositionSample};
use crate::queue::OfflineQueue;
use crate::record::Identity;
use crate::scheduler::{flush_tag, SchedulerConfig, SyncScheduler, WakeScheduler};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::store::DurableStore;
use crate::writer::{ConnectivityProbe, RemoteStore, TelemetryWriter};

/// Default capacity of the per-session sample channel.
pub const DEFAULT_SAMPLE_BUFFER: usize = 16;

/// How long `stop` waits for a task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the whole tracking pipeline.
#[derive(Debug, Clone, Default)]
pub struct TrackingConfig {
    /// Acquisition engine settings.
    pub acquisition: AcquisitionConfig,

    /// Enrichment throttle settings.
    pub geocode: GeocodeThrottlerConfig,

    /// Permission gate settings.
    pub gate: PermissionGateConfig,

    /// Retry scheduling settings.
    pub scheduler: SchedulerConfig,
}

/// Result of a `start` call.
///
/// All three outcomes are normal control flow; none is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session was created.
    Started,

    /// A session already exists for this identity; nothing changed.
    AlreadyActive,

    /// The permission gate refused (role not tracked, or platform
    /// permission denied/unsupported). Nothing was allocated.
    NotPermitted,
}

/// Live resources of one tracked identity.
struct TrackingSession {
    identity: Identity,
    shutdown: CancellationToken,
    sample_tx: mpsc::Sender<PositionSample>,
    scheduler: Arc<SyncScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

/// Composes and drives the location telemetry pipeline.
pub struct TrackingController<L, P, G, S>
where
    L: LocationSource,
    P: PermissionProbe,
    G: Geocoder,
    S: RemoteStore,
{
    source: Arc<L>,
    gate: PermissionGate<P>,
    throttler: Arc<GeocodeThrottler<G>>,
    writer: Arc<TelemetryWriter<S>>,
    queue: Arc<OfflineQueue>,
    wake: Arc<dyn WakeScheduler>,
    connectivity: Arc<dyn ConnectivityProbe>,
    stats: Arc<PipelineStats>,
    config: TrackingConfig,
    sessions: Mutex<HashMap<String, TrackingSession>>,
}

impl<L, P, G, S> TrackingController<L, P, G, S>
where
    L: LocationSource + 'static,
    P: PermissionProbe + 'static,
    G: Geocoder + 'static,
    S: RemoteStore + 'static,
{
    /// Wire up the pipeline from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<L>,
        probe: P,
        geocoder: Arc<G>,
        remote: Arc<S>,
        durable: Arc<dyn DurableStore>,
        wake: Arc<dyn WakeScheduler>,
        connectivity: Arc<dyn ConnectivityProbe>,
        config: TrackingConfig,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let queue = Arc::new(OfflineQueue::new(durable, Arc::clone(&stats)));
        let writer = Arc::new(TelemetryWriter::new(
            remote,
            Arc::clone(&queue),
            Arc::clone(&connectivity),
            Arc::clone(&stats),
        ));
        let throttler = Arc::new(GeocodeThrottler::with_config(
            geocoder,
            Arc::clone(&stats),
            config.geocode.clone(),
        ));
        let gate = PermissionGate::with_config(probe, config.gate.clone());

        Self {
            source,
            gate,
            throttler,
            writer,
            queue,
            wake,
            connectivity,
            stats,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking an identity.
    ///
    /// Idempotent: a second start for the same user is a no-op. A refused
    /// gate allocates nothing and is only logged.
    pub async fn start(&self, identity: Identity) -> StartOutcome {
        let mut sessions = self.sessions.lock().await;

        if sessions.contains_key(&identity.user_id) {
            debug!(user_id = %identity.user_id, "Tracking already active, ignoring start");
            return StartOutcome::AlreadyActive;
        }

        if !self.gate.can_track(&identity.role) {
            info!(
                user_id = %identity.user_id,
                role = %identity.role,
                "Role is not tracked, tracking not started"
            );
            return StartOutcome::NotPermitted;
        }

        let permission = self.gate.platform_permission().await;
        if !permission.allows_tracking() {
            info!(
                user_id = %identity.user_id,
                permission = %permission,
                "Location permission refused, tracking not started"
            );
            return StartOutcome::NotPermitted;
        }

        let shutdown = CancellationToken::new();
        let (sample_tx, sample_rx) = mpsc::channel(DEFAULT_SAMPLE_BUFFER);

        let engine = AcquisitionEngine::with_config(
            Arc::clone(&self.source),
            sample_tx.clone(),
            Arc::clone(&self.stats),
            self.config.acquisition.clone(),
        );
        let engine_handles = engine.start(shutdown.clone());

        let dispatcher = TelemetryDispatcher::new(
            sample_rx,
            identity.clone(),
            Arc::clone(&self.throttler),
            Arc::clone(&self.writer),
            Arc::clone(&self.connectivity),
        );
        let dispatcher_handle = dispatcher.start(shutdown.clone());

        let scheduler = Arc::new(SyncScheduler::new(
            Arc::clone(&self.wake),
            flush_tag(&identity.user_id),
            self.config.scheduler.clone(),
        ));
        scheduler.register();

        let retry_handle = self.spawn_retry_timer(Arc::clone(&scheduler), shutdown.clone());

        info!(
            user_id = %identity.user_id,
            display_name = %identity.display_name,
            "Tracking session started"
        );

        sessions.insert(
            identity.user_id.clone(),
            TrackingSession {
                identity,
                shutdown,
                sample_tx,
                scheduler,
                tasks: vec![
                    engine_handles.watcher,
                    engine_handles.poller,
                    dispatcher_handle,
                    retry_handle,
                ],
            },
        );

        StartOutcome::Started
    }

    /// Stop tracking an identity.
    ///
    /// No-op when no session exists. Cancels the watcher, both timers, and
    /// the wake registrations; safe to call from any teardown path.
    pub async fn stop(&self, user_id: &str) {
        let session = self.sessions.lock().await.remove(user_id);
        match session {
            Some(session) => self.teardown(session).await,
            None => debug!(user_id, "No tracking session to stop"),
        }
    }

    /// Stop every active session.
    pub async fn stop_all(&self) {
        let sessions: Vec<TrackingSession> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            self.teardown(session).await;
        }
    }

    /// React to an identity change from the session collaborator.
    ///
    /// Sign-out stops everything; sign-in stops any other user's session
    /// and starts the new identity.
    pub async fn handle_auth_change(&self, identity: Option<Identity>) {
        match identity {
            None => self.stop_all().await,
            Some(identity) => {
                let others: Vec<String> = {
                    let sessions = self.sessions.lock().await;
                    sessions
                        .keys()
                        .filter(|user_id| **user_id != identity.user_id)
                        .cloned()
                        .collect()
                };
                for user_id in others {
                    self.stop(&user_id).await;
                }
                self.start(identity).await;
            }
        }
    }

    /// Handle a background wake delivered by the host.
    ///
    /// Drains the offline queue, then feeds one fresh reading through the
    /// normal pipeline. Wakes for unknown tags (for example delivered late,
    /// after `stop`) are ignored.
    pub async fn handle_wake(&self, tag: &str) {
        let sample_tx = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .find(|session| session.scheduler.tag() == tag)
                .map(|session| session.sample_tx.clone())
        };

        let Some(sample_tx) = sample_tx else {
            debug!(tag, "Wake for unknown tag, ignoring");
            return;
        };

        debug!(tag, "Background wake received");
        self.queue.drain(&self.writer).await;

        match self
            .source
            .current_position(self.config.acquisition.poll_request)
            .await
        {
            Ok(sample) => {
                self.stats.record_sample();
                let _ = sample_tx.send(sample).await;
            }
            Err(e) => {
                debug!(tag, error = %e, "Wake reading failed");
                self.stats.record_reading_failure();
            }
        }
    }

    /// Spawn a listener applying identity changes to the controller.
    ///
    /// The current value is applied immediately, then every change until
    /// the channel closes or `shutdown` fires.
    pub fn spawn_auth_listener(
        self: Arc<Self>,
        mut auth_rx: watch::Receiver<Option<Identity>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let current = auth_rx.borrow_and_update().clone();
            self.handle_auth_change(current).await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        debug!("Auth listener stopping");
                        break;
                    }

                    changed = auth_rx.changed() => {
                        if changed.is_err() {
                            debug!("Auth channel closed, listener stopping");
                            break;
                        }
                        let identity = auth_rx.borrow_and_update().clone();
                        self.handle_auth_change(identity).await;
                    }
                }
            }
        })
    }

    /// True if a session is active for this user.
    pub async fn is_tracking(&self, user_id: &str) -> bool {
        self.sessions.lock().await.contains_key(user_id)
    }

    /// Number of active sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// The shared offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Snapshot of the pipeline counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Foreground retry timer: re-arms the one-off wake and drains the
    /// queue on a fixed cadence, independent of platform wake support.
    fn spawn_retry_timer(
        &self,
        scheduler: Arc<SyncScheduler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let writer = Arc::clone(&self.writer);
        let retry_interval = self.config.scheduler.retry_interval;

        tokio::spawn(async move {
            debug!(
                interval_secs = retry_interval.as_secs(),
                "Foreground retry timer started"
            );

            let mut interval = tokio::time::interval(retry_interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        debug!("Foreground retry timer stopping");
                        break;
                    }

                    _ = interval.tick() => {
                        scheduler.refresh_one_off();
                        if !queue.is_empty() {
                            queue.drain(&writer).await;
                        }
                    }
                }
            }
        })
    }

    async fn teardown(&self, mut session: TrackingSession) {
        session.shutdown.cancel();
        session.scheduler.unregister();

        for mut task in session.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        info!(user_id = %session.identity.user_id, "Tracking session stopped");
    }
}
