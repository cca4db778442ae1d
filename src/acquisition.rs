//! Position acquisition engine - redundant producers of raw samples.
//!
//! Two independent producers feed the same downstream pipeline:
//!
//! 1. **Continuous watcher** - a platform watch delivering high-accuracy
//!    updates as the device moves
//! 2. **Safety-net poller** - one fresh reading every couple of minutes,
//!    regardless of the watcher
//!
//! The redundancy is deliberate: on some platforms a continuous watch dies
//! silently without ever reporting an error. The poller guarantees a lower
//! bound on update cadence even then. No ordering is guaranteed between the
//! two producers; every sample is forwarded independently, with
//! backpressure, so nothing is dropped between acquisition and the writer.
//!
//! # Failure policy
//!
//! A failed reading never stops the session - it is logged and the tick is
//! skipped, or substituted per [`ReadingFailurePolicy`]. The
//! `UseFixedFallback` variant fabricates a plausible-looking sample at fixed
//! coordinates; it exists for parity with legacy deployments, is never the
//! default, and every substitution is logged at warn level. Fabricated
//! samples carry a deliberately coarse accuracy so they are never
//! reverse-geocoded as if they were real fixes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::position::{LocationError, LocationSource, PositionRequest, PositionSample};
use crate::stats::PipelineStats;

/// Default safety-net poll interval.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 120;

/// Accuracy stamped on fabricated fallback samples, coarse enough to skip
/// enrichment.
pub const FIXED_FALLBACK_ACCURACY_METERS: f64 = 100_000.0;

/// What to do when a single reading fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadingFailurePolicy {
    /// Repeat the last known real reading, or skip the tick if there is
    /// none. The default.
    UseLastKnownOrSkip,

    /// Substitute a fixed coordinate pair. Reports a location that was
    /// never measured - opt in only where the legacy behavior is required.
    UseFixedFallback { latitude: f64, longitude: f64 },
}

/// Configuration for the acquisition engine.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Options for the continuous watch.
    pub watch_request: PositionRequest,

    /// Options for safety-net readings.
    pub poll_request: PositionRequest,

    /// Safety-net poll cadence.
    pub poll_interval: Duration,

    /// Per-reading failure behavior.
    pub failure_policy: ReadingFailurePolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            watch_request: PositionRequest {
                high_accuracy: true,
                timeout: Duration::from_secs(20),
                max_age: Duration::from_secs(30),
            },
            poll_request: PositionRequest {
                high_accuracy: true,
                timeout: Duration::from_secs(15),
                max_age: Duration::from_secs(60),
            },
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            failure_policy: ReadingFailurePolicy::UseLastKnownOrSkip,
        }
    }
}

/// Join handles for the engine's two producer tasks.
pub struct EngineHandles {
    /// Continuous watcher task.
    pub watcher: JoinHandle<()>,

    /// Safety-net poller task.
    pub poller: JoinHandle<()>,
}

/// Produces [`PositionSample`]s from the platform location source.
pub struct AcquisitionEngine<L: LocationSource> {
    source: Arc<L>,
    sample_tx: mpsc::Sender<PositionSample>,
    config: AcquisitionConfig,
    stats: Arc<PipelineStats>,

    /// Last real reading either producer forwarded.
    last_known: Arc<Mutex<Option<PositionSample>>>,
}

impl<L: LocationSource> Clone for AcquisitionEngine<L> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            sample_tx: self.sample_tx.clone(),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
            last_known: Arc::clone(&self.last_known),
        }
    }
}

impl<L: LocationSource + 'static> AcquisitionEngine<L> {
    /// Create an engine with default settings.
    pub fn new(
        source: Arc<L>,
        sample_tx: mpsc::Sender<PositionSample>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self::with_config(source, sample_tx, stats, AcquisitionConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(
        source: Arc<L>,
        sample_tx: mpsc::Sender<PositionSample>,
        stats: Arc<PipelineStats>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            source,
            sample_tx,
            config,
            stats,
            last_known: Arc::new(Mutex::new(None)),
        }
    }

    /// Start both producer tasks.
    pub fn start(self, shutdown: CancellationToken) -> EngineHandles {
        let watcher_engine = self.clone();
        let watcher_shutdown = shutdown.clone();
        let watcher = tokio::spawn(async move {
            watcher_engine.run_watcher(watcher_shutdown).await;
        });

        let poller = tokio::spawn(async move {
            self.run_poller(shutdown).await;
        });

        EngineHandles { watcher, poller }
    }

    /// Continuous watcher loop.
    ///
    /// Dropping the update receiver on exit releases the platform watch
    /// handle.
    async fn run_watcher(self, shutdown: CancellationToken) {
        debug!("Continuous watcher started");
        let mut updates = self.source.watch_position(self.config.watch_request);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Continuous watcher stopping");
                    break;
                }

                update = updates.recv() => {
                    match update {
                        Some(Ok(sample)) => {
                            trace!(
                                latitude = sample.latitude,
                                longitude = sample.longitude,
                                accuracy_meters = sample.accuracy_meters,
                                "Watch reading received"
                            );
                            if !self.forward(sample).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            if !self.handle_reading_failure(&e).await {
                                break;
                            }
                        }
                        None => {
                            // Some platforms end a watch without an error;
                            // the safety-net poller keeps the session fed.
                            warn!("Continuous watch ended, relying on safety-net poller");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Safety-net poller loop.
    async fn run_poller(self, shutdown: CancellationToken) {
        debug!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Safety-net poller started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        // The watcher covers startup; skip the immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Safety-net poller stopping");
                    break;
                }

                _ = interval.tick() => {
                    match self.source.current_position(self.config.poll_request).await {
                        Ok(sample) => {
                            trace!(
                                latitude = sample.latitude,
                                longitude = sample.longitude,
                                "Safety-net reading received"
                            );
                            if !self.forward(sample).await {
                                break;
                            }
                        }
                        Err(e) => {
                            if !self.handle_reading_failure(&e).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Record a real reading and push it downstream.
    async fn forward(&self, sample: PositionSample) -> bool {
        *self.last_known.lock().unwrap() = Some(sample);
        self.send(sample).await
    }

    /// Push a sample downstream with backpressure.
    ///
    /// Returns false when the pipeline has shut down.
    async fn send(&self, sample: PositionSample) -> bool {
        self.stats.record_sample();
        if self.sample_tx.send(sample).await.is_err() {
            debug!("Sample channel closed, stopping producer");
            return false;
        }
        true
    }

    /// Apply the configured policy to a failed reading.
    async fn handle_reading_failure(&self, error: &LocationError) -> bool {
        self.stats.record_reading_failure();

        match self.config.failure_policy {
            ReadingFailurePolicy::UseLastKnownOrSkip => {
                let last = *self.last_known.lock().unwrap();
                match last {
                    Some(sample) => {
                        debug!(error = %error, "Reading failed, repeating last known position");
                        self.send(sample).await
                    }
                    None => {
                        debug!(error = %error, "Reading failed, skipping tick");
                        true
                    }
                }
            }
            ReadingFailurePolicy::UseFixedFallback {
                latitude,
                longitude,
            } => {
                warn!(
                    error = %error,
                    latitude,
                    longitude,
                    "Reading failed, substituting fixed fallback coordinates"
                );
                self.send(PositionSample::new(
                    latitude,
                    longitude,
                    FIXED_FALLBACK_ACCURACY_METERS,
                ))
                .await
            }
        }
    }
}
