//! Telemetry dispatcher - the consumer end of the sample channel.
//!
//! One dispatcher task runs per tracking session. It turns every accepted
//! [`PositionSample`] into a [`TelemetryRecord`] (identity, connectivity
//! flag, throttled enrichment) and hands it to the writer. Samples from the
//! watcher and the safety-net poller arrive interleaved; each is processed
//! independently.
//!
//! After a successful direct delivery the dispatcher checks the offline
//! queue: records waiting there mean the network was down a moment ago and
//! has evidently recovered, so it drains opportunistically instead of
//! waiting for the next scheduled retry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::geocode::{Geocoder, GeocodeThrottler};
use crate::position::PositionSample;
use crate::record::{Identity, TelemetryRecord};
use crate::writer::{ConnectivityProbe, RemoteStore, TelemetryWriter, WriteOutcome};

/// Consumes samples and drives the dual write.
pub struct TelemetryDispatcher<G: Geocoder, S: RemoteStore> {
    sample_rx: mpsc::Receiver<PositionSample>,
    identity: Identity,
    throttler: Arc<GeocodeThrottler<G>>,
    writer: Arc<TelemetryWriter<S>>,
    connectivity: Arc<dyn ConnectivityProbe>,
}

impl<G, S> TelemetryDispatcher<G, S>
where
    G: Geocoder + 'static,
    S: RemoteStore + 'static,
{
    /// Create a dispatcher for one session.
    pub fn new(
        sample_rx: mpsc::Receiver<PositionSample>,
        identity: Identity,
        throttler: Arc<GeocodeThrottler<G>>,
        writer: Arc<TelemetryWriter<S>>,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            sample_rx,
            identity,
            throttler,
            writer,
            connectivity,
        }
    }

    /// Start the dispatcher task.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Run the consume loop.
    async fn run(mut self, shutdown: CancellationToken) {
        debug!(user_id = %self.identity.user_id, "Telemetry dispatcher started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Telemetry dispatcher stopping");
                    break;
                }

                sample = self.sample_rx.recv() => {
                    match sample {
                        Some(sample) => self.process(sample).await,
                        None => {
                            debug!("Sample channel closed, telemetry dispatcher stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Enrich, build, and write one record.
    async fn process(&self, sample: PositionSample) {
        let address = self.throttler.maybe_enrich(&sample).await;
        let record = TelemetryRecord::from_sample(
            &self.identity,
            &sample,
            address,
            self.connectivity.is_online(),
        );

        let outcome = self.writer.write(record).await;

        if outcome == WriteOutcome::Delivered && !self.writer.queue().is_empty() {
            debug!("Remote store reachable again, draining offline queue");
            self.writer.queue().drain(&self.writer).await;
        }
    }
}
