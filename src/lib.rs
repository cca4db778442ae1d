//! fieldtrack - location telemetry pipeline for field-logistics tracking.
//!
//! This library acquires a delivery worker's position continuously, enriches
//! it with a rate-limited reverse geocode, and dual-writes every update to a
//! remote document store: a current-location row (overwritten per user) and
//! an append-only history trail. When the network or the store is down,
//! records are parked in a local durable queue and replayed FIFO by
//! background wakes and a foreground retry timer - updates degrade in
//! freshness, never in existence.
//!
//! # Architecture
//!
//! ```text
//! PermissionGate ──gates── TrackingController (start / stop)
//!                               │
//!            ┌──────────────────┼─────────────────────┐
//!      AcquisitionEngine   TelemetryDispatcher   retry timer + wakes
//!      (watcher + poller)        │                     │
//!            └──── samples ──────┤                     │
//!                       GeocodeThrottler               │
//!                                │                     │
//!                         TelemetryWriter ──── OfflineQueue (drain)
//!                                │
//!                      remote store (current + history)
//! ```
//!
//! The continuous watcher and the periodic safety-net poller are
//! deliberately redundant: a platform watch can die silently, and the
//! poller guarantees a lower bound on update cadence regardless.
//!
//! # Collaborators
//!
//! The platform surfaces are traits the host implements:
//! [`LocationSource`](position::LocationSource),
//! [`RemoteStore`](writer::RemoteStore),
//! [`Geocoder`](geocode::Geocoder),
//! [`DurableStore`](store::DurableStore),
//! [`WakeScheduler`](scheduler::WakeScheduler),
//! [`ConnectivityProbe`](writer::ConnectivityProbe), and
//! [`PermissionProbe`](permission::PermissionProbe).
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use fieldtrack::controller::{TrackingController, TrackingConfig};
//! use fieldtrack::record::Identity;
//!
//! let controller = Arc::new(TrackingController::new(
//!     location_source,
//!     permission_probe,
//!     Arc::new(fieldtrack::geocode::NominatimGeocoder::public()),
//!     remote_store,
//!     Arc::new(fieldtrack::store::FileQueueStore::new(queue_dir)?),
//!     wake_scheduler,
//!     connectivity,
//!     TrackingConfig::default(),
//! ));
//!
//! controller.start(Identity::new("u-1", "Ana", "fretista")).await;
//! // ... on sign-out or shutdown:
//! controller.stop("u-1").await;
//! ```

pub mod acquisition;
pub mod controller;
pub mod dispatch;
pub mod geocode;
pub mod logging;
pub mod permission;
pub mod position;
pub mod queue;
pub mod record;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod writer;

pub use controller::{StartOutcome, TrackingConfig, TrackingController};
pub use position::{LocationSource, PositionRequest, PositionSample};
pub use record::{Identity, QueuedTelemetryRecord, TelemetryRecord};

/// Version of the fieldtrack library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
