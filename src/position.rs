//! Core position types and the platform location collaborator.
//!
//! This module defines the raw data produced by the device's location
//! hardware and the [`LocationSource`] trait the rest of the pipeline
//! consumes it through:
//!
//! - [`PositionSample`] - one raw reading from the location sensor
//! - [`PositionRequest`] - acquisition options (accuracy, timeout, max age)
//! - [`LocationSource`] - platform collaborator producing samples
//!
//! # Watch semantics
//!
//! A continuous watch is represented as an mpsc receiver of readings.
//! Dropping the receiver releases the underlying platform watch handle,
//! so the hardware stops being driven as soon as the consuming task ends.
//! Implementations should stop producing when they observe the channel
//! closed.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// One raw reading from the device's location sensor.
///
/// Ephemeral - samples are consumed by the pipeline and never persisted
/// directly; only the enriched [`TelemetryRecord`](crate::record::TelemetryRecord)
/// built from a sample is stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    /// Latitude in degrees (-90 to 90).
    pub latitude: f64,

    /// Longitude in degrees (-180 to 180).
    pub longitude: f64,

    /// Reported accuracy radius in meters (lower is better).
    pub accuracy_meters: f64,

    /// When the platform captured this reading.
    pub captured_at: DateTime<Utc>,
}

impl PositionSample {
    /// Create a sample captured now.
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            captured_at: Utc::now(),
        }
    }
}

/// Options handed to the platform location API for one acquisition.
///
/// Timeouts and max-age are enforced by the platform implementation, not by
/// this subsystem - a [`LocationSource`] call resolves within its own
/// `timeout` or fails with [`LocationError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRequest {
    /// Request high-accuracy (GPS-grade) readings.
    pub high_accuracy: bool,

    /// How long the platform may spend producing one reading.
    pub timeout: Duration,

    /// Maximum acceptable age of a cached reading.
    pub max_age: Duration,
}

impl Default for PositionRequest {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(20),
            max_age: Duration::from_secs(30),
        }
    }
}

/// Errors reported by the platform for a single reading.
///
/// All variants are transient from the pipeline's point of view: the
/// affected tick is skipped (or replaced per the configured failure policy)
/// and the session continues.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LocationError {
    /// Location permission was revoked mid-session.
    #[error("Location permission revoked")]
    PermissionRevoked,

    /// The platform could not produce a position (no fix, hardware off).
    #[error("Position unavailable: {0}")]
    Unavailable(String),

    /// The reading did not complete within the requested timeout.
    #[error("Position request timed out after {0:?}")]
    Timeout(Duration),
}

/// Platform location API collaborator.
///
/// Produces [`PositionSample`]s either one at a time (`current_position`) or
/// continuously (`watch_position`). Both acquisition modes honor the
/// [`PositionRequest`] they are given.
pub trait LocationSource: Send + Sync {
    /// Take one fresh reading.
    fn current_position(
        &self,
        request: PositionRequest,
    ) -> impl Future<Output = Result<PositionSample, LocationError>> + Send;

    /// Start a continuous watch.
    ///
    /// Readings (and per-reading errors) arrive on the returned receiver
    /// until it is dropped, which releases the platform watch handle.
    fn watch_position(
        &self,
        request: PositionRequest,
    ) -> mpsc::Receiver<Result<PositionSample, LocationError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_new_stamps_capture_time() {
        let before = Utc::now();
        let sample = PositionSample::new(-23.5505, -46.6333, 12.0);
        let after = Utc::now();

        assert_eq!(sample.latitude, -23.5505);
        assert_eq!(sample.longitude, -46.6333);
        assert_eq!(sample.accuracy_meters, 12.0);
        assert!(sample.captured_at >= before && sample.captured_at <= after);
    }

    #[test]
    fn test_default_request() {
        let request = PositionRequest::default();
        assert!(request.high_accuracy);
        assert_eq!(request.timeout, Duration::from_secs(20));
        assert_eq!(request.max_age, Duration::from_secs(30));
    }
}
