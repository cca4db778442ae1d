//! Identity-tagged telemetry records and their queued form.
//!
//! A [`TelemetryRecord`] is a [`PositionSample`](crate::position::PositionSample)
//! enriched with the tracked user's identity, an optional reverse-geocoded
//! address, and the connectivity flag observed at build time. Two remote
//! projections are persisted per record:
//!
//! - **current location** - one row per user, overwritten on every update
//! - **history entry** - append-only audit trail, never overwritten
//!
//! When a remote write fails the record is wrapped in a
//! [`QueuedTelemetryRecord`] and parked in the offline queue until a retry
//! delivers it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::position::PositionSample;

/// Authenticated identity of the tracked user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user identifier (remote-store document key).
    pub user_id: String,

    /// Human-readable name shown on dashboards.
    pub display_name: String,

    /// Role string used by the permission gate.
    pub role: String,
}

impl Identity {
    /// Convenience constructor.
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role: role.into(),
        }
    }
}

/// Enriched, identity-tagged position ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Owner of this record.
    pub user_id: String,

    /// Display name at the time of capture.
    pub display_name: String,

    /// Latitude in degrees.
    pub latitude: f64,

    /// Longitude in degrees.
    pub longitude: f64,

    /// Reported accuracy radius in meters.
    pub accuracy_meters: f64,

    /// Reverse-geocoded address, when enrichment ran and succeeded.
    pub address: Option<String>,

    /// Whether the platform reported network connectivity at build time.
    pub is_online: bool,

    /// When the record was built.
    pub recorded_at: DateTime<Utc>,
}

impl TelemetryRecord {
    /// Build a record from a raw sample plus identity and enrichment.
    pub fn from_sample(
        identity: &Identity,
        sample: &PositionSample,
        address: Option<String>,
        is_online: bool,
    ) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy_meters: sample.accuracy_meters,
            address,
            is_online,
            recorded_at: Utc::now(),
        }
    }
}

/// A telemetry record parked in the offline retry queue.
///
/// `queued_at` is the ordering and dedupe key: epoch milliseconds, strictly
/// monotonic within the process (assigned by the queue, not by callers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTelemetryRecord {
    /// Queue key - epoch milliseconds, strictly increasing per process.
    pub queued_at: u64,

    /// The undelivered record.
    pub record: TelemetryRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PositionSample {
        PositionSample::new(-23.5505, -46.6333, 15.0)
    }

    #[test]
    fn test_record_from_sample_carries_identity() {
        let identity = Identity::new("u-1", "Ana", "fretista");
        let record = TelemetryRecord::from_sample(&identity, &sample(), None, true);

        assert_eq!(record.user_id, "u-1");
        assert_eq!(record.display_name, "Ana");
        assert_eq!(record.latitude, -23.5505);
        assert_eq!(record.longitude, -46.6333);
        assert_eq!(record.accuracy_meters, 15.0);
        assert!(record.address.is_none());
        assert!(record.is_online);
    }

    #[test]
    fn test_record_keeps_enrichment() {
        let identity = Identity::new("u-1", "Ana", "fretista");
        let record = TelemetryRecord::from_sample(
            &identity,
            &sample(),
            Some("Av. Paulista, São Paulo".to_string()),
            false,
        );

        assert_eq!(record.address.as_deref(), Some("Av. Paulista, São Paulo"));
        assert!(!record.is_online);
    }

    #[test]
    fn test_queued_record_persistence_format() {
        let identity = Identity::new("u-1", "Ana", "fretista");
        let queued = QueuedTelemetryRecord {
            queued_at: 1_700_000_000_123,
            record: TelemetryRecord::from_sample(&identity, &sample(), None, false),
        };

        let bytes = serde_json::to_vec(&queued).unwrap();
        let restored: QueuedTelemetryRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored, queued);
    }
}
