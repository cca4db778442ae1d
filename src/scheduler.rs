//! Background wake registration for offline-queue retries.
//!
//! Retries must happen even when the application is not in the foreground.
//! The host platform may offer background wake-ups through the
//! [`WakeScheduler`] collaborator; the capability is optional and may be
//! partially granted, so the per-session [`SyncScheduler`] walks a small
//! state machine:
//!
//! ```text
//! Unregistered → OneOff → Periodic (if supported and granted)
//!            ↑___________________________________|   (unregister on stop)
//! ```
//!
//! Registration is replace-not-append by contract: registering a tag that
//! is already registered replaces the existing wake source, so re-runs of
//! the registration path never accumulate duplicates.
//!
//! Core correctness never depends on the capability: the lifecycle
//! controller runs its own foreground retry timer regardless, and
//! [`NoopWakeScheduler`] serves hosts with no background execution at all.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

/// Logical tag prefix for queue-flush wake requests.
pub const FLUSH_TAG: &str = "flush-telemetry";

/// Default minimum interval for periodic background wakes.
pub const DEFAULT_PERIODIC_WAKE_SECS: u64 = 300;

/// Default cadence of the foreground retry timer.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 120;

/// Build the flush tag for one tracked user.
pub fn flush_tag(user_id: &str) -> String {
    format!("{FLUSH_TAG}:{user_id}")
}

/// Errors from wake registration.
///
/// All variants are degradations, never fatal - the foreground timer is the
/// baseline retry path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WakeError {
    /// The platform has no background wake support.
    #[error("Background wake not supported on this platform")]
    Unsupported,

    /// The platform refused the wake permission.
    #[error("Background wake permission denied")]
    PermissionDenied,

    /// Registration failed for another reason.
    #[error("Wake registration failed: {0}")]
    Failed(String),
}

/// Background execution collaborator.
///
/// Registering an already-registered tag replaces the wake source
/// (idempotent re-registration). Wake delivery arrives through the host
/// calling [`TrackingController::handle_wake`](crate::controller::TrackingController::handle_wake)
/// with the registered tag.
pub trait WakeScheduler: Send + Sync {
    /// Request a single wake under `tag`.
    fn register_one_off(&self, tag: &str) -> Result<(), WakeError>;

    /// Whether the platform offers periodic wakes at all.
    fn supports_periodic(&self) -> bool;

    /// Request recurring wakes under `tag`, at most every `min_interval`.
    fn register_periodic(&self, tag: &str, min_interval: Duration) -> Result<(), WakeError>;

    /// Cancel any wake registered under `tag`.
    fn unregister(&self, tag: &str);
}

/// Wake scheduler for hosts without background execution.
///
/// Accepts one-off registrations (which simply never fire) and reports no
/// periodic support. Sessions run correctly against it because the
/// foreground retry timer does not depend on wakes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWakeScheduler;

impl WakeScheduler for NoopWakeScheduler {
    fn register_one_off(&self, _tag: &str) -> Result<(), WakeError> {
        Ok(())
    }

    fn supports_periodic(&self) -> bool {
        false
    }

    fn register_periodic(&self, _tag: &str, _min_interval: Duration) -> Result<(), WakeError> {
        Err(WakeError::Unsupported)
    }

    fn unregister(&self, _tag: &str) {}
}

/// Registration state of one session's wake sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeRegistration {
    /// No wake registered.
    #[default]
    Unregistered,
    /// One-off wake registered.
    OneOff,
    /// Periodic wake registered (implies the one-off path worked too).
    Periodic,
}

/// Configuration for retry scheduling.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cadence of the foreground retry timer.
    pub retry_interval: Duration,

    /// Minimum interval requested for periodic background wakes.
    pub periodic_min_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            periodic_min_interval: Duration::from_secs(DEFAULT_PERIODIC_WAKE_SECS),
        }
    }
}

/// Per-session wake registration driver.
pub struct SyncScheduler {
    wake: Arc<dyn WakeScheduler>,
    tag: String,
    config: SchedulerConfig,
    registration: Mutex<WakeRegistration>,
}

impl SyncScheduler {
    /// Create a scheduler for one session's flush tag.
    pub fn new(wake: Arc<dyn WakeScheduler>, tag: String, config: SchedulerConfig) -> Self {
        Self {
            wake,
            tag,
            config,
            registration: Mutex::new(WakeRegistration::Unregistered),
        }
    }

    /// The session's wake tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Current registration state.
    pub fn registration(&self) -> WakeRegistration {
        *self.registration.lock().unwrap()
    }

    /// Register wake sources for a starting session.
    ///
    /// Always requests the one-off wake; upgrades to periodic when the
    /// platform supports it and grants the request.
    pub fn register(&self) {
        let mut registration = self.registration.lock().unwrap();

        match self.wake.register_one_off(&self.tag) {
            Ok(()) => {
                *registration = WakeRegistration::OneOff;
                debug!(tag = %self.tag, "One-off wake registered");
            }
            Err(e) => {
                debug!(tag = %self.tag, error = %e, "One-off wake unavailable");
                *registration = WakeRegistration::Unregistered;
                return;
            }
        }

        if self.wake.supports_periodic() {
            match self
                .wake
                .register_periodic(&self.tag, self.config.periodic_min_interval)
            {
                Ok(()) => {
                    *registration = WakeRegistration::Periodic;
                    debug!(
                        tag = %self.tag,
                        min_interval_secs = self.config.periodic_min_interval.as_secs(),
                        "Periodic wake registered"
                    );
                }
                Err(e) => {
                    debug!(tag = %self.tag, error = %e, "Periodic wake not granted, keeping one-off");
                }
            }
        }
    }

    /// Re-arm the one-off wake.
    ///
    /// Called by the foreground retry timer; replace-not-append makes this
    /// safe to repeat indefinitely.
    pub fn refresh_one_off(&self) {
        match self.wake.register_one_off(&self.tag) {
            Ok(()) => {
                let mut registration = self.registration.lock().unwrap();
                if *registration == WakeRegistration::Unregistered {
                    *registration = WakeRegistration::OneOff;
                }
                trace!(tag = %self.tag, "One-off wake re-armed");
            }
            Err(e) => {
                trace!(tag = %self.tag, error = %e, "One-off wake re-arm failed");
            }
        }
    }

    /// Cancel all wake sources for this session.
    pub fn unregister(&self) {
        self.wake.unregister(&self.tag);
        *self.registration.lock().unwrap() = WakeRegistration::Unregistered;
        debug!(tag = %self.tag, "Wake registrations cancelled");
    }
}
