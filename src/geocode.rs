//! Reverse-geocode enrichment with rate limiting.
//!
//! Geocoding providers are rate-limited and slow compared to the position
//! cadence, so enrichment is best-effort: the [`GeocodeThrottler`] only
//! issues a call when the sample is accurate enough to be worth naming and
//! the throttle window since the last successful call has elapsed. A skipped
//! or failed enrichment never blocks or retries - the record simply proceeds
//! without an address.
//!
//! # Throttle law
//!
//! No two successful geocode calls happen within the configured window
//! (default 30 seconds). The window timestamp advances only on success, and
//! the state is locked across the call so overlapping samples cannot both
//! slip through.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::position::PositionSample;
use crate::stats::PipelineStats;

/// Default minimum interval between successful geocode calls.
pub const DEFAULT_MIN_INTERVAL_SECS: u64 = 30;

/// Default accuracy cutoff - coarser samples are not worth naming.
pub const DEFAULT_MAX_ACCURACY_METERS: f64 = 100.0;

/// Default public Nominatim reverse endpoint.
pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

/// Default HTTP timeout for reverse-geocode requests.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the reverse-geocoding service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GeocodeError {
    /// HTTP request failed or timed out.
    #[error("Reverse geocode request failed: {0}")]
    Http(String),

    /// Response could not be parsed.
    #[error("Failed to parse reverse geocode response: {0}")]
    Parse(String),

    /// The service had no address for the coordinates.
    #[error("No address found for coordinates")]
    NoResult,
}

/// Reverse-geocoding collaborator.
pub trait Geocoder: Send + Sync {
    /// Resolve coordinates to a human-readable address.
    fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> impl Future<Output = Result<String, GeocodeError>> + Send;
}

/// Configuration for the geocode throttler.
#[derive(Debug, Clone)]
pub struct GeocodeThrottlerConfig {
    /// Minimum interval between successful geocode calls.
    pub min_interval: Duration,

    /// Samples with accuracy at or above this radius skip enrichment.
    pub max_accuracy_meters: f64,
}

impl Default for GeocodeThrottlerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(DEFAULT_MIN_INTERVAL_SECS),
            max_accuracy_meters: DEFAULT_MAX_ACCURACY_METERS,
        }
    }
}

/// Rate-limited enrichment wrapper around a [`Geocoder`].
pub struct GeocodeThrottler<G: Geocoder> {
    geocoder: Arc<G>,
    config: GeocodeThrottlerConfig,
    stats: Arc<PipelineStats>,

    /// Instant of the last successful call. Held locked across the call so
    /// concurrent samples cannot both pass the window check.
    last_geocode: Mutex<Option<Instant>>,
}

impl<G: Geocoder> GeocodeThrottler<G> {
    /// Create a throttler with default settings.
    pub fn new(geocoder: Arc<G>, stats: Arc<PipelineStats>) -> Self {
        Self::with_config(geocoder, stats, GeocodeThrottlerConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(
        geocoder: Arc<G>,
        stats: Arc<PipelineStats>,
        config: GeocodeThrottlerConfig,
    ) -> Self {
        Self {
            geocoder,
            config,
            stats,
            last_geocode: Mutex::new(None),
        }
    }

    /// Attempt enrichment for a sample.
    ///
    /// Returns the address on success, `None` when the accuracy gate or
    /// throttle window skipped the call, and `None` (logged) on failure.
    pub async fn maybe_enrich(&self, sample: &PositionSample) -> Option<String> {
        if sample.accuracy_meters >= self.config.max_accuracy_meters {
            trace!(
                accuracy_meters = sample.accuracy_meters,
                "Sample too coarse for reverse geocoding"
            );
            self.stats.record_geocode_skipped();
            return None;
        }

        let mut last = self.last_geocode.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.config.min_interval {
                trace!("Geocode throttle window open, skipping enrichment");
                self.stats.record_geocode_skipped();
                return None;
            }
        }

        match self
            .geocoder
            .reverse_geocode(sample.latitude, sample.longitude)
            .await
        {
            Ok(address) => {
                *last = Some(Instant::now());
                self.stats.record_geocode_call();
                trace!(address = %address, "Reverse geocode succeeded");
                Some(address)
            }
            Err(e) => {
                // Window untouched - a failure doesn't consume the budget.
                warn!(error = %e, "Reverse geocode failed, record proceeds without address");
                None
            }
        }
    }
}

/// Nominatim reverse-geocode response.
///
/// Our own type, decoupled from the wire format; only the field we use.
/// Error responses carry no `display_name`.
#[derive(Debug, Deserialize)]
struct ReversePlace {
    display_name: Option<String>,
}

/// Reverse geocoder backed by a Nominatim endpoint.
///
/// Uses a reusable `reqwest::Client` with connection pooling and its own
/// request timeout, independent of the pipeline's pacing.
pub struct NominatimGeocoder {
    http: reqwest::Client,
    endpoint: String,
}

impl NominatimGeocoder {
    /// Create a client against a specific endpoint.
    pub fn new(endpoint: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .user_agent(concat!("fieldtrack/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build HTTP client");

        Self { http, endpoint }
    }

    /// Create a client against the public Nominatim endpoint.
    pub fn public() -> Self {
        Self::new(DEFAULT_NOMINATIM_URL.to_string())
    }
}

impl Geocoder for NominatimGeocoder {
    async fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Result<String, GeocodeError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("format", "jsonv2"),
                ("lat", latitude.to_string().as_str()),
                ("lon", longitude.to_string().as_str()),
            ])
            .send()
            .await
            .map_err(|e| GeocodeError::Http(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GeocodeError::Http(e.to_string()))?;

        let place: ReversePlace =
            serde_json::from_slice(&bytes).map_err(|e| GeocodeError::Parse(e.to_string()))?;

        place.display_name.ok_or(GeocodeError::NoResult)
    }
}
