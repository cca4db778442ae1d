//! Permission gate - decides whether tracking may start.
//!
//! Two independent checks, both required:
//!
//! 1. **Role check** - only configured roles are tracked at all
//! 2. **Platform permission** - the device's location-permission state,
//!    queried through the [`PermissionProbe`] collaborator
//!
//! Some platforms cannot report permission state directly; the gate then
//! falls back to the last answer it persisted (a single small file). A
//! refused gate is a normal, silent outcome - it is logged, never raised as
//! an error, and no tracking resources are allocated.

use std::fs;
use std::future::Future;
use std::path::PathBuf;

use tracing::{debug, warn};

/// Roles tracked by default.
pub const DEFAULT_TRACKED_ROLES: &[&str] = &["fretista"];

/// Platform location-permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformPermission {
    /// Permission granted; acquisition may start immediately.
    Granted,
    /// Permission denied; tracking must not start.
    Denied,
    /// Not yet decided - the platform will prompt on first acquisition.
    Prompt,
    /// The platform has no location capability.
    Unsupported,
}

impl PlatformPermission {
    /// True if tracking may proceed in this state.
    ///
    /// `Prompt` proceeds: the platform raises its own dialog on the first
    /// acquisition and readings fail cleanly if the user refuses.
    pub fn allows_tracking(&self) -> bool {
        matches!(self, Self::Granted | Self::Prompt)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Prompt => "prompt",
            Self::Unsupported => "unsupported",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "granted" => Some(Self::Granted),
            "denied" => Some(Self::Denied),
            "prompt" => Some(Self::Prompt),
            "unsupported" => Some(Self::Unsupported),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlatformPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The platform could not report permission state.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Platform cannot report permission state: {0}")]
pub struct ProbeError(pub String);

/// Platform permission-state collaborator.
pub trait PermissionProbe: Send + Sync {
    /// Query the current location-permission state.
    fn query(&self) -> impl Future<Output = Result<PlatformPermission, ProbeError>> + Send;
}

/// Configuration for the permission gate.
#[derive(Debug, Clone)]
pub struct PermissionGateConfig {
    /// Roles allowed to be tracked.
    pub tracked_roles: Vec<String>,

    /// Where to persist the last successful probe answer, for platforms
    /// that cannot always report state. `None` disables the fallback.
    pub cache_path: Option<PathBuf>,
}

impl Default for PermissionGateConfig {
    fn default() -> Self {
        Self {
            tracked_roles: DEFAULT_TRACKED_ROLES
                .iter()
                .map(|role| role.to_string())
                .collect(),
            cache_path: None,
        }
    }
}

/// Gate deciding whether a tracking session may start.
pub struct PermissionGate<P: PermissionProbe> {
    probe: P,
    config: PermissionGateConfig,
}

impl<P: PermissionProbe> PermissionGate<P> {
    /// Create a gate with default settings.
    pub fn new(probe: P) -> Self {
        Self::with_config(probe, PermissionGateConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(probe: P, config: PermissionGateConfig) -> Self {
        Self { probe, config }
    }

    /// Pure role check: is this role tracked at all?
    pub fn can_track(&self, role: &str) -> bool {
        self.config.tracked_roles.iter().any(|tracked| tracked == role)
    }

    /// Resolve the platform permission state.
    ///
    /// A successful probe answer is persisted; when the probe cannot
    /// report, the persisted answer is used, and absent that the state is
    /// treated as `Unsupported` (tracking refused).
    pub async fn platform_permission(&self) -> PlatformPermission {
        match self.probe.query().await {
            Ok(state) => {
                self.cache_answer(state);
                state
            }
            Err(e) => {
                let cached = self.cached_answer();
                debug!(
                    error = %e,
                    fallback = ?cached,
                    "Permission probe unavailable, using last known answer"
                );
                cached.unwrap_or(PlatformPermission::Unsupported)
            }
        }
    }

    fn cache_answer(&self, state: PlatformPermission) {
        if let Some(path) = &self.config.cache_path {
            if let Err(e) = fs::write(path, state.as_str()) {
                warn!(path = %path.display(), error = %e, "Failed to persist permission state");
            }
        }
    }

    fn cached_answer(&self) -> Option<PlatformPermission> {
        let path = self.config.cache_path.as_ref()?;
        let contents = fs::read_to_string(path).ok()?;
        PlatformPermission::parse(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Mock probe returning a scripted answer.
    struct MockProbe {
        result: Mutex<Result<PlatformPermission, ProbeError>>,
    }

    impl MockProbe {
        fn reporting(state: PlatformPermission) -> Self {
            Self {
                result: Mutex::new(Ok(state)),
            }
        }

        fn unavailable() -> Self {
            Self {
                result: Mutex::new(Err(ProbeError("no permissions API".to_string()))),
            }
        }
    }

    impl PermissionProbe for MockProbe {
        async fn query(&self) -> Result<PlatformPermission, ProbeError> {
            self.result.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_default_roles() {
        let gate = PermissionGate::new(MockProbe::reporting(PlatformPermission::Granted));
        assert!(gate.can_track("fretista"));
        assert!(!gate.can_track("admin"));
        assert!(!gate.can_track(""));
    }

    #[test]
    fn test_custom_roles() {
        let config = PermissionGateConfig {
            tracked_roles: vec!["courier".to_string(), "driver".to_string()],
            cache_path: None,
        };
        let gate =
            PermissionGate::with_config(MockProbe::reporting(PlatformPermission::Granted), config);

        assert!(gate.can_track("courier"));
        assert!(gate.can_track("driver"));
        assert!(!gate.can_track("fretista"));
    }

    #[test]
    fn test_allows_tracking() {
        assert!(PlatformPermission::Granted.allows_tracking());
        assert!(PlatformPermission::Prompt.allows_tracking());
        assert!(!PlatformPermission::Denied.allows_tracking());
        assert!(!PlatformPermission::Unsupported.allows_tracking());
    }

    #[tokio::test]
    async fn test_probe_answer_passes_through() {
        let gate = PermissionGate::new(MockProbe::reporting(PlatformPermission::Denied));
        assert_eq!(
            gate.platform_permission().await,
            PlatformPermission::Denied
        );
    }

    #[tokio::test]
    async fn test_unavailable_probe_without_cache_is_unsupported() {
        let gate = PermissionGate::new(MockProbe::unavailable());
        assert_eq!(
            gate.platform_permission().await,
            PlatformPermission::Unsupported
        );
    }

    #[tokio::test]
    async fn test_successful_probe_persists_answer() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("permission");

        let config = PermissionGateConfig {
            cache_path: Some(cache_path.clone()),
            ..Default::default()
        };
        let gate =
            PermissionGate::with_config(MockProbe::reporting(PlatformPermission::Granted), config);

        assert_eq!(
            gate.platform_permission().await,
            PlatformPermission::Granted
        );
        assert_eq!(fs::read_to_string(&cache_path).unwrap(), "granted");
    }

    #[tokio::test]
    async fn test_unavailable_probe_falls_back_to_cache() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("permission");
        fs::write(&cache_path, "granted").unwrap();

        let config = PermissionGateConfig {
            cache_path: Some(cache_path),
            ..Default::default()
        };
        let gate = PermissionGate::with_config(MockProbe::unavailable(), config);

        assert_eq!(
            gate.platform_permission().await,
            PlatformPermission::Granted
        );
    }

    #[tokio::test]
    async fn test_garbage_cache_is_ignored() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("permission");
        fs::write(&cache_path, "whatever").unwrap();

        let config = PermissionGateConfig {
            cache_path: Some(cache_path),
            ..Default::default()
        };
        let gate = PermissionGate::with_config(MockProbe::unavailable(), config);

        assert_eq!(
            gate.platform_permission().await,
            PlatformPermission::Unsupported
        );
    }
}
