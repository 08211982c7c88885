//! Entity data model: the shapes the activator and reconciler read and
//! write through the [`EntityStore`](crate::store::EntityStore), plus the
//! value types derived from them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for an [`AppVersion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId(Uuid);

impl VersionId {
    /// Create a new random version ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for VersionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier for a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier for a [`SandboxPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(Uuid);

impl PoolId {
    /// Create a new random pool ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for PoolId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Key identifying an activator bucket / reconciler target: one version,
/// one named service within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionService {
    /// The application version.
    pub version: VersionId,
    /// The service name within that version (e.g. `web`, `worker`).
    pub service: String,
}

impl VersionService {
    /// Build a new key.
    pub fn new(version: VersionId, service: impl Into<String>) -> Self {
        Self {
            version,
            service: service.into(),
        }
    }
}

impl fmt::Display for VersionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.version, self.service)
    }
}

/// Concurrency mode for a service, mirrored by [`PoolMode`] on the pool
/// side of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    /// Scale between 0 and infinity based on demand.
    Auto,
    /// Maintain a constant instance count; never scale down.
    Fixed,
}

/// Per-service concurrency configuration, embedded in an [`AppVersion`].
///
/// Invariant: `mode == Auto` ⇒ `num_instances` is ignored; `mode == Fixed`
/// ⇒ `requests_per_instance` and `scale_down_delay` are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConcurrency {
    /// Auto or fixed scaling.
    pub mode: ConcurrencyMode,
    /// Requests per instance capacity (auto mode only). Defaults to 1.
    pub requests_per_instance: Option<u32>,
    /// Fixed instance count (fixed mode only).
    pub num_instances: u32,
    /// Duration string (e.g. `"2m"`, `"15m"`), auto mode only.
    pub scale_down_delay: Option<String>,
    /// Service-level routing port, if configured. See `AppVersion::port`
    /// for the deprecated version-level fallback.
    pub port: Option<u16>,
    /// Opaque container template used when the activator or reconciler
    /// creates a new sandbox for this service.
    pub sandbox_spec: serde_json::Value,
}

impl ServiceConcurrency {
    /// Auto-mode config with the given requests-per-instance capacity and
    /// scale-down delay string.
    pub fn auto(requests_per_instance: u32, scale_down_delay: impl Into<String>) -> Self {
        Self {
            mode: ConcurrencyMode::Auto,
            requests_per_instance: Some(requests_per_instance),
            num_instances: 0,
            scale_down_delay: Some(scale_down_delay.into()),
            port: None,
            sandbox_spec: serde_json::Value::Null,
        }
    }

    /// Fixed-mode config with the given instance count.
    pub fn fixed(num_instances: u32) -> Self {
        Self {
            mode: ConcurrencyMode::Fixed,
            requests_per_instance: None,
            num_instances,
            scale_down_delay: None,
            port: None,
            sandbox_spec: serde_json::Value::Null,
        }
    }
}

/// Lifecycle status of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Created by the reconciler, not yet running.
    Pending,
    /// Healthy and routable.
    Running,
    /// Voluntarily retired by the reconciler. Terminal.
    Stopped,
    /// Involuntary failure reported by the external controller. Terminal.
    Dead,
}

impl SandboxStatus {
    /// `true` for the two terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Dead)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// A single container instance executing one version of one service.
///
/// `spec` is opaque to the core: container execution is an external
/// collaborator (see spec §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Unique ID.
    pub id: SandboxId,
    /// Version this sandbox belongs to.
    pub version: VersionId,
    /// Service name label.
    pub service: String,
    /// Owning pool, if created by the reconciler.
    pub pool: Option<PoolId>,
    /// Opaque container spec/template.
    pub spec: serde_json::Value,
    /// Current lifecycle status.
    pub status: SandboxStatus,
    /// Ordered list of network addresses. The first, with its CIDR suffix
    /// stripped, is the routable host.
    pub network: Vec<String>,
    /// Timestamp of the most recent successful lease acquisition.
    pub last_activity: Option<DateTime<Utc>>,
}

impl Sandbox {
    /// Create a new `Pending` sandbox, optionally owned by a pool. A
    /// `None` pool marks a sandbox created directly by the activator in
    /// direct-creation mode, bypassing the reconciler.
    pub fn pending(
        version: VersionId,
        service: impl Into<String>,
        pool: Option<PoolId>,
        spec: serde_json::Value,
    ) -> Self {
        Self {
            id: SandboxId::new(),
            version,
            service: service.into(),
            pool,
            spec,
            status: SandboxStatus::Pending,
            network: Vec::new(),
            last_activity: None,
        }
    }

    /// The routable host: the first network entry with its CIDR suffix
    /// (`/24` etc.) stripped, if any address is assigned.
    pub fn host(&self) -> Option<&str> {
        self.network
            .first()
            .map(|addr| addr.split('/').next().unwrap_or(addr.as_str()))
    }
}

/// Scaling mode for a [`SandboxPool`], mirroring [`ConcurrencyMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolMode {
    /// Scale between 0 and infinity based on demand.
    Auto,
    /// Maintain a constant instance count.
    Fixed,
}

impl From<ConcurrencyMode> for PoolMode {
    fn from(mode: ConcurrencyMode) -> Self {
        match mode {
            ConcurrencyMode::Auto => Self::Auto,
            ConcurrencyMode::Fixed => Self::Fixed,
        }
    }
}

/// Desired-state record binding a sandbox template to a target instance
/// count.
///
/// Invariants: `ready_instances <= current_instances`; `current_instances`
/// counts all non-`Stopped` sandboxes labelled with this pool;
/// `ready_instances` counts `Running` ones; `desired_instances` is never
/// allowed below `floor` (0 in auto mode, `num_instances` in fixed mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPool {
    /// Unique ID.
    pub id: PoolId,
    /// Service name this pool serves.
    pub service: String,
    /// Version the pool's sandboxes run.
    pub version: VersionId,
    /// Template for new sandbox entities.
    pub sandbox_spec: serde_json::Value,
    /// Auto or fixed.
    pub mode: PoolMode,
    /// Target instance count.
    pub desired_instances: u32,
    /// All non-`Stopped` sandboxes labelled with this pool.
    pub current_instances: u32,
    /// `Running` sandboxes labelled with this pool.
    pub ready_instances: u32,
    /// Duration string; zero/absent means "never retire" (fixed mode).
    pub scale_down_delay: Option<String>,
}

impl SandboxPool {
    /// Construct a freshly created pool with the given floor as its
    /// initial `desired_instances`.
    pub fn new(
        service: impl Into<String>,
        version: VersionId,
        sandbox_spec: serde_json::Value,
        mode: PoolMode,
        floor: u32,
    ) -> Self {
        Self {
            id: PoolId::new(),
            service: service.into(),
            version,
            sandbox_spec,
            mode,
            desired_instances: floor,
            current_instances: 0,
            ready_instances: 0,
            scale_down_delay: None,
        }
    }
}

/// Immutable deployable artifact for an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppVersion {
    /// Unique ID.
    pub id: VersionId,
    /// Per-service concurrency configuration, keyed by service name.
    pub services: HashMap<String, ServiceConcurrency>,
    /// Deprecated version-level routing port fallback (see
    /// `ServiceConcurrency::port` for the preferred, service-level one).
    pub port: Option<u16>,
}

impl AppVersion {
    /// Create an empty version with the given ID.
    pub fn new(id: VersionId) -> Self {
        Self {
            id,
            services: HashMap::new(),
            port: None,
        }
    }

    /// Look up the concurrency config for a service, if declared.
    pub fn service_concurrency(&self, service: &str) -> Option<&ServiceConcurrency> {
        self.services.get(service)
    }

    /// Resolve the routing port for a service: service-level if present,
    /// else the deprecated version-level port, else `3000`.
    pub fn resolve_port(&self, service: &str) -> u16 {
        self.service_concurrency(service)
            .and_then(|sc| sc.port)
            .or(self.port)
            .unwrap_or(3000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_host_strips_cidr() {
        let mut sb = Sandbox::pending(
            VersionId::new(),
            "web",
            Some(PoolId::new()),
            serde_json::json!({}),
        );
        sb.network = vec!["10.0.0.100/24".to_string()];
        assert_eq!(sb.host(), Some("10.0.0.100"));
    }

    #[test]
    fn sandbox_host_none_when_unassigned() {
        let sb = Sandbox::pending(
            VersionId::new(),
            "web",
            Some(PoolId::new()),
            serde_json::json!({}),
        );
        assert_eq!(sb.host(), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SandboxStatus::Stopped.is_terminal());
        assert!(SandboxStatus::Dead.is_terminal());
        assert!(!SandboxStatus::Pending.is_terminal());
        assert!(!SandboxStatus::Running.is_terminal());
    }

    #[test]
    fn resolve_port_fallback_chain() {
        let vid = VersionId::new();
        let mut version = AppVersion::new(vid);
        assert_eq!(version.resolve_port("web"), 3000);

        version.port = Some(8080);
        assert_eq!(version.resolve_port("web"), 8080);

        version
            .services
            .insert("web".to_string(), {
                let mut sc = ServiceConcurrency::auto(1, "2m");
                sc.port = Some(9000);
                sc
            });
        assert_eq!(version.resolve_port("web"), 9000);
    }
}
