//! The in-memory lease capability and its URL helper.

use crate::model::{SandboxId, VersionId};

/// An in-memory capability granting its holder permission to dispatch work
/// to a specific sandbox, bounded by that sandbox's
/// [`Tracker`](crate::tracker::Tracker). Never persisted: a lease that
/// outlives the holding process is simply forgotten, which is safe because
/// `Tracker::release` is idempotent and acquisition was always bounded by
/// the same tracker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub(crate) version: VersionId,
    pub(crate) service: String,
    pub(crate) sandbox: SandboxId,
    /// Slots held by this lease. Always 1 in the algorithm described by
    /// this crate, kept as a field for future batching.
    pub(crate) slots: u32,
    pub(crate) host: Option<String>,
    pub(crate) port: u16,
}

impl Lease {
    pub(crate) fn new(
        version: VersionId,
        service: impl Into<String>,
        sandbox: SandboxId,
        host: Option<String>,
        port: u16,
    ) -> Self {
        Self {
            version,
            service: service.into(),
            sandbox,
            slots: 1,
            host,
            port,
        }
    }

    /// The version this lease was acquired against.
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// The service name this lease was acquired against.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The sandbox this lease targets.
    pub fn sandbox(&self) -> SandboxId {
        self.sandbox
    }

    /// Slots held by this lease.
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Convenience helper producing a routable URL for this lease's
    /// sandbox, or `None` if the sandbox had no network address assigned
    /// at acquisition time (should not happen for a `Running` sandbox).
    pub fn sandbox_url(&self) -> Option<String> {
        self.host.as_ref().map(|h| format!("http://{h}:{}", self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_url_formats_host_and_port() {
        let lease = Lease::new(
            VersionId::new(),
            "web",
            SandboxId::new(),
            Some("10.0.0.5".to_string()),
            3000,
        );
        assert_eq!(lease.sandbox_url(), Some("http://10.0.0.5:3000".to_string()));
    }

    #[test]
    fn sandbox_url_none_without_host() {
        let lease = Lease::new(VersionId::new(), "web", SandboxId::new(), None, 3000);
        assert_eq!(lease.sandbox_url(), None);
    }
}
