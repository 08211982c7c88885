//! Error types for the activation / scale-to-zero core.

use std::time::Duration;

use thiserror::Error;

use crate::model::VersionService;

/// Result type alias for activator operations.
pub type Result<T> = std::result::Result<T, ActivatorError>;

/// Errors surfaced by the activator and reconciler.
///
/// Transient store errors are retried internally and only surface here as
/// [`ActivatorError::Timeout`] once the caller's deadline has expired
/// (spec §7's propagation policy: never surface a transient error to a
/// lease caller while the deadline has budget remaining).
#[derive(Debug, Error)]
pub enum ActivatorError {
    /// The caller's deadline expired before a slot became available.
    #[error("acquire timed out after {0:?}")]
    Timeout(Duration),

    /// No `AppVersion` with the given ID is known to the store.
    #[error("version not found: {0}")]
    VersionNotFound(String),

    /// The requested (version, service) has no configured service
    /// concurrency. The caller should treat this as a 404 at the ingress.
    #[error("no service concurrency configured for {0}")]
    NoServiceConcurrency(VersionService),

    /// The entity store reported an error. Wrapped as `dyn Error` so this
    /// crate does not depend on a concrete store transport.
    #[error("entity store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ActivatorError {
    /// Wrap an arbitrary store error.
    pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store(Box::new(err))
    }

    /// `true` if retrying the whole operation might succeed — used by the
    /// reconciler's supervisor loop to decide whether to back off and
    /// retry rather than drop the reconcile pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// `true` if this is a caller-visible deadline expiry rather than an
    /// internal fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn store_errors_are_retryable() {
        let err = ActivatorError::store(Boom);
        assert!(err.is_retryable());
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_is_not_retryable() {
        let err = ActivatorError::Timeout(Duration::from_millis(100));
        assert!(err.is_timeout());
        assert!(!err.is_retryable());
    }
}
