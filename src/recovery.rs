//! Startup index rebuild (spec §4.5): after a crash or restart, the
//! activator's in-memory index is empty but the entity store is not. This
//! module walks the store once and seeds buckets for every `Running`
//! sandbox so lease traffic can resume without waiting for the watch
//! stream to replay history it never buffers.

use std::sync::Arc;

use chrono::Utc;

use crate::activator::Activator;
use crate::error::{ActivatorError, Result};
use crate::model::{SandboxStatus, VersionService};
use crate::store::EntityStore;
use crate::strategy::Strategy;

/// List every sandbox, skip anything not `Running`, resolve each
/// survivor's `(version, service)` bucket (skipping sandboxes whose
/// version or service concurrency has since been deleted, logging a
/// warning), and seed the activator's index.
///
/// Idempotent: running this twice against the same store converges to the
/// same index, since `seed_bucket` only inserts a `TrackedSandbox` the
/// first time a given sandbox ID is observed for a bucket.
pub async fn rebuild_index<S: EntityStore + 'static>(activator: &Activator<S>) -> Result<()> {
    let sandboxes = activator
        .store()
        .list_sandboxes()
        .await
        .map_err(ActivatorError::store)?;

    for (mut sandbox, _version) in sandboxes {
        if sandbox.status != SandboxStatus::Running {
            continue;
        }

        let version = match activator
            .store()
            .get_version(sandbox.version)
            .await
            .map_err(ActivatorError::store)?
        {
            Some(v) => v,
            None => {
                tracing::warn!(
                    sandbox_id = %sandbox.id,
                    version = %sandbox.version,
                    "recovery: skipping sandbox with unknown version"
                );
                continue;
            }
        };

        let Some(service_concurrency) = version.service_concurrency(&sandbox.service) else {
            tracing::warn!(
                sandbox_id = %sandbox.id,
                service = %sandbox.service,
                "recovery: skipping sandbox with no service concurrency configured"
            );
            continue;
        };
        let strategy = Strategy::new(service_concurrency);

        // A sandbox recovered with no recorded last_activity is assumed
        // active as of now, rather than immediately eligible for idle
        // scale-down.
        if sandbox.last_activity.is_none() {
            sandbox.last_activity = Some(Utc::now());
        }

        let key = VersionService::new(sandbox.version, sandbox.service.clone());
        activator.seed_bucket(key, version, strategy, sandbox).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppVersion, PoolId, Sandbox, ServiceConcurrency, VersionId};
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn recovery_seeds_running_sandboxes_only() {
        let store = InMemoryStore::new();
        let mut version = AppVersion::new(VersionId::new());
        version
            .services
            .insert("web".to_string(), ServiceConcurrency::auto(3, "2m"));
        let version_id = version.id;
        store.put_version(version).await.unwrap();

        let running = Sandbox::pending(version_id, "web", Some(PoolId::new()), serde_json::json!({}));
        let running_id = running.id;
        store.create_sandbox(running).await.unwrap();
        store.mark_running(running_id, "10.0.0.7/24").await;

        let pending = Sandbox::pending(version_id, "web", Some(PoolId::new()), serde_json::json!({}));
        store.create_sandbox(pending).await.unwrap();

        let activator = Activator::recover(Arc::clone(&store), true).await.unwrap();
        let key = VersionService::new(version_id, "web");
        assert_eq!(activator.bucket_len(&key).await, Some(1));
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let store = InMemoryStore::new();
        let mut version = AppVersion::new(VersionId::new());
        version
            .services
            .insert("web".to_string(), ServiceConcurrency::auto(2, "2m"));
        let version_id = version.id;
        store.put_version(version).await.unwrap();

        let sandbox = Sandbox::pending(version_id, "web", Some(PoolId::new()), serde_json::json!({}));
        let id = sandbox.id;
        store.create_sandbox(sandbox).await.unwrap();
        store.mark_running(id, "10.0.0.8/24").await;

        let activator = Activator::recover(Arc::clone(&store), true).await.unwrap();
        rebuild_index(&activator).await.unwrap();
        let key = VersionService::new(version_id, "web");
        assert_eq!(activator.bucket_len(&key).await, Some(1));
    }

    #[tokio::test]
    async fn recovery_skips_sandbox_with_unknown_version() {
        let store = InMemoryStore::new();
        let sandbox = Sandbox::pending(VersionId::new(), "web", Some(PoolId::new()), serde_json::json!({}));
        let id = sandbox.id;
        store.create_sandbox(sandbox).await.unwrap();
        store.mark_running(id, "10.0.0.9/24").await;

        // Should not error even though the version was never put.
        let activator = Activator::recover(Arc::clone(&store), true).await.unwrap();
        let key = VersionService::new(VersionId::new(), "web");
        assert_eq!(activator.bucket_len(&key).await, None);
    }
}
