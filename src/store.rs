//! The entity store: the watchable, versioned key-value + attribute graph
//! this crate is built against. The store itself is an external
//! collaborator (spec §1) — this module only defines the trait boundary
//! (§6) plus an in-memory reference implementation used by this crate's
//! own tests and available to embedders that have not wired a real store
//! yet, the same role `vm-manager`'s `MockVMManager` plays for `VMManager`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::model::{AppVersion, PoolId, Sandbox, SandboxId, SandboxStatus, SandboxPool, VersionId, VersionService};

/// Distinguishes an insertion from a modification in a watch stream.
/// Other values observed on the wire are ignored by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// A new entity was created.
    Insert,
    /// An existing entity was updated.
    Modify,
}

/// A single event delivered by [`EntityStore::watch_sandboxes`] or
/// [`EntityStore::watch_pools`].
#[derive(Debug, Clone)]
pub struct EntityOp<T> {
    /// Whether this is an insertion or a modification.
    pub op_type: OpType,
    /// The entity's state after the operation.
    pub entity: T,
}

/// Opaque optimistic-concurrency token returned alongside a
/// [`SandboxPool`] read and required to `Put` an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreVersion(pub u64);

/// Outcome of a compare-and-swap `Put` on a [`SandboxPool`].
#[derive(Debug)]
pub enum CasOutcome {
    /// The write committed; the new version token.
    Committed(StoreVersion),
    /// `expected` did not match the stored version; the write was
    /// rejected. The caller should re-read and retry.
    Conflict,
}

/// The store interface the activator and reconciler are built against.
///
/// Implementors must be safe to call from an arbitrary worker thread
/// under parallelism (spec §5).
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Error type surfaced by store operations. Wrapped into
    /// [`crate::error::ActivatorError::Store`] by callers.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch an `AppVersion` by ID.
    async fn get_version(&self, id: VersionId) -> Result<Option<AppVersion>, Self::Error>;

    /// Upsert an `AppVersion`. Used by coordinators seeding the store;
    /// the activator itself never writes versions.
    async fn put_version(&self, version: AppVersion) -> Result<(), Self::Error>;

    /// Fetch a single sandbox by ID, with its optimistic-concurrency token.
    async fn get_sandbox(&self, id: SandboxId) -> Result<Option<(Sandbox, StoreVersion)>, Self::Error>;

    /// List every sandbox entity, regardless of status, each with its
    /// optimistic-concurrency token.
    async fn list_sandboxes(&self) -> Result<Vec<(Sandbox, StoreVersion)>, Self::Error>;

    /// Create a new sandbox entity. Fails if the ID already exists.
    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<(), Self::Error>;

    /// Compare-and-swap update of a sandbox entity (status transitions,
    /// `last_activity` stamps). Broadcasts a `Modify` event on success.
    /// Callers must re-read and retry on [`CasOutcome::Conflict`], the
    /// same discipline `put_pool_cas` requires (spec §6's optimistic
    /// concurrency contract — this prevents a `scale_down` status Put from
    /// racing the coalesced `last_activity` persist on the same sandbox).
    async fn put_sandbox_cas(
        &self,
        sandbox: Sandbox,
        expected: StoreVersion,
    ) -> Result<CasOutcome, Self::Error>;

    /// Subscribe to sandbox insert/modify events. A fresh subscriber only
    /// observes events emitted after it subscribes — callers that need to
    /// catch up on history must pair this with a [`list_sandboxes`] call
    /// (spec §4.3.3's reconnect-then-List policy).
    ///
    /// [`list_sandboxes`]: EntityStore::list_sandboxes
    fn watch_sandboxes(&self) -> broadcast::Receiver<EntityOp<Sandbox>>;

    /// Fetch a pool and its current optimistic-concurrency token.
    async fn get_pool(
        &self,
        key: &VersionService,
    ) -> Result<Option<(SandboxPool, StoreVersion)>, Self::Error>;

    /// Fetch a pool by ID (used once the reconciler already knows which
    /// pool it is reconciling).
    async fn get_pool_by_id(
        &self,
        id: PoolId,
    ) -> Result<Option<(SandboxPool, StoreVersion)>, Self::Error>;

    /// List every pool entity.
    async fn list_pools(&self) -> Result<Vec<(SandboxPool, StoreVersion)>, Self::Error>;

    /// Create a new pool entity, returning its initial version token.
    async fn create_pool(&self, pool: SandboxPool) -> Result<StoreVersion, Self::Error>;

    /// Compare-and-swap update of a pool entity.
    async fn put_pool_cas(
        &self,
        pool: SandboxPool,
        expected: StoreVersion,
    ) -> Result<CasOutcome, Self::Error>;

    /// Subscribe to pool insert/modify events.
    fn watch_pools(&self) -> broadcast::Receiver<EntityOp<SandboxPool>>;
}

/// Error type for [`InMemoryStore`].
#[derive(Debug, Error)]
pub enum InMemoryStoreError {
    /// The sandbox ID already exists.
    #[error("sandbox already exists: {0}")]
    SandboxAlreadyExists(SandboxId),
    /// The pool for the given key already exists.
    #[error("pool already exists for {0}")]
    PoolAlreadyExists(VersionService),
}

struct Inner {
    versions: HashMap<VersionId, AppVersion>,
    sandboxes: HashMap<SandboxId, (Sandbox, StoreVersion)>,
    pools: HashMap<PoolId, (SandboxPool, StoreVersion)>,
    pool_by_key: HashMap<VersionService, PoolId>,
}

/// A fully-working in-memory [`EntityStore`]. Not behind `cfg(test)`: it
/// is used by this crate's own test suite and is also useful to any
/// embedder exercising the activator before a real store client exists,
/// the same way the teacher's `MockVMManager` is a first-class (if
/// in-module) implementation rather than a throwaway stub.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    sandbox_tx: broadcast::Sender<EntityOp<Sandbox>>,
    pool_tx: broadcast::Sender<EntityOp<SandboxPool>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        let (sandbox_tx, _) = broadcast::channel(1024);
        let (pool_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                versions: HashMap::new(),
                sandboxes: HashMap::new(),
                pools: HashMap::new(),
                pool_by_key: HashMap::new(),
            }),
            sandbox_tx,
            pool_tx,
        })
    }

    /// Test/harness helper: directly set a sandbox's status and broadcast
    /// the transition, simulating the external sandbox controller.
    pub async fn set_sandbox_status(&self, id: SandboxId, status: SandboxStatus) {
        let mut inner = self.inner.lock().await;
        if let Some((sandbox, version)) = inner.sandboxes.get_mut(&id) {
            sandbox.status = status;
            *version = StoreVersion(version.0 + 1);
            let entity = sandbox.clone();
            drop(inner);
            let _ = self.sandbox_tx.send(EntityOp {
                op_type: OpType::Modify,
                entity,
            });
        }
    }

    /// Test/harness helper: assign a network address to a sandbox and
    /// transition it to `Running`, simulating the external sandbox
    /// controller completing a boot.
    pub async fn mark_running(&self, id: SandboxId, address: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        if let Some((sandbox, version)) = inner.sandboxes.get_mut(&id) {
            sandbox.network = vec![address.into()];
            sandbox.status = SandboxStatus::Running;
            *version = StoreVersion(version.0 + 1);
            let entity = sandbox.clone();
            drop(inner);
            let _ = self.sandbox_tx.send(EntityOp {
                op_type: OpType::Modify,
                entity,
            });
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (sandbox_tx, _) = broadcast::channel(1024);
        let (pool_tx, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                versions: HashMap::new(),
                sandboxes: HashMap::new(),
                pools: HashMap::new(),
                pool_by_key: HashMap::new(),
            }),
            sandbox_tx,
            pool_tx,
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn get_version(&self, id: VersionId) -> Result<Option<AppVersion>, Self::Error> {
        Ok(self.inner.lock().await.versions.get(&id).cloned())
    }

    async fn put_version(&self, version: AppVersion) -> Result<(), Self::Error> {
        self.inner.lock().await.versions.insert(version.id, version);
        Ok(())
    }

    async fn get_sandbox(&self, id: SandboxId) -> Result<Option<(Sandbox, StoreVersion)>, Self::Error> {
        Ok(self.inner.lock().await.sandboxes.get(&id).cloned())
    }

    async fn list_sandboxes(&self) -> Result<Vec<(Sandbox, StoreVersion)>, Self::Error> {
        Ok(self.inner.lock().await.sandboxes.values().cloned().collect())
    }

    async fn create_sandbox(&self, sandbox: Sandbox) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        if inner.sandboxes.contains_key(&sandbox.id) {
            return Err(InMemoryStoreError::SandboxAlreadyExists(sandbox.id));
        }
        let entity = sandbox.clone();
        inner.sandboxes.insert(sandbox.id, (sandbox, StoreVersion(0)));
        drop(inner);
        let _ = self.sandbox_tx.send(EntityOp {
            op_type: OpType::Insert,
            entity,
        });
        Ok(())
    }

    async fn put_sandbox_cas(
        &self,
        sandbox: Sandbox,
        expected: StoreVersion,
    ) -> Result<CasOutcome, Self::Error> {
        let mut inner = self.inner.lock().await;
        let Some((_, current)) = inner.sandboxes.get(&sandbox.id) else {
            // Entity vanished; treat as a conflict so the caller re-reads.
            return Ok(CasOutcome::Conflict);
        };
        if *current != expected {
            return Ok(CasOutcome::Conflict);
        }
        let next = StoreVersion(expected.0 + 1);
        let entity = sandbox.clone();
        inner.sandboxes.insert(sandbox.id, (sandbox, next));
        drop(inner);
        let _ = self.sandbox_tx.send(EntityOp {
            op_type: OpType::Modify,
            entity,
        });
        Ok(CasOutcome::Committed(next))
    }

    fn watch_sandboxes(&self) -> broadcast::Receiver<EntityOp<Sandbox>> {
        self.sandbox_tx.subscribe()
    }

    async fn get_pool(
        &self,
        key: &VersionService,
    ) -> Result<Option<(SandboxPool, StoreVersion)>, Self::Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .pool_by_key
            .get(key)
            .and_then(|id| inner.pools.get(id))
            .cloned())
    }

    async fn get_pool_by_id(
        &self,
        id: PoolId,
    ) -> Result<Option<(SandboxPool, StoreVersion)>, Self::Error> {
        Ok(self.inner.lock().await.pools.get(&id).cloned())
    }

    async fn list_pools(&self) -> Result<Vec<(SandboxPool, StoreVersion)>, Self::Error> {
        Ok(self.inner.lock().await.pools.values().cloned().collect())
    }

    async fn create_pool(&self, pool: SandboxPool) -> Result<StoreVersion, Self::Error> {
        let mut inner = self.inner.lock().await;
        let key = VersionService::new(pool.version, pool.service.clone());
        if inner.pool_by_key.contains_key(&key) {
            return Err(InMemoryStoreError::PoolAlreadyExists(key));
        }
        let version = StoreVersion(0);
        inner.pool_by_key.insert(key, pool.id);
        let entity = pool.clone();
        inner.pools.insert(pool.id, (pool, version));
        drop(inner);
        let _ = self.pool_tx.send(EntityOp {
            op_type: OpType::Insert,
            entity,
        });
        Ok(version)
    }

    async fn put_pool_cas(
        &self,
        pool: SandboxPool,
        expected: StoreVersion,
    ) -> Result<CasOutcome, Self::Error> {
        let mut inner = self.inner.lock().await;
        let Some((_, current)) = inner.pools.get(&pool.id) else {
            // Entity vanished; treat as a conflict so the caller re-reads.
            return Ok(CasOutcome::Conflict);
        };
        if *current != expected {
            return Ok(CasOutcome::Conflict);
        }
        let next = StoreVersion(expected.0 + 1);
        let entity = pool.clone();
        inner.pools.insert(pool.id, (pool, next));
        drop(inner);
        let _ = self.pool_tx.send(EntityOp {
            op_type: OpType::Modify,
            entity,
        });
        Ok(CasOutcome::Committed(next))
    }

    fn watch_pools(&self) -> broadcast::Receiver<EntityOp<SandboxPool>> {
        self.pool_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PoolMode;

    fn sandbox(version: VersionId, service: &str) -> Sandbox {
        Sandbox::pending(version, service, Some(PoolId::new()), serde_json::json!({}))
    }

    #[tokio::test]
    async fn create_then_get_sandbox_round_trips() {
        let store = InMemoryStore::new();
        let version = VersionId::new();
        let sb = sandbox(version, "web");
        let id = sb.id;
        store.create_sandbox(sb).await.unwrap();
        let (fetched, version) = store.get_sandbox(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(version, StoreVersion(0));
    }

    #[tokio::test]
    async fn sandbox_cas_rejects_stale_version() {
        let store = InMemoryStore::new();
        let sb = sandbox(VersionId::new(), "web");
        let id = sb.id;
        store.create_sandbox(sb).await.unwrap();
        let (fetched, v0) = store.get_sandbox(id).await.unwrap().unwrap();

        let mut updated = fetched.clone();
        updated.status = SandboxStatus::Running;
        let outcome = store.put_sandbox_cas(updated, v0).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Committed(StoreVersion(1))));

        // Retry with the now-stale v0 token.
        let mut updated_again = fetched;
        updated_again.status = SandboxStatus::Stopped;
        let outcome = store.put_sandbox_cas(updated_again, v0).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Conflict));
    }

    #[tokio::test]
    async fn create_sandbox_twice_fails() {
        let store = InMemoryStore::new();
        let sb = sandbox(VersionId::new(), "web");
        let dup = sb.clone();
        store.create_sandbox(sb).await.unwrap();
        assert!(store.create_sandbox(dup).await.is_err());
    }

    #[tokio::test]
    async fn watch_sandboxes_sees_insert_and_modify() {
        let store = InMemoryStore::new();
        let mut rx = store.watch_sandboxes();
        let version = VersionId::new();
        let sb = sandbox(version, "web");
        let id = sb.id;
        store.create_sandbox(sb).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.op_type, OpType::Insert);

        store.mark_running(id, "10.0.0.5/24").await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.op_type, OpType::Modify);
        assert_eq!(ev.entity.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn pool_cas_rejects_stale_version() {
        let store = InMemoryStore::new();
        let version = VersionId::new();
        let pool = SandboxPool::new("web", version, serde_json::json!({}), PoolMode::Auto, 0);
        let v0 = store.create_pool(pool.clone()).await.unwrap();

        let mut bumped = pool.clone();
        bumped.desired_instances = 1;
        let outcome = store.put_pool_cas(bumped.clone(), v0).await.unwrap();
        let v1 = match outcome {
            CasOutcome::Committed(v) => v,
            CasOutcome::Conflict => panic!("expected commit"),
        };
        assert_eq!(v1, StoreVersion(1));

        // Retry with the now-stale v0 token.
        let mut bumped_again = pool.clone();
        bumped_again.desired_instances = 2;
        let outcome = store.put_pool_cas(bumped_again, v0).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Conflict));
    }

    #[tokio::test]
    async fn get_pool_by_key_finds_created_pool() {
        let store = InMemoryStore::new();
        let version = VersionId::new();
        let pool = SandboxPool::new("worker", version, serde_json::json!({}), PoolMode::Fixed, 2);
        store.create_pool(pool.clone()).await.unwrap();

        let key = VersionService::new(version, "worker");
        let (fetched, _) = store.get_pool(&key).await.unwrap().unwrap();
        assert_eq!(fetched.id, pool.id);
    }
}
