//! The activator: indexes healthy sandboxes by `(version, service)`,
//! serves lease acquisition/release, and watches the entity store for
//! sandbox status transitions (spec §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ActivatorError, Result};
use crate::lease::Lease;
use crate::model::{
    AppVersion, PoolMode, Sandbox, SandboxId, SandboxPool, SandboxStatus, VersionId,
    VersionService,
};
use crate::store::{CasOutcome, EntityOp, EntityStore};
use crate::strategy::Strategy;
use crate::tracker::Tracker;

/// Backoff between watch-stream reconnect attempts (spec §4.3.3).
const WATCH_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

struct TrackedSandbox {
    sandbox: Sandbox,
    tracker: Arc<Tracker>,
    /// `true` while an async `last_activity` persist is in flight for this
    /// sandbox (at-most-one-in-flight coalescing, spec §9).
    write_in_flight: Arc<AtomicBool>,
    /// Set by a caller when a persist is already in flight, so the
    /// in-flight task picks up the newer timestamp before it exits.
    dirty: Arc<AtomicBool>,
}

impl TrackedSandbox {
    fn new(sandbox: Sandbox, capacity: u32) -> Self {
        Self {
            sandbox,
            tracker: Arc::new(Tracker::new(capacity)),
            write_in_flight: Arc::new(AtomicBool::new(false)),
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct Bucket {
    version: AppVersion,
    strategy: Strategy,
    sandboxes: Vec<TrackedSandbox>,
    notify: Arc<Notify>,
}

impl Bucket {
    fn new(version: AppVersion, strategy: Strategy) -> Self {
        Self {
            version,
            strategy,
            sandboxes: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn pending_count(&self) -> usize {
        self.sandboxes
            .iter()
            .filter(|t| t.sandbox.status == SandboxStatus::Pending)
            .count()
    }

    fn find_mut(&mut self, id: SandboxId) -> Option<&mut TrackedSandbox> {
        self.sandboxes.iter_mut().find(|t| t.sandbox.id == id)
    }
}

#[derive(Default)]
struct ActivatorState {
    buckets: HashMap<VersionService, Bucket>,
}

/// Outcome of one fast-path lock section: either a granted lease plus the
/// bookkeeping needed to persist `last_activity`, or nothing, in which case
/// the bucket's pending count and a freshly registered waiter are returned
/// instead.
enum FastPathResult {
    Granted {
        lease: Lease,
        sandbox_id: SandboxId,
        timestamp: chrono::DateTime<Utc>,
        write_in_flight: Arc<AtomicBool>,
        dirty: Arc<AtomicBool>,
    },
    MustWait { pending: usize, notify: Arc<Notify> },
}

/// Per-runtime singleton coordinating lease acquisition and sandbox-status
/// tracking for every `(version, service)` pair.
///
/// All state is guarded by a single mutex (spec §5): the critical section
/// never spans an entity-store call.
pub struct Activator<S: EntityStore> {
    store: Arc<S>,
    state: Mutex<ActivatorState>,
    /// When `true`, cold demand bumps a `SandboxPool`'s `desired_instances`
    /// and waits for the reconciler. When `false`, the activator creates
    /// sandbox entities directly, bypassing pool and reconciler entirely
    /// (spec §4.3's direct-creation mode).
    use_pools: bool,
}

impl<S: EntityStore + 'static> Activator<S> {
    /// Construct an activator with an empty index, in pool-driven mode.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            state: Mutex::new(ActivatorState::default()),
            use_pools: true,
        }
    }

    /// Construct an activator that creates sandboxes directly rather than
    /// going through a pool/reconciler.
    pub fn without_pools(store: Arc<S>) -> Self {
        Self {
            store,
            state: Mutex::new(ActivatorState::default()),
            use_pools: false,
        }
    }

    /// Rebuild the in-memory index from the store (spec §4.5). Delegates
    /// to [`crate::recovery`].
    pub async fn recover(store: Arc<S>, use_pools: bool) -> Result<Self> {
        let activator = Self {
            store: Arc::clone(&store),
            state: Mutex::new(ActivatorState::default()),
            use_pools,
        };
        crate::recovery::rebuild_index(&activator).await?;
        Ok(activator)
    }

    /// Acquire a lease on a healthy, capacity-having sandbox for
    /// `(version, service)`, waiting up to `deadline` for one to become
    /// available (spec §4.3.1).
    pub async fn acquire_lease(
        &self,
        version: VersionId,
        service: &str,
        deadline: Instant,
    ) -> Result<Lease> {
        let key = VersionService::new(version, service);

        loop {
            self.ensure_bucket(&key).await?;

            // Fast path: bounded, lock-protected walk with no suspension
            // points. When it misses, a waiter is registered on the
            // bucket's Notify *while the lock is still held* — held open
            // via `notify_holder`/`notified_holder` outliving the locked
            // block below — so a concurrent notify_waiters() can never
            // slip in unobserved between the miss and the registration
            // (spec §5).
            let mut granted = None;
            let mut pending_opt = None;
            let mut notify_holder: Option<Arc<Notify>> = None;
            let mut notified_holder = None;
            {
                let mut state = self.state.lock().await;
                let bucket = state
                    .buckets
                    .get_mut(&key)
                    .expect("ensure_bucket just populated this key");
                match Self::try_fast_path(bucket, &key, service) {
                    FastPathResult::Granted {
                        lease,
                        sandbox_id,
                        timestamp,
                        write_in_flight,
                        dirty,
                    } => granted = Some((lease, sandbox_id, timestamp, write_in_flight, dirty)),
                    FastPathResult::MustWait { pending, notify } => {
                        pending_opt = Some(pending);
                        notify_holder = Some(notify);
                        notified_holder = Some(notify_holder.as_ref().unwrap().notified());
                    }
                }
            }

            if let Some((lease, sandbox_id, timestamp, write_in_flight, dirty)) = granted {
                self.spawn_persist_last_activity(&key, sandbox_id, timestamp, write_in_flight, dirty);
                return Ok(lease);
            }

            let pending = pending_opt.expect("fast path missed => pending count computed");
            let notified = notified_holder.expect("fast path missed => waiter registered");

            if pending == 0 {
                if self.use_pools {
                    self.bump_desired_instances(&key).await?;
                } else {
                    self.create_sandbox_directly(&key).await?;
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ActivatorError::Timeout(
                        deadline.saturating_duration_since(Instant::now()),
                    ));
                }
            }
        }
    }

    /// Release a previously acquired lease. Idempotent; never fails; never
    /// blocks on I/O (spec §4.3.2).
    pub async fn release_lease(&self, lease: &Lease) {
        let state = self.state.lock().await;
        let key = VersionService::new(lease.version, lease.service.clone());
        if let Some(bucket) = state.buckets.get(&key) {
            if let Some(tracked) = bucket.sandboxes.iter().find(|t| t.sandbox.id == lease.sandbox) {
                tracked.tracker.release();
            }
        }
    }

    /// Convenience accessor mirroring `Lease::sandbox_url`.
    pub fn sandbox_url(&self, lease: &Lease) -> Option<String> {
        lease.sandbox_url()
    }

    /// Scan `Running` sandboxes for free capacity. On success, stamps
    /// `last_activity` in memory and returns the lease plus the bookkeeping
    /// needed to persist the stamp off the hot path. On failure, registers
    /// a waiter on the bucket's `Notify` before returning, while the lock
    /// covering `bucket` is still held by the caller.
    fn try_fast_path(bucket: &mut Bucket, key: &VersionService, service: &str) -> FastPathResult {
        let port = bucket.version.resolve_port(service);
        for tracked in bucket.sandboxes.iter_mut() {
            if tracked.sandbox.status != SandboxStatus::Running {
                // Never grant a lease from a non-RUNNING sandbox, even if
                // its tracker reports free capacity (spec §8, scenario E3).
                continue;
            }
            if tracked.tracker.try_acquire() {
                let now = Utc::now();
                tracked.sandbox.last_activity = Some(now);
                let host = tracked.sandbox.host().map(str::to_string);
                let lease = Lease::new(key.version, key.service.clone(), tracked.sandbox.id, host, port);
                return FastPathResult::Granted {
                    lease,
                    sandbox_id: tracked.sandbox.id,
                    timestamp: now,
                    write_in_flight: Arc::clone(&tracked.write_in_flight),
                    dirty: Arc::clone(&tracked.dirty),
                };
            }
        }
        FastPathResult::MustWait {
            pending: bucket.pending_count(),
            notify: Arc::clone(&bucket.notify),
        }
    }

    /// Fetch-or-create the `(version, service)` bucket. The entity-store
    /// read happens outside the state lock (spec §5's locking discipline).
    async fn ensure_bucket(&self, key: &VersionService) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.buckets.contains_key(key) {
                return Ok(());
            }
        }

        let version = self
            .store
            .get_version(key.version)
            .await
            .map_err(ActivatorError::store)?
            .ok_or_else(|| ActivatorError::VersionNotFound(key.version.to_string()))?;

        let service_concurrency = version
            .service_concurrency(&key.service)
            .ok_or_else(|| ActivatorError::NoServiceConcurrency(key.clone()))?
            .clone();
        let strategy = Strategy::new(&service_concurrency);

        let mut state = self.state.lock().await;
        state
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(version, strategy));
        Ok(())
    }

    /// Stamp `last_activity` asynchronously, off the hot path, with
    /// at-most-one-in-flight-per-sandbox coalescing (spec §9): if a write
    /// is already in flight for this sandbox, set the dirty flag so the
    /// in-flight task picks up the latest timestamp before it finishes,
    /// rather than starting a second concurrent write.
    fn spawn_persist_last_activity(
        &self,
        key: &VersionService,
        sandbox_id: SandboxId,
        timestamp: chrono::DateTime<Utc>,
        write_in_flight: Arc<AtomicBool>,
        dirty: Arc<AtomicBool>,
    ) {
        if write_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            dirty.store(true, Ordering::Release);
            return;
        }

        let store = Arc::clone(&self.store);
        let key = key.clone();

        tokio::spawn(async move {
            let mut timestamp = timestamp;
            loop {
                persist_last_activity_cas(&*store, &key, sandbox_id, timestamp).await;
                if dirty.swap(false, Ordering::AcqRel) {
                    timestamp = Utc::now();
                    continue;
                }
                write_in_flight.store(false, Ordering::Release);
                break;
            }
        });
    }

    /// Pool-mode cold demand: read-or-create the pool for this key and
    /// increment `desired_instances` by one, retrying on optimistic
    /// concurrency conflicts (spec §4.3.1 step 3, §9).
    async fn bump_desired_instances(&self, key: &VersionService) -> Result<()> {
        loop {
            match self.store.get_pool(key).await.map_err(ActivatorError::store)? {
                Some((mut pool, version)) => {
                    pool.desired_instances += 1;
                    match self
                        .store
                        .put_pool_cas(pool, version)
                        .await
                        .map_err(ActivatorError::store)?
                    {
                        CasOutcome::Committed(_) => return Ok(()),
                        CasOutcome::Conflict => continue,
                    }
                }
                None => {
                    let (mode, floor, sandbox_spec) = {
                        let state = self.state.lock().await;
                        let bucket = state
                            .buckets
                            .get(key)
                            .ok_or_else(|| ActivatorError::NoServiceConcurrency(key.clone()))?;
                        let sc = bucket
                            .version
                            .service_concurrency(&key.service)
                            .ok_or_else(|| ActivatorError::NoServiceConcurrency(key.clone()))?;
                        (
                            PoolMode::from(sc.mode),
                            bucket.strategy.desired_floor(),
                            sc.sandbox_spec.clone(),
                        )
                    };
                    let pool = SandboxPool::new(
                        key.service.clone(),
                        key.version,
                        sandbox_spec,
                        mode,
                        floor + 1,
                    );
                    match self.store.create_pool(pool).await {
                        Ok(_) => return Ok(()),
                        Err(e) => {
                            // Lost the race with a concurrent caller
                            // creating the same pool; re-read and retry.
                            tracing::debug!(bucket = %key, error = %e, "pool create lost race, retrying");
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Direct-creation mode: Put a new `Pending` sandbox entity, bypassing
    /// pool and reconciler entirely (spec §4.3.1's direct-creation mode).
    async fn create_sandbox_directly(&self, key: &VersionService) -> Result<()> {
        let sandbox_spec = {
            let state = self.state.lock().await;
            let bucket = state
                .buckets
                .get(key)
                .ok_or_else(|| ActivatorError::NoServiceConcurrency(key.clone()))?;
            bucket
                .version
                .service_concurrency(&key.service)
                .ok_or_else(|| ActivatorError::NoServiceConcurrency(key.clone()))?
                .sandbox_spec
                .clone()
        };
        let sandbox = Sandbox::pending(key.version, key.service.clone(), None, sandbox_spec);
        self.store
            .create_sandbox(sandbox)
            .await
            .map_err(ActivatorError::store)
    }

    /// Insert a sandbox into its bucket if absent, preserving the existing
    /// tracker (and its in-flight used count) if already present. Used by
    /// both the watch loop and recovery.
    ///
    /// Backfills the bucket via `ensure_bucket` when this is the first
    /// event ever observed for its `(version, service)` key — e.g. a
    /// sharded activator that has never served a local `acquire_lease` for
    /// this key (spec §9), or `spawn_watch`'s initial `catch_up()` racing
    /// ahead of any local caller. Without this, the event would be
    /// silently dropped and the next `acquire_lease` would find an empty
    /// bucket despite healthy capacity already sitting in the store.
    /// Returns `false` if the bucket could not be resolved (e.g. the
    /// version has since been deleted), so callers know not to notify
    /// waiters that don't exist.
    async fn upsert(&self, sandbox: Sandbox) -> bool {
        let key = VersionService::new(sandbox.version, sandbox.service.clone());
        if let Err(e) = self.ensure_bucket(&key).await {
            tracing::warn!(bucket = %key, error = %e, "dropping sandbox event for unresolvable bucket");
            return false;
        }

        let mut state = self.state.lock().await;
        let Some(bucket) = state.buckets.get_mut(&key) else {
            return false;
        };
        let capacity = bucket.strategy.per_instance_capacity();
        if let Some(tracked) = bucket.find_mut(sandbox.id) {
            tracked.sandbox.status = sandbox.status;
            tracked.sandbox.network = sandbox.network;
            if sandbox.last_activity.is_some() {
                tracked.sandbox.last_activity = sandbox.last_activity;
            }
        } else {
            bucket.sandboxes.push(TrackedSandbox::new(sandbox, capacity));
        }
        true
    }

    /// Remove a sandbox from its bucket, leaving an empty-but-present
    /// bucket so its strategy and waiters survive (spec §4.3.3).
    async fn remove(&self, version: VersionId, service: &str, id: SandboxId) {
        let key = VersionService::new(version, service);
        let mut state = self.state.lock().await;
        if let Some(bucket) = state.buckets.get_mut(&key) {
            bucket.sandboxes.retain(|t| t.sandbox.id != id);
        }
    }

    /// Handle one store event exactly as spec §4.3.3 describes, then
    /// broadcast to waiters on a `Running` transition.
    async fn handle_event(&self, op: EntityOp<Sandbox>) {
        let sandbox = op.entity;
        match sandbox.status {
            SandboxStatus::Pending => {
                self.upsert(sandbox).await;
            }
            SandboxStatus::Running => {
                let key = VersionService::new(sandbox.version, sandbox.service.clone());
                if self.upsert(sandbox).await {
                    let state = self.state.lock().await;
                    if let Some(bucket) = state.buckets.get(&key) {
                        bucket.notify.notify_waiters();
                    }
                }
            }
            SandboxStatus::Dead | SandboxStatus::Stopped => {
                self.remove(sandbox.version, &sandbox.service, sandbox.id).await;
            }
        }
    }

    /// Background watch loop (spec §4.3.3). Spawn once per activator
    /// lifetime; reconnects with a fixed backoff and performs a full
    /// `List` of sandboxes on startup and after every reconnect.
    pub fn spawn_watch(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.catch_up().await;
                let mut rx = self.store.watch_sandboxes();
                loop {
                    match rx.recv().await {
                        Ok(op) => self.handle_event(op).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "watch lagged, catching up via List");
                            self.catch_up().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!("watch stream closed, reconnecting after backoff");
                            break;
                        }
                    }
                }
                tokio::time::sleep(WATCH_RECONNECT_BACKOFF).await;
            }
        })
    }

    async fn catch_up(&self) {
        match self.store.list_sandboxes().await {
            Ok(sandboxes) => {
                for (sandbox, _version) in sandboxes.into_iter().filter(|(s, _)| s.status == SandboxStatus::Running) {
                    let key = VersionService::new(sandbox.version, sandbox.service.clone());
                    if self.upsert(sandbox).await {
                        let state = self.state.lock().await;
                        if let Some(bucket) = state.buckets.get(&key) {
                            bucket.notify.notify_waiters();
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "catch-up List failed"),
        }
    }

    /// Test/introspection helper: number of tracked sandboxes for a key.
    #[cfg(test)]
    pub(crate) async fn bucket_len(&self, key: &VersionService) -> Option<usize> {
        let state = self.state.lock().await;
        state.buckets.get(key).map(|b| b.sandboxes.len())
    }

    /// Crate-internal hook used by [`crate::recovery`] to seed buckets
    /// directly during startup recovery without duplicating the lock and
    /// strategy-construction logic `ensure_bucket` already has.
    pub(crate) async fn seed_bucket(
        &self,
        key: VersionService,
        version: AppVersion,
        strategy: Strategy,
        sandbox: Sandbox,
    ) {
        let mut state = self.state.lock().await;
        let capacity = strategy.per_instance_capacity();
        let bucket = state
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(version, strategy));
        if bucket.find_mut(sandbox.id).is_none() {
            bucket.sandboxes.push(TrackedSandbox::new(sandbox, capacity));
        }
    }

    pub(crate) fn store(&self) -> &Arc<S> {
        &self.store
    }
}

/// Stamp `timestamp` onto a sandbox's `last_activity`, retrying on CAS
/// conflict by re-reading and reapplying the timestamp onto the fresh
/// entity (spec §6's optimistic-concurrency contract, §9's monotonically
/// non-decreasing `last_activity` guarantee). A free function, since it
/// needs no `Activator` state beyond the store handle.
async fn persist_last_activity_cas<S: EntityStore>(
    store: &S,
    key: &VersionService,
    sandbox_id: SandboxId,
    timestamp: chrono::DateTime<Utc>,
) {
    let Ok(Some((mut sandbox, mut version))) = store.get_sandbox(sandbox_id).await else {
        return;
    };
    sandbox.last_activity = Some(timestamp);
    loop {
        match store.put_sandbox_cas(sandbox.clone(), version).await {
            Ok(CasOutcome::Committed(_)) => return,
            Ok(CasOutcome::Conflict) => {
                let Ok(Some((fresh, fresh_version))) = store.get_sandbox(sandbox_id).await else {
                    return;
                };
                sandbox = fresh;
                sandbox.last_activity = Some(timestamp);
                version = fresh_version;
            }
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    bucket = %key,
                    error = %e,
                    "failed to persist last_activity"
                );
                return;
            }
        }
    }
}
