//! # sandboxctl-activator
//!
//! Activation and scale-to-zero core for sandboxed service deployments.
//!
//! This crate answers one question on the hot path — "give me a routable,
//! healthy sandbox for this `(version, service)`, waiting if none exists
//! yet" — and keeps each deployment's sandbox population matched to
//! demand in the background. It does not execute containers, speak any
//! RPC protocol, or own the entity store; those are external
//! collaborators reached only through the [`EntityStore`](store::EntityStore)
//! trait boundary.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                   sandboxctl-activator                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌────────────────┐   acquire/release   ┌──────────────────┐  │
//! │  │  Activator<S>  │◀────────────────────▶│  Tracker (×N)    │  │
//! │  │   - buckets    │                      │  atomic slots    │  │
//! │  │   - watch loop │                      └──────────────────┘  │
//! │  └────────┬───────┘                                            │
//! │           │ get/put/watch                                      │
//! │           ▼                                                    │
//! │  ┌────────────────────────────────────────────────────────┐   │
//! │  │              EntityStore (external collaborator)       │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! │           ▲ get/put/watch                                      │
//! │           │                                                    │
//! │  ┌────────┴───────┐                                            │
//! │  │ PoolReconciler │  reconcile(pool) on every pool event        │
//! │  │  <S>           │  + 30s idle sweep                           │
//! │  └────────────────┘                                            │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Activator` and `PoolReconciler` share no memory; they interact only
//! through the store, each under optimistic concurrency control.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sandboxctl_activator::{Activator, InMemoryStore};
//! use tokio::time::Instant;
//! use std::time::Duration;
//!
//! # async fn example() -> sandboxctl_activator::Result<()> {
//! let store = InMemoryStore::new();
//! let activator = Arc::new(Activator::new(Arc::clone(&store)));
//! activator.clone().spawn_watch();
//!
//! let deadline = Instant::now() + Duration::from_secs(5);
//! let lease = activator.acquire_lease(version_id, "web", deadline).await?;
//! if let Some(url) = activator.sandbox_url(&lease) {
//!     // dispatch the request to `url`
//! }
//! activator.release_lease(&lease).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lease-bounded dispatch**: every sandbox's concurrent request budget
//!   is enforced by a lock-free [`Tracker`](tracker::Tracker), never by the
//!   entity store.
//! - **Missed-wakeup-free waiting**: a cold `AcquireLease` registers its
//!   waiter before releasing the index lock, so a `RUNNING` transition
//!   delivered in between is never lost.
//! - **Pool-driven and direct-creation modes**: cold demand either bumps a
//!   `SandboxPool`'s `desired_instances` (the reconciler does the work) or
//!   creates a sandbox directly, for deployments with no reconciler.
//! - **Idle scale-to-zero**: a low-frequency background sweep lowers
//!   `desired_instances` for idle auto-mode pools; fixed-mode pools never
//!   scale down.
//! - **Crash-safe recovery**: a fresh activator rebuilds its index from
//!   the store in one pass, forgetting only in-flight lease counts (safe,
//!   since releasing is idempotent and trackers start at zero).

mod activator;
mod error;
mod lease;
mod model;
mod recovery;
mod reconciler;
mod store;
mod strategy;
mod tracker;

pub use activator::Activator;
pub use error::{ActivatorError, Result};
pub use lease::Lease;
pub use model::{
    AppVersion, ConcurrencyMode, PoolId, PoolMode, Sandbox, SandboxId, SandboxPool, SandboxStatus,
    ServiceConcurrency, VersionId, VersionService,
};
pub use recovery::rebuild_index;
pub use reconciler::PoolReconciler;
pub use store::{CasOutcome, EntityOp, EntityStore, InMemoryStore, InMemoryStoreError, OpType, StoreVersion};
pub use strategy::{Strategy, DEFAULT_SCALE_DOWN_DELAY};
pub use tracker::Tracker;
