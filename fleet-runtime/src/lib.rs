//! Resource store, watch bus and controller runtime for the fleet control
//! plane
//!
//! The pieces compose bottom-up:
//!
//! - [`store`] is the in-memory versioned resource store with label
//!   indexing, ownership enforcement and per-`(type, namespace)` watch
//!   channels (bounded queues, lag-triggered resync).
//! - [`controller`] registers [`Reconciler`]s, builds their input/output
//!   dependency graph, and drives deduplicated, backoff-retried reconcile
//!   passes whose intended outputs are diffed against the store.
//!
//! The scheduler in between (delaying and deduplicating reconcile keys) is
//! an implementation detail of the controller runtime.

mod scheduler;

pub mod controller;
pub mod store;

pub use controller::{
    Input, InputKind, Output, ReconcileContext, Reconciler, Runtime, RuntimeHandle, RuntimeOptions,
};
pub use scheduler::ReconcileKey;
pub use store::{Event, Lagged, Store, StoreOptions, WatchStream};
