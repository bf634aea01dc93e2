//! In-memory versioned resource store with label indexing and watch semantics
//!
//! The store maps `(namespace, type, id)` to a resource and guarantees:
//!
//! - linearizable reads and writes per resource, with a monotonically
//!   increasing version bumped on every successful mutation;
//! - optimistic concurrency (`update` takes an expected version);
//! - at most one owner per resource, set on create and immutable; mismatched
//!   writers get `OwnerConflict` unless flagged as *internal actor*;
//! - destroy deferred while finalizers are present (tearing-down phase),
//!   completing as soon as the last finalizer is lifted;
//! - per-`(type, namespace)` watch channels whose event order is consistent
//!   with commit order, with bounded queues and lag-triggered resync.
//!
//! There are no cross-resource transactions.

mod bus;
mod event;

pub use bus::{Lagged, WatchStream};
pub use event::Event;

use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use fleet_core::{
    Actor, Error, Expression, Phase, Resource, ResourceId, ResourceType, Result, Selector, Version,
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use tracing::trace;

/// Store tuning knobs.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Per-subscriber watch queue depth; overflow drops the subscriber with a
    /// [`Lagged`] resync signal.
    pub watch_queue_depth: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            watch_queue_depth: 64,
        }
    }
}

/// Shared handle to the store. Cloning is cheap and refers to the same data.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    // one shard per resource type, write-locked independently
    shards: [RwLock<Shard>; ResourceType::ALL.len()],
    options: StoreOptions,
}

#[derive(Default)]
struct Shard {
    namespaces: AHashMap<String, NamespaceShard>,
}

impl Shard {
    fn namespace_mut(&mut self, namespace: &str) -> &mut NamespaceShard {
        self.namespaces.entry(namespace.to_string()).or_default()
    }
}

#[derive(Default)]
struct NamespaceShard {
    entries: AHashMap<String, Resource>,
    index: LabelIndex,
    bus: bus::Bus,
}

/// Inverted label index: key -> value -> ids. Consulted by `list` for the
/// first indexable selector term; full scans only happen for selectors made
/// purely of `NotExists` terms or id prefixes.
#[derive(Default)]
struct LabelIndex {
    by_key: AHashMap<String, AHashMap<String, AHashSet<String>>>,
}

impl LabelIndex {
    fn insert(&mut self, labels: &BTreeMap<String, String>, id: &str) {
        for (key, value) in labels {
            self.by_key
                .entry(key.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn remove(&mut self, labels: &BTreeMap<String, String>, id: &str) {
        for (key, value) in labels {
            let Some(values) = self.by_key.get_mut(key) else {
                continue;
            };
            if let Some(ids) = values.get_mut(value) {
                ids.remove(id);
                if ids.is_empty() {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    /// Candidate ids for the first indexable term of `selector`, or `None`
    /// when nothing in the selector can use the index.
    fn candidates(&self, selector: &Selector) -> Option<AHashSet<String>> {
        for expr in selector.expressions() {
            match expr {
                Expression::Equal(key, value) => {
                    return Some(
                        self.by_key
                            .get(key)
                            .and_then(|values| values.get(value))
                            .cloned()
                            .unwrap_or_default(),
                    );
                }
                Expression::Exists(key) => {
                    return Some(match self.by_key.get(key) {
                        Some(values) => values.values().flatten().cloned().collect(),
                        None => AHashSet::new(),
                    });
                }
                Expression::In(key, wanted) => {
                    return Some(match self.by_key.get(key) {
                        Some(values) => wanted
                            .iter()
                            .filter_map(|v| values.get(v))
                            .flatten()
                            .cloned()
                            .collect(),
                        None => AHashSet::new(),
                    });
                }
                Expression::NotExists(_) => continue,
            }
        }
        None
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Store::with_options(StoreOptions::default())
    }

    #[must_use]
    pub fn with_options(options: StoreOptions) -> Self {
        Store {
            inner: Arc::new(Inner {
                shards: std::array::from_fn(|_| RwLock::new(Shard::default())),
                options,
            }),
        }
    }

    fn shard(&self, resource_type: ResourceType) -> &RwLock<Shard> {
        let slot = match resource_type {
            ResourceType::Machine => 0,
            ResourceType::MachineStatusSnapshot => 1,
            ResourceType::MachineLabels => 2,
            ResourceType::MachineStatus => 3,
        };
        &self.inner.shards[slot]
    }

    /// Retrieve a resource by id.
    pub fn get(&self, id: &ResourceId) -> Result<Resource> {
        let shard = self.shard(id.resource_type).read();
        shard
            .namespaces
            .get(&id.namespace)
            .and_then(|ns| ns.entries.get(&id.id))
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// List resources of a type in a namespace matching `selector`, sorted by
    /// id. The whole listing is a snapshot taken under one read lock.
    pub fn list(
        &self,
        resource_type: ResourceType,
        namespace: &str,
        selector: &Selector,
    ) -> Vec<Resource> {
        let shard = self.shard(resource_type).read();
        let Some(ns) = shard.namespaces.get(namespace) else {
            return Vec::new();
        };
        let mut out: Vec<Resource> = match ns.index.candidates(selector) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| ns.entries.get(id))
                .filter(|r| selector.matches(&r.metadata))
                .cloned()
                .collect(),
            None => ns
                .entries
                .values()
                .filter(|r| selector.matches(&r.metadata))
                .cloned()
                .collect(),
        };
        out.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        out
    }

    /// Create a resource. The store assigns version, timestamps and the
    /// owner (taken from `actor`); whatever the caller put there is
    /// overwritten. Fails with `Conflict` if the id exists.
    pub fn create(&self, mut resource: Resource, actor: &Actor) -> Result<Resource> {
        let id = resource.id();
        let mut shard = self.shard(id.resource_type).write();
        let ns = shard.namespace_mut(&id.namespace);
        if ns.entries.contains_key(&id.id) {
            return Err(Error::Conflict(id));
        }
        let now = Utc::now();
        resource.metadata.version = Version::INITIAL;
        resource.metadata.owner = actor.owner.clone();
        resource.metadata.created = now;
        resource.metadata.updated = now;
        resource.metadata.phase = Phase::Running;
        ns.index.insert(&resource.metadata.labels, &id.id);
        ns.entries.insert(id.id.clone(), resource.clone());
        ns.bus.publish(&Event::Created(resource.clone()));
        trace!(%id, "created");
        Ok(resource)
    }

    /// Optimistically update a resource.
    ///
    /// `expected` must match the stored version unless it is
    /// [`Version::UNDEFINED`]. The mutator receives a mutable copy; identity,
    /// version, owner, creation time and phase are restored afterwards, so a
    /// mutator can only change the spec, labels, annotations and finalizers.
    ///
    /// If the mutation empties the finalizers of a tearing-down resource the
    /// deferred destroy completes here.
    pub fn update<F>(
        &self,
        id: &ResourceId,
        expected: Version,
        actor: &Actor,
        mutate: F,
    ) -> Result<Resource>
    where
        F: FnOnce(&mut Resource),
    {
        let mut shard = self.shard(id.resource_type).write();
        let ns = shard
            .namespaces
            .get_mut(&id.namespace)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let old = ns
            .entries
            .get(&id.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        check_owner(&old, actor, id)?;
        if !expected.is_undefined() && old.metadata.version != expected {
            return Err(Error::Conflict(id.clone()));
        }

        let mut new = old.clone();
        mutate(&mut new);
        if new.spec.resource_type() != old.spec.resource_type() {
            return Err(Error::InvalidArgument(format!(
                "mutator changed the spec type of {id}"
            )));
        }
        new.metadata.namespace = old.metadata.namespace.clone();
        new.metadata.id = old.metadata.id.clone();
        new.metadata.owner = old.metadata.owner.clone();
        new.metadata.created = old.metadata.created;
        new.metadata.phase = old.metadata.phase;
        new.metadata.version = old.metadata.version.next();
        new.metadata.updated = Utc::now();

        ns.index.remove(&old.metadata.labels, &id.id);

        if new.metadata.phase == Phase::TearingDown && new.metadata.finalizers.is_empty() {
            ns.entries.remove(&id.id);
            ns.bus.publish(&Event::Destroyed(new.clone()));
            trace!(%id, "teardown completed");
            return Ok(new);
        }

        ns.index.insert(&new.metadata.labels, &id.id);
        ns.entries.insert(id.id.clone(), new.clone());
        ns.bus.publish(&Event::Updated {
            old,
            new: new.clone(),
        });
        trace!(%id, version = %new.metadata.version, "updated");
        Ok(new)
    }

    /// [`Store::update`] with `expected = current`, retried on `Conflict` by
    /// re-reading. Bounded, although with in-process writers a couple of
    /// attempts always suffice.
    pub fn update_with_retry<F>(&self, id: &ResourceId, actor: &Actor, mut mutate: F) -> Result<Resource>
    where
        F: FnMut(&mut Resource),
    {
        const ATTEMPTS: usize = 10;
        let mut last = Error::Conflict(id.clone());
        for _ in 0..ATTEMPTS {
            let current = self.get(id)?;
            match self.update(id, current.metadata.version, actor, &mut mutate) {
                Ok(resource) => return Ok(resource),
                Err(err @ Error::Conflict(_)) => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Destroy a resource.
    ///
    /// With finalizers present the resource enters the tearing-down phase and
    /// `PreconditionFailed` is returned; the destroy completes when the last
    /// finalizer is removed.
    pub fn destroy(&self, id: &ResourceId, actor: &Actor) -> Result<()> {
        let mut shard = self.shard(id.resource_type).write();
        let ns = shard
            .namespaces
            .get_mut(&id.namespace)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let stored = ns
            .entries
            .get(&id.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        check_owner(&stored, actor, id)?;

        if !stored.metadata.finalizers.is_empty() {
            if stored.metadata.phase != Phase::TearingDown {
                let old = stored.clone();
                let mut new = stored;
                new.metadata.phase = Phase::TearingDown;
                new.metadata.version = new.metadata.version.next();
                new.metadata.updated = Utc::now();
                ns.entries.insert(id.id.clone(), new.clone());
                ns.bus.publish(&Event::Updated { old, new });
                trace!(%id, "tearing down");
            }
            return Err(Error::PreconditionFailed(id.clone()));
        }

        if let Some(removed) = ns.entries.remove(&id.id) {
            ns.index.remove(&removed.metadata.labels, &id.id);
            ns.bus.publish(&Event::Destroyed(removed));
            trace!(%id, "destroyed");
        }
        Ok(())
    }

    /// Add `finalizer` to a resource (idempotent).
    pub fn add_finalizer(&self, id: &ResourceId, actor: &Actor, finalizer: &str) -> Result<()> {
        self.update(id, Version::UNDEFINED, actor, |r| {
            r.metadata.add_finalizer(finalizer);
        })
        .map(|_| ())
    }

    /// Remove `finalizer` from a resource (idempotent). Completes a deferred
    /// destroy if this was the last finalizer of a tearing-down resource.
    pub fn remove_finalizer(&self, id: &ResourceId, actor: &Actor, finalizer: &str) -> Result<()> {
        self.update(id, Version::UNDEFINED, actor, |r| {
            r.metadata.remove_finalizer(finalizer);
        })
        .map(|_| ())
    }

    /// Subscribe to changes of `(resource_type, namespace)`.
    ///
    /// The stream starts with the current state replayed as
    /// [`Event::Created`] (sorted by id) followed by [`Event::Bootstrapped`],
    /// then delivers live events in commit order.
    pub fn watch(&self, resource_type: ResourceType, namespace: &str) -> WatchStream {
        let mut shard = self.shard(resource_type).write();
        let ns = shard.namespace_mut(namespace);
        let mut snapshot: Vec<Resource> = ns.entries.values().cloned().collect();
        snapshot.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        let initial: VecDeque<Event> = snapshot
            .into_iter()
            .map(Event::Created)
            .chain(std::iter::once(Event::Bootstrapped))
            .collect();
        ns.bus.subscribe(initial, self.inner.options.watch_queue_depth)
    }
}

fn check_owner(stored: &Resource, actor: &Actor, id: &ResourceId) -> Result<()> {
    if actor.internal {
        return Ok(());
    }
    match (&stored.metadata.owner, &actor.owner) {
        (None, _) => Ok(()),
        (Some(owner), Some(attempted)) if owner == attempted => Ok(()),
        (Some(owner), attempted) => Err(Error::OwnerConflict {
            id: id.clone(),
            owner: Some(owner.name().to_string()),
            attempted: attempted.as_ref().map(|a| a.name().to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, Lagged, Store, StoreOptions};
    use fleet_core::{
        machine::{MachineLabelsSpec, MachineSpec},
        Actor, Error, Owner, Phase, Resource, ResourceId, ResourceType, Selector, Spec, Version,
    };
    use futures::StreamExt;

    fn machine(id: &str, connected: bool) -> Resource {
        Resource::new(
            "default",
            id,
            Spec::Machine(MachineSpec {
                connected,
                management_address: format!("{id}.internal:50000"),
            }),
        )
    }

    fn machine_id(id: &str) -> ResourceId {
        ResourceId::new(ResourceType::Machine, "default", id)
    }

    #[test]
    fn create_get_and_conflict() {
        let store = Store::new();
        let created = store.create(machine("m1", true), &Actor::anonymous()).unwrap();
        assert_eq!(created.metadata.version, Version::INITIAL);

        let fetched = store.get(&machine_id("m1")).unwrap();
        assert!(fetched.spec.as_machine().unwrap().connected);

        assert!(matches!(
            store.create(machine("m1", false), &Actor::anonymous()),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            store.get(&machine_id("m2")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn update_bumps_version_and_checks_expected() {
        let store = Store::new();
        let created = store.create(machine("m1", true), &Actor::anonymous()).unwrap();

        let updated = store
            .update(&machine_id("m1"), created.metadata.version, &Actor::anonymous(), |r| {
                if let Spec::Machine(spec) = &mut r.spec {
                    spec.connected = false;
                }
            })
            .unwrap();
        assert_eq!(updated.metadata.version, created.metadata.version.next());
        assert!(!updated.spec.as_machine().unwrap().connected);

        // stale expected version
        assert!(matches!(
            store.update(&machine_id("m1"), created.metadata.version, &Actor::anonymous(), |_| {}),
            Err(Error::Conflict(_))
        ));
        // undefined matches anything
        store
            .update(&machine_id("m1"), Version::UNDEFINED, &Actor::anonymous(), |_| {})
            .unwrap();
    }

    #[test]
    fn update_with_retry_rereads_current_version() {
        let store = Store::new();
        store.create(machine("m1", true), &Actor::anonymous()).unwrap();
        store
            .update_with_retry(&machine_id("m1"), &Actor::anonymous(), |r| {
                r.metadata.labels.insert("zone".into(), "a".into());
            })
            .unwrap();
        assert_eq!(
            store.get(&machine_id("m1")).unwrap().metadata.labels.get("zone"),
            Some(&"a".to_string())
        );
    }

    #[test]
    fn ownership_is_set_on_create_and_enforced() {
        let store = Store::new();
        let owner = Actor::controller(Owner::new("MachineStatusController"));
        let status = Resource::new("default", "m1", Spec::MachineLabels(MachineLabelsSpec));
        store.create(status, &owner).unwrap();
        let id = ResourceId::new(ResourceType::MachineLabels, "default", "m1");

        // other writers are rejected
        assert!(matches!(
            store.update(&id, Version::UNDEFINED, &Actor::anonymous(), |_| {}),
            Err(Error::OwnerConflict { .. })
        ));
        assert!(matches!(
            store.destroy(&id, &Actor::controller(Owner::new("Other"))),
            Err(Error::OwnerConflict { .. })
        ));

        // the owner and the internal actor are not
        store.update(&id, Version::UNDEFINED, &owner, |_| {}).unwrap();
        store
            .update(&id, Version::UNDEFINED, &Actor::internal(), |_| {})
            .unwrap();
    }

    #[test]
    fn destroy_defers_until_finalizers_lift() {
        let store = Store::new();
        store.create(machine("m1", true), &Actor::anonymous()).unwrap();
        store
            .add_finalizer(&machine_id("m1"), &Actor::internal(), "ctrl")
            .unwrap();

        assert!(matches!(
            store.destroy(&machine_id("m1"), &Actor::anonymous()),
            Err(Error::PreconditionFailed(_))
        ));
        let stored = store.get(&machine_id("m1")).unwrap();
        assert_eq!(stored.metadata.phase, Phase::TearingDown);

        // lifting the last finalizer completes the deferred destroy
        store
            .remove_finalizer(&machine_id("m1"), &Actor::internal(), "ctrl")
            .unwrap();
        assert!(matches!(
            store.get(&machine_id("m1")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn list_uses_label_index_and_id_prefix() {
        let store = Store::new();
        for (id, zone) in [("m1", "a"), ("m2", "b"), ("n1", "a")] {
            let res = machine(id, true).with_label("zone", zone);
            store.create(res, &Actor::anonymous()).unwrap();
        }

        let zone_a = store.list(
            ResourceType::Machine,
            "default",
            &Selector::default().equal("zone", "a"),
        );
        assert_eq!(
            zone_a.iter().map(|r| r.metadata.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "n1"]
        );

        let prefixed = store.list(
            ResourceType::Machine,
            "default",
            &Selector::default().equal("zone", "a").id_prefix("m"),
        );
        assert_eq!(prefixed.len(), 1);
        assert_eq!(prefixed[0].metadata.id, "m1");

        // not-exists cannot use the index and falls back to a scan
        let unlabeled = store.list(
            ResourceType::Machine,
            "default",
            &Selector::default().not_exists("zone"),
        );
        assert!(unlabeled.is_empty());
    }

    #[test]
    fn label_index_follows_updates() {
        let store = Store::new();
        store
            .create(machine("m1", true).with_label("zone", "a"), &Actor::anonymous())
            .unwrap();
        store
            .update(&machine_id("m1"), Version::UNDEFINED, &Actor::anonymous(), |r| {
                r.metadata.labels.insert("zone".into(), "b".into());
            })
            .unwrap();

        assert!(store
            .list(ResourceType::Machine, "default", &Selector::default().equal("zone", "a"))
            .is_empty());
        assert_eq!(
            store
                .list(ResourceType::Machine, "default", &Selector::default().equal("zone", "b"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn watch_replays_snapshot_then_streams_live_events() {
        let store = Store::new();
        store.create(machine("m1", true), &Actor::anonymous()).unwrap();

        let mut watch = store.watch(ResourceType::Machine, "default");
        assert!(matches!(watch.next().await, Some(Ok(Event::Created(r))) if r.metadata.id == "m1"));
        assert!(matches!(watch.next().await, Some(Ok(Event::Bootstrapped))));

        store.create(machine("m2", true), &Actor::anonymous()).unwrap();
        store
            .update(&machine_id("m2"), Version::UNDEFINED, &Actor::anonymous(), |r| {
                if let Spec::Machine(spec) = &mut r.spec {
                    spec.connected = false;
                }
            })
            .unwrap();
        store.destroy(&machine_id("m2"), &Actor::anonymous()).unwrap();

        assert!(matches!(watch.next().await, Some(Ok(Event::Created(r))) if r.metadata.id == "m2"));
        match watch.next().await {
            Some(Ok(Event::Updated { old, new })) => {
                assert!(old.spec.as_machine().unwrap().connected);
                assert!(!new.spec.as_machine().unwrap().connected);
            }
            other => panic!("expected update event, got {other:?}"),
        }
        assert!(matches!(watch.next().await, Some(Ok(Event::Destroyed(r))) if r.metadata.id == "m2"));
    }

    #[tokio::test]
    async fn slow_watcher_is_resynced_not_blocked() {
        let store = Store::with_options(StoreOptions {
            watch_queue_depth: 2,
        });
        let mut watch = store.watch(ResourceType::Machine, "default");
        for i in 0..4 {
            store
                .create(machine(&format!("m{i}"), true), &Actor::anonymous())
                .unwrap();
        }
        // the snapshot replay plus the buffered events drain first
        let mut saw_lag = false;
        while let Some(item) = watch.next().await {
            if matches!(item, Err(Lagged)) {
                saw_lag = true;
            }
        }
        assert!(saw_lag);
    }
}
