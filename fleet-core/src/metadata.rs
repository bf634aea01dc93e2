//! Resource metadata: versions, ownership, phases and finalizers

use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Monotonically increasing per-resource version.
///
/// `Version::UNDEFINED` matches any stored version in optimistic updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    /// Matches any stored version.
    pub const UNDEFINED: Version = Version(0);

    /// The version assigned on create.
    pub const INITIAL: Version = Version(1);

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        self.0 == 0
    }

    /// The version after one more successful mutation.
    #[must_use]
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            f.write_str("undefined")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Interned controller identity used as the owner string of resources.
///
/// Cloning is a pointer bump; equality short-circuits on pointer identity so
/// the common same-controller comparison on every write does not re-scan the
/// name.
#[derive(Clone, Debug, Eq)]
pub struct Owner(Arc<str>);

impl Owner {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Owner(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Owner {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Hash for Owner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a store write is performed under.
///
/// Controllers write as themselves; the runtime and replay adapters write as
/// the *internal actor*, which bypasses ownership checks (but never version
/// checks).
#[derive(Clone, Debug, Default)]
pub struct Actor {
    /// Owner identity carried onto created resources and checked on mutation.
    pub owner: Option<Owner>,
    /// Internal actors may mutate resources owned by anyone.
    pub internal: bool,
}

impl Actor {
    /// An anonymous external writer (user edits, tests).
    #[must_use]
    pub fn anonymous() -> Self {
        Actor::default()
    }

    /// A controller writing its own outputs.
    #[must_use]
    pub fn controller(owner: Owner) -> Self {
        Actor {
            owner: Some(owner),
            internal: false,
        }
    }

    /// The runtime itself, or a trusted replay adapter.
    #[must_use]
    pub fn internal() -> Self {
        Actor {
            owner: None,
            internal: true,
        }
    }
}

/// Resource lifecycle phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// Live and mutable
    #[default]
    Running,
    /// Destroy was requested but finalizers are still present; removed as
    /// soon as the last finalizer is lifted
    TearingDown,
}

/// Metadata carried by every stored resource.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    /// Namespace the resource lives in
    pub namespace: String,
    /// Id, unique within `(namespace, type)`
    pub id: String,
    /// Monotonic version, bumped by the store on every successful mutation
    pub version: Version,
    /// The controller owning this resource, set on create and immutable
    pub owner: Option<Owner>,
    /// Creation timestamp, set by the store
    pub created: DateTime<Utc>,
    /// Last mutation timestamp, maintained by the store
    pub updated: DateTime<Utc>,
    /// Lifecycle phase
    pub phase: Phase,
    /// Finalizers deferring destroy while non-empty
    pub finalizers: Vec<String>,
    /// Labels; empty values are meaningful and preserved
    pub labels: BTreeMap<String, String>,
    /// Free-form annotations, not indexed
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Metadata {
            namespace: namespace.into(),
            id: id.into(),
            version: Version::UNDEFINED,
            owner: None,
            created: now,
            updated: now,
            phase: Phase::default(),
            finalizers: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds `finalizer` if missing; returns whether the set changed.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes `finalizer` if present; returns whether the set changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::{Metadata, Owner, Version};

    #[test]
    fn version_ordering_and_sentinel() {
        assert!(Version::UNDEFINED.is_undefined());
        assert!(!Version::INITIAL.is_undefined());
        assert!(Version::INITIAL.next() > Version::INITIAL);
        assert_eq!(format!("{}", Version::UNDEFINED), "undefined");
        assert_eq!(format!("{}", Version::INITIAL), "1");
    }

    #[test]
    fn owner_equality_is_by_name() {
        let a = Owner::new("MachineStatusController");
        let b = a.clone();
        let c = Owner::new("MachineStatusController".to_string());
        let d = Owner::new("Other");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn finalizers_dedupe_and_remove() {
        let mut meta = Metadata::new("default", "m1");
        assert!(meta.add_finalizer("ctrl"));
        assert!(!meta.add_finalizer("ctrl"));
        assert!(meta.has_finalizer("ctrl"));
        assert!(meta.remove_finalizer("ctrl"));
        assert!(!meta.remove_finalizer("ctrl"));
        assert!(meta.finalizers.is_empty());
    }
}
