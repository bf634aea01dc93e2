//! Typed resources: ids, type tags and the tagged spec payload

use crate::{
    machine::{MachineLabelsSpec, MachineSpec, MachineStatusSnapshotSpec, MachineStatusSpec},
    metadata::Metadata,
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The namespace domain resources live in unless stated otherwise.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Tag identifying the kind of a resource; one per [`Spec`] variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// A known node, created by the admission pipeline
    Machine,
    /// Raw event payload pushed by a connected machine
    MachineStatusSnapshot,
    /// User-supplied label overrides (metadata labels only)
    MachineLabels,
    /// Derived status, owned by the MachineStatus controller
    MachineStatus,
}

impl ResourceType {
    /// Every type the store shards for.
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Machine,
        ResourceType::MachineStatusSnapshot,
        ResourceType::MachineLabels,
        ResourceType::MachineStatus,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Machine => "Machine",
            ResourceType::MachineStatusSnapshot => "MachineStatusSnapshot",
            ResourceType::MachineLabels => "MachineLabels",
            ResourceType::MachineStatus => "MachineStatus",
        }
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, namespaced reference to a resource: the store's unique key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId {
    /// The type tag
    pub resource_type: ResourceType,
    /// The namespace
    pub namespace: String,
    /// The id within `(type, namespace)`
    pub id: String,
}

impl ResourceId {
    pub fn new(
        resource_type: ResourceType,
        namespace: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        ResourceId {
            resource_type,
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.resource_type, self.namespace, self.id)
    }
}

/// The typed payload of a resource; the variant determines the
/// [`ResourceType`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Spec {
    Machine(MachineSpec),
    MachineStatusSnapshot(MachineStatusSnapshotSpec),
    MachineLabels(MachineLabelsSpec),
    MachineStatus(MachineStatusSpec),
}

impl Spec {
    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Spec::Machine(_) => ResourceType::Machine,
            Spec::MachineStatusSnapshot(_) => ResourceType::MachineStatusSnapshot,
            Spec::MachineLabels(_) => ResourceType::MachineLabels,
            Spec::MachineStatus(_) => ResourceType::MachineStatus,
        }
    }

    #[must_use]
    pub fn as_machine(&self) -> Option<&MachineSpec> {
        match self {
            Spec::Machine(spec) => Some(spec),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_machine_status(&self) -> Option<&MachineStatusSpec> {
        match self {
            Spec::MachineStatus(spec) => Some(spec),
            _ => None,
        }
    }
}

/// A resource: metadata plus its typed spec.
///
/// Version, owner, timestamps and phase are maintained by the store; values
/// set on a freshly built `Resource` are normalized away on create.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub metadata: Metadata,
    pub spec: Spec,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, spec: Spec) -> Self {
        Resource {
            metadata: Metadata::new(namespace, id),
            spec,
        }
    }

    #[must_use]
    pub fn resource_type(&self) -> ResourceType {
        self.spec.resource_type()
    }

    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId {
            resource_type: self.resource_type(),
            namespace: self.metadata.namespace.clone(),
            id: self.metadata.id.clone(),
        }
    }

    /// Builder sugar for intent construction in reconcilers and tests.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }
}
