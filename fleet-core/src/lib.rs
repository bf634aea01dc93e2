//! Core resource model for the fleet reconciliation runtime
//!
//! This crate defines the versioned resource model shared by the store, the
//! controller runtime and the machine collectors: typed resource ids,
//! metadata (versions, ownership, finalizers, labels), label selector
//! expressions, the tagged spec payloads for the machine domain, and the
//! error taxonomy every layer speaks.
//!
//! Nothing in here performs I/O; the store and runtime live in
//! `fleet-runtime`, the collectors and domain reconcilers in `fleet-machine`.

pub mod error;
pub mod labels;
pub mod machine;
pub mod metadata;
pub mod resource;

pub use error::{Error, Result};
pub use labels::{Expression, Selector};
pub use metadata::{Actor, Metadata, Owner, Phase, Version};
pub use resource::{Resource, ResourceId, ResourceType, Spec, DEFAULT_NAMESPACE};
