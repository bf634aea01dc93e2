//! Client abstraction over the remote node's management API
//!
//! A connected machine exposes a resource-watch RPC (namespaces `network`,
//! `hardware` and `runtime`) plus two unary RPCs (`version`, `disks`). The
//! collector only depends on the [`NodeClient`] trait, so transports and
//! tests plug in behind [`NodeClientFactory`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{fmt, net::IpAddr, sync::Arc};
use thiserror::Error;

/// Errors surfaced by node clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transient transport failure; the collector reconnects with backoff
    #[error("node unavailable: {0}")]
    Unavailable(String),
    /// The node does not implement this RPC; a silent no-op for pollers
    #[error("{0} is not implemented by this node")]
    Unimplemented(&'static str),
    /// The surrounding task was cancelled
    #[error("cancelled")]
    Cancelled,
}

/// Remote resource namespaces served by the watch RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeNamespace {
    Network,
    Hardware,
    Runtime,
}

impl NodeNamespace {
    pub const ALL: [NodeNamespace; 3] = [
        NodeNamespace::Network,
        NodeNamespace::Hardware,
        NodeNamespace::Runtime,
    ];
}

impl fmt::Display for NodeNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeNamespace::Network => "network",
            NodeNamespace::Hardware => "hardware",
            NodeNamespace::Runtime => "runtime",
        })
    }
}

/// META tag carrying the image labels blob.
pub const LABELS_META_TAG: u8 = 0x0c;

/// Node address set published while the machine runs the maintenance
/// service.
pub const ADDRESS_SET_CURRENT: &str = "current";

/// Node address set with Kubernetes-managed addresses filtered out; used for
/// machines running the full OS.
pub const ADDRESS_SET_ROUTED_NO_K8S: &str = "routed-no-k8s";

/// A typed resource reported by the node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeResource {
    Hostname(HostnameSpec),
    Route(RouteSpec),
    NodeAddress(NodeAddressSpec),
    LinkStatus(LinkStatusSpec),
    Processor(ProcessorSpec),
    MemoryModule(MemoryModuleSpec),
    PlatformMetadata(PlatformMetadataSpec),
    MetaKey(MetaKeySpec),
    ExtensionStatus(ExtensionStatusSpec),
}

impl NodeResource {
    #[must_use]
    pub fn namespace(&self) -> NodeNamespace {
        match self {
            NodeResource::Hostname(_)
            | NodeResource::Route(_)
            | NodeResource::NodeAddress(_)
            | NodeResource::LinkStatus(_) => NodeNamespace::Network,
            NodeResource::Processor(_) | NodeResource::MemoryModule(_) => NodeNamespace::Hardware,
            NodeResource::PlatformMetadata(_)
            | NodeResource::MetaKey(_)
            | NodeResource::ExtensionStatus(_) => NodeNamespace::Runtime,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostnameSpec {
    pub hostname: String,
    pub domainname: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteScope {
    Global,
    Site,
    Link,
    Host,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    /// `None` (or the unspecified address) marks a default route
    pub destination: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub scope: RouteScope,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeAddressSpec {
    pub addresses: Vec<IpAddr>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStatusSpec {
    pub name: String,
    /// Physical interfaces only make it into the machine status
    pub physical: bool,
    pub hardware_address: String,
    pub speed_mbps: u64,
    pub link_up: bool,
    pub vendor: String,
    pub product: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessorSpec {
    pub manufacturer: String,
    pub product_name: String,
    pub max_speed_mhz: u32,
    pub core_count: u32,
    pub thread_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryModuleSpec {
    pub manufacturer: String,
    pub size_mb: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlatformMetadataSpec {
    pub platform: String,
    pub hostname: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub instance_id: String,
    pub provider_id: String,
    pub spot: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaKeySpec {
    pub tag: u8,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtensionStatusSpec {
    pub name: String,
    pub version: String,
    pub description: String,
}

/// Events of the node's resource-watch RPC.
///
/// A watch replays the current state of the namespace first, closes the
/// replay with [`Bootstrapped`](NodeEvent::Bootstrapped) and streams live
/// changes afterwards, mirroring the store's own watch contract.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    Applied { id: String, resource: NodeResource },
    Destroyed { id: String, resource: NodeResource },
    Bootstrapped,
}

/// Reply of the `version` RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub arch: String,
}

/// One entry of the `disks` RPC reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Disk {
    pub linux_name: String,
    pub size: u64,
    pub model: String,
    pub serial: String,
    pub wwid: String,
    pub bus_path: String,
    pub device_type: String,
    pub readonly: bool,
    pub system_disk: bool,
}

/// A live management session with one node.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Whether the session talks to the maintenance service rather than the
    /// full OS; decided at connect time.
    fn maintenance_mode(&self) -> bool;

    /// Watch one resource namespace. See [`NodeEvent`] for the replay
    /// contract. The stream ending (or yielding an error) means the
    /// connection is gone and the collector reconnects.
    async fn watch(
        &self,
        namespace: NodeNamespace,
    ) -> Result<BoxStream<'static, Result<NodeEvent, ClientError>>, ClientError>;

    /// OS version and architecture. `Unimplemented` is a valid answer.
    async fn version(&self) -> Result<VersionInfo, ClientError>;

    /// Block devices attached to the node.
    async fn disks(&self) -> Result<Vec<Disk>, ClientError>;
}

/// Dials nodes at their management address.
#[async_trait]
pub trait NodeClientFactory: Send + Sync + 'static {
    async fn connect(&self, management_address: &str) -> Result<Arc<dyn NodeClient>, ClientError>;
}
