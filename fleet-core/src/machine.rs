//! Spec payloads for the machine domain

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known label keys applied by the MachineStatus controller.
pub mod labels {
    /// Present iff the machine is currently connected.
    pub const CONNECTED: &str = "fleet.dev/connected";
    /// Present iff the machine is pushing status snapshot events.
    pub const REPORTING_EVENTS: &str = "fleet.dev/reporting-events";
}

/// A known node. Created and owned by the admission pipeline; an input to
/// the MachineStatus controller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Whether the node currently holds a management session
    pub connected: bool,
    /// Address the collector dials for node RPCs
    pub management_address: String,
}

/// Raw event payload pushed by a connected machine. Presence of the resource
/// signals the machine is reporting events; the payload itself is opaque to
/// the reconciliation core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatusSnapshotSpec {
    /// The last event received from the node, verbatim
    pub last_event: String,
}

/// User-supplied label overrides. The labels live on the resource metadata;
/// the spec carries nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineLabelsSpec;

/// Derived machine status, owned by the MachineStatus controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatusSpec {
    /// Mirrors `MachineSpec.connected`
    pub connected: bool,
    /// OS version reported by the node, once observed
    pub talos_version: Option<String>,
    /// CPU architecture reported by the node, once observed
    pub arch: Option<String>,
    /// Labels baked into the installation image, with user-overridden keys
    /// masked out; `None` until the labels meta key has been read
    pub image_labels: Option<BTreeMap<String, String>>,
    /// Image schematic identity resolved from the node's extensions
    pub schematic: Option<SchematicInfo>,
    /// Hardware inventory
    pub hardware: Option<HardwareStatus>,
    /// Network state
    pub network: Option<NetworkStatus>,
    /// Platform metadata as exposed by the hosting platform
    pub platform_metadata: Option<PlatformMetadata>,
}

/// Identity of the OS image composition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchematicInfo {
    /// Schematic id, or the canonical default when the node has no extensions
    pub id: String,
    /// Set when the node carries extensions the resolver does not recognize
    pub invalid: bool,
}

/// Hardware inventory collected from the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareStatus {
    pub processors: Vec<Processor>,
    pub memory_modules: Vec<MemoryModule>,
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    pub manufacturer: String,
    pub description: String,
    /// Max speed in MHz
    pub frequency_mhz: u32,
    pub core_count: u32,
    pub thread_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryModule {
    pub description: String,
    pub size_mb: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Kernel device name, e.g. `/dev/nvme0n1`
    pub linux_name: String,
    /// Size in bytes
    pub size: u64,
    pub model: String,
    pub serial: String,
    pub wwid: String,
    pub bus_path: String,
    /// `ssd`, `hdd`, `nvme`, ...
    pub device_type: String,
    pub readonly: bool,
    /// Whether the OS is installed on this device
    pub system_disk: bool,
}

/// Network state collected from the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub hostname: String,
    pub domainname: String,
    /// Post-filtering node addresses, as `ip/prefix` strings
    pub addresses: Vec<String>,
    /// Gateways of the node's default routes
    pub default_gateways: Vec<String>,
    /// Physical interfaces only
    pub network_links: Vec<NetworkLinkStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLinkStatus {
    pub linux_name: String,
    pub hardware_address: String,
    pub speed_mbps: u64,
    pub link_up: bool,
    /// Vendor and product, space-joined, when the link exposes them
    pub description: String,
}

/// Platform metadata exposed by the hosting platform, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMetadata {
    pub platform: String,
    pub hostname: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub instance_id: String,
    pub provider_id: String,
    pub spot: bool,
}
