//! Resource pollers: project cached node resources into `Info` slices
//!
//! Each poller owns a distinct slice of [`Info`] and recomputes it in full
//! from the cache of node resources it watches, so a deleted remote resource
//! drops out on the next event. The filtering rules live here.

use super::info::Info;
use crate::{
    node::{
        NodeNamespace, NodeResource, RouteScope, ADDRESS_SET_CURRENT, ADDRESS_SET_ROUTED_NO_K8S,
        LABELS_META_TAG,
    },
    schematic,
};
use fleet_core::machine::{MemoryModule, NetworkLinkStatus, PlatformMetadata, Processor};
use serde::Deserialize;
use std::{collections::BTreeMap, net::IpAddr};
use tracing::warn;

/// One poller per watched node resource kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Poller {
    Hostname,
    Routes,
    Addresses,
    Links,
    Processors,
    MemoryModules,
    PlatformMetadata,
    MetaKeys,
    Extensions,
}

impl Poller {
    pub(crate) const ALL: [Poller; 9] = [
        Poller::Hostname,
        Poller::Routes,
        Poller::Addresses,
        Poller::Links,
        Poller::Processors,
        Poller::MemoryModules,
        Poller::PlatformMetadata,
        Poller::MetaKeys,
        Poller::Extensions,
    ];

    /// Which poller consumes a given node resource.
    pub(crate) fn of(resource: &NodeResource) -> Poller {
        match resource {
            NodeResource::Hostname(_) => Poller::Hostname,
            NodeResource::Route(_) => Poller::Routes,
            NodeResource::NodeAddress(_) => Poller::Addresses,
            NodeResource::LinkStatus(_) => Poller::Links,
            NodeResource::Processor(_) => Poller::Processors,
            NodeResource::MemoryModule(_) => Poller::MemoryModules,
            NodeResource::PlatformMetadata(_) => Poller::PlatformMetadata,
            NodeResource::MetaKey(_) => Poller::MetaKeys,
            NodeResource::ExtensionStatus(_) => Poller::Extensions,
        }
    }

    /// The namespace whose watch feeds this poller.
    pub(crate) fn namespace(&self) -> NodeNamespace {
        match self {
            Poller::Hostname | Poller::Routes | Poller::Addresses | Poller::Links => {
                NodeNamespace::Network
            }
            Poller::Processors | Poller::MemoryModules => NodeNamespace::Hardware,
            Poller::PlatformMetadata | Poller::MetaKeys | Poller::Extensions => {
                NodeNamespace::Runtime
            }
        }
    }

    pub(crate) fn key(&self) -> &'static str {
        match self {
            Poller::Hostname => "hostname",
            Poller::Routes => "routes",
            Poller::Addresses => "addresses",
            Poller::Links => "links",
            Poller::Processors => "processors",
            Poller::MemoryModules => "memorymodules",
            Poller::PlatformMetadata => "platformmetadata",
            Poller::MetaKeys => "metakeys",
            Poller::Extensions => "extensions",
        }
    }

    /// Recompute this poller's `Info` slice from its resource cache.
    pub(crate) fn apply(&self, entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
        match self {
            Poller::Hostname => apply_hostname(entries, info),
            Poller::Routes => apply_routes(entries, info),
            Poller::Addresses => apply_addresses(entries, info),
            Poller::Links => apply_links(entries, info),
            Poller::Processors => apply_processors(entries, info),
            Poller::MemoryModules => apply_memory_modules(entries, info),
            Poller::PlatformMetadata => apply_platform_metadata(entries, info),
            Poller::MetaKeys => apply_meta_keys(entries, info),
            Poller::Extensions => apply_extensions(entries, info),
        }
    }
}

fn apply_hostname(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    // singleton resource; keep the last observed value while it is absent
    for resource in entries.values() {
        if let NodeResource::Hostname(spec) = resource {
            info.hostname = Some(spec.hostname.clone());
            info.domainname = Some(spec.domainname.clone());
        }
    }
}

fn apply_routes(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    // only global default routes with a usable gateway contribute
    let mut gateways: Vec<String> = entries
        .values()
        .filter_map(|resource| match resource {
            NodeResource::Route(route) => Some(route),
            _ => None,
        })
        .filter(|route| match route.destination {
            None => true,
            Some(destination) => destination.is_unspecified(),
        })
        .filter(|route| route.scope == RouteScope::Global)
        .filter_map(|route| route.gateway)
        .filter(|gateway| !gateway.is_unspecified())
        .map(|gateway| gateway.to_string())
        .collect();
    gateways.sort();
    gateways.dedup();
    info.default_gateways = Some(gateways);
}

/// The SideroLink tunnel ULA range; tunnel addresses never belong in the
/// machine status.
fn is_tunnel_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            seg[0] == 0xfdae && seg[1] == 0x41e4 && seg[2] == 0x649b
        }
        IpAddr::V4(_) => false,
    }
}

fn apply_addresses(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    // in maintenance mode only the "current" set exists; otherwise use the
    // set with Kubernetes-managed addresses already filtered out
    let wanted = if info.maintenance_mode {
        ADDRESS_SET_CURRENT
    } else {
        ADDRESS_SET_ROUTED_NO_K8S
    };
    let Some(NodeResource::NodeAddress(spec)) = entries.get(wanted) else {
        info.addresses = Some(Vec::new());
        return;
    };
    info.addresses = Some(
        spec.addresses
            .iter()
            .filter(|addr| !is_tunnel_address(addr))
            .map(|addr| addr.to_string())
            .collect(),
    );
}

fn apply_links(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    let links: Vec<NetworkLinkStatus> = entries
        .values()
        .filter_map(|resource| match resource {
            NodeResource::LinkStatus(link) if link.physical => Some(NetworkLinkStatus {
                linux_name: link.name.clone(),
                hardware_address: link.hardware_address.clone(),
                speed_mbps: link.speed_mbps,
                link_up: link.link_up,
                description: [link.vendor.as_str(), link.product.as_str()]
                    .iter()
                    .filter(|part| !part.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join(" "),
            }),
            _ => None,
        })
        .collect();
    info.network_links = Some(links);
}

fn apply_processors(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    let processors: Vec<Processor> = entries
        .values()
        .filter_map(|resource| match resource {
            NodeResource::Processor(cpu) if cpu.core_count > 0 && cpu.max_speed_mhz > 0 => {
                Some(Processor {
                    manufacturer: cpu.manufacturer.clone(),
                    description: cpu.product_name.clone(),
                    frequency_mhz: cpu.max_speed_mhz,
                    core_count: cpu.core_count,
                    thread_count: cpu.thread_count,
                })
            }
            _ => None,
        })
        .collect();
    info.processors = Some(processors);
}

fn apply_memory_modules(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    let modules: Vec<MemoryModule> = entries
        .values()
        .filter_map(|resource| match resource {
            NodeResource::MemoryModule(module) if module.size_mb > 0 => Some(MemoryModule {
                description: module.manufacturer.clone(),
                size_mb: module.size_mb,
            }),
            _ => None,
        })
        .collect();
    info.memory_modules = Some(modules);
}

fn apply_platform_metadata(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    // singleton resource; keep the last observed value while it is absent
    for resource in entries.values() {
        if let NodeResource::PlatformMetadata(spec) = resource {
            info.platform_metadata = Some(PlatformMetadata {
                platform: spec.platform.clone(),
                hostname: spec.hostname.clone(),
                region: spec.region.clone(),
                zone: spec.zone.clone(),
                instance_type: spec.instance_type.clone(),
                instance_id: spec.instance_id.clone(),
                provider_id: spec.provider_id.clone(),
                spot: spec.spot,
            });
        }
    }
}

/// Current shape of the labels META value. The field is required so a
/// legacy bare map does not silently decode to an empty label set.
#[derive(Deserialize)]
struct ImageLabelsBlob {
    #[serde(rename = "machineLabels")]
    machine_labels: BTreeMap<String, String>,
}

fn decode_image_labels(value: &str) -> Option<BTreeMap<String, String>> {
    if let Ok(blob) = serde_json::from_str::<ImageLabelsBlob>(value) {
        return Some(blob.machine_labels);
    }
    // legacy shape: a bare map
    serde_json::from_str::<BTreeMap<String, String>>(value).ok()
}

fn apply_meta_keys(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    // only the labels tag is consumed; other META keys are none of our
    // business. An absent or undecodable key keeps the last observed labels.
    for resource in entries.values() {
        let NodeResource::MetaKey(meta) = resource else {
            continue;
        };
        if meta.tag != LABELS_META_TAG {
            continue;
        }
        match decode_image_labels(&meta.value) {
            Some(labels) => info.image_labels = Some(labels),
            None => warn!(tag = meta.tag, "undecodable labels meta key"),
        }
    }
}

fn apply_extensions(entries: &BTreeMap<String, NodeResource>, info: &mut Info) {
    let extensions: Vec<_> = entries
        .values()
        .filter_map(|resource| match resource {
            NodeResource::ExtensionStatus(ext) => Some(ext.clone()),
            _ => None,
        })
        .collect();
    info.schematic = Some(schematic::resolve(extensions.iter()));
}
