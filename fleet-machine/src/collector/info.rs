//! Volatile per-machine snapshot maintained by the collector task

use fleet_core::machine::{
    BlockDevice, MemoryModule, NetworkLinkStatus, PlatformMetadata, Processor, SchematicInfo,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// Everything the collector has observed about one machine.
///
/// `None` means "not yet observed" and is never written over a previously
/// observed value: each poller only replaces the slice it fully recomputed.
/// `image_labels` holds the raw decoded labels from the META key; masking
/// against user labels happens in the MachineStatus reconciler so overrides
/// can be lifted again.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Info {
    pub talos_version: Option<String>,
    pub arch: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub addresses: Option<Vec<String>>,
    pub default_gateways: Option<Vec<String>>,
    pub network_links: Option<Vec<NetworkLinkStatus>>,
    pub processors: Option<Vec<Processor>>,
    pub memory_modules: Option<Vec<MemoryModule>>,
    pub blockdevices: Option<Vec<BlockDevice>>,
    pub platform_metadata: Option<PlatformMetadata>,
    pub schematic: Option<SchematicInfo>,
    pub image_labels: Option<BTreeMap<String, String>>,
    pub maintenance_mode: bool,
}

/// Mutex-guarded [`Info`] shared between the owning task (writer) and the
/// MachineStatus reconciler (reader).
#[derive(Clone, Default)]
pub struct SharedInfo {
    inner: Arc<Mutex<Info>>,
}

impl SharedInfo {
    /// Deep-copy snapshot for readers.
    #[must_use]
    pub fn snapshot(&self) -> Info {
        self.inner.lock().clone()
    }

    /// Mutate under the lock; only the owning task calls this.
    pub(crate) fn update<F: FnOnce(&mut Info)>(&self, mutate: F) {
        mutate(&mut self.inner.lock());
    }
}
