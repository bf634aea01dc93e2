//! The MachineStatus reconciler
//!
//! Derives one `MachineStatus` per `Machine` from the machine itself, the
//! collector's `Info` snapshot, the optional status snapshot pushed by the
//! node, and user label overrides. Also drives the collector lifecycle: a
//! connected machine gets a collector task, a disconnected or vanishing one
//! loses it.

use crate::collector::{CollectorPool, Info};
use async_trait::async_trait;
use fleet_core::{
    machine::{labels, HardwareStatus, MachineSpec, MachineStatusSpec, NetworkStatus},
    Error, Phase, Resource, ResourceType, Result, Spec, DEFAULT_NAMESPACE,
};
use fleet_runtime::{Input, Output, ReconcileContext, Reconciler};
use futures::stream::BoxStream;
use std::collections::BTreeMap;

/// Controller name; doubles as the owner string of every `MachineStatus`.
pub const CONTROLLER_NAME: &str = "MachineStatusController";

/// See the module docs.
pub struct MachineStatusController {
    pool: CollectorPool,
}

impl MachineStatusController {
    #[must_use]
    pub fn new(pool: CollectorPool) -> Self {
        MachineStatusController { pool }
    }

    /// Fold the collector snapshot into the spec carried over from the
    /// stored status. Fields the collector has not observed keep their
    /// previous values, so a reconnect does not wipe collected state.
    fn fold_info(spec: &mut MachineStatusSpec, info: &Info) {
        if let Some(version) = &info.talos_version {
            spec.talos_version = Some(version.clone());
        }
        if let Some(arch) = &info.arch {
            spec.arch = Some(arch.clone());
        }
        if let Some(schematic) = &info.schematic {
            spec.schematic = Some(schematic.clone());
        }
        if let Some(platform) = &info.platform_metadata {
            spec.platform_metadata = Some(platform.clone());
        }

        let network_observed = info.hostname.is_some()
            || info.domainname.is_some()
            || info.addresses.is_some()
            || info.default_gateways.is_some()
            || info.network_links.is_some();
        if spec.network.is_some() || network_observed {
            let mut network = spec.network.take().unwrap_or_else(NetworkStatus::default);
            if let Some(hostname) = &info.hostname {
                network.hostname = hostname.clone();
            }
            if let Some(domainname) = &info.domainname {
                network.domainname = domainname.clone();
            }
            if let Some(addresses) = &info.addresses {
                network.addresses = addresses.clone();
            }
            if let Some(gateways) = &info.default_gateways {
                network.default_gateways = gateways.clone();
            }
            if let Some(links) = &info.network_links {
                network.network_links = links.clone();
            }
            spec.network = Some(network);
        }

        let hardware_observed = info.processors.is_some()
            || info.memory_modules.is_some()
            || info.blockdevices.is_some();
        if spec.hardware.is_some() || hardware_observed {
            let mut hardware = spec.hardware.take().unwrap_or_else(HardwareStatus::default);
            if let Some(processors) = &info.processors {
                hardware.processors = processors.clone();
            }
            if let Some(modules) = &info.memory_modules {
                hardware.memory_modules = modules.clone();
            }
            if let Some(devices) = &info.blockdevices {
                hardware.blockdevices = devices.clone();
            }
            spec.hardware = Some(hardware);
        }
    }
}

#[async_trait]
impl Reconciler for MachineStatusController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::strong(ResourceType::Machine, DEFAULT_NAMESPACE),
            Input::weak(ResourceType::MachineStatusSnapshot, DEFAULT_NAMESPACE),
            Input::weak(ResourceType::MachineLabels, DEFAULT_NAMESPACE),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::new(ResourceType::MachineStatus, DEFAULT_NAMESPACE)]
    }

    fn triggers(&self) -> Vec<BoxStream<'static, String>> {
        self.pool.trigger_stream().into_iter().collect()
    }

    async fn reconcile(&self, ctx: &ReconcileContext, key: &str) -> Result<Vec<Resource>> {
        let machine = match ctx.get(ResourceType::Machine, DEFAULT_NAMESPACE, key)? {
            Some(machine) if machine.metadata.phase == Phase::Running => machine,
            // gone or tearing down: the collector stops and the status goes
            _ => {
                self.pool.stop(key);
                return Ok(Vec::new());
            }
        };
        let machine_spec: &MachineSpec = machine.spec.as_machine().ok_or_else(|| {
            Error::Internal(format!("machine {key} carries a foreign spec"))
        })?;

        if machine_spec.connected {
            self.pool.ensure(key, &machine_spec.management_address);
        } else {
            self.pool.stop(key);
        }

        // carry the stored status forward so collected state survives
        // disconnects; the machine flags are recomputed every pass
        let stored = ctx.get(ResourceType::MachineStatus, DEFAULT_NAMESPACE, key)?;
        let mut spec = stored
            .as_ref()
            .and_then(|r| r.spec.as_machine_status().cloned())
            .unwrap_or_default();
        spec.connected = machine_spec.connected;

        let user_labels: Option<BTreeMap<String, String>> = ctx
            .get(ResourceType::MachineLabels, DEFAULT_NAMESPACE, key)?
            .map(|r| r.metadata.labels.clone());

        let info = self.pool.info(key);
        // the raw image labels drive the merge; the spec field is masked so
        // user-overridden keys do not show up twice
        let raw_image_labels = info
            .as_ref()
            .and_then(|i| i.image_labels.clone())
            .or_else(|| spec.image_labels.clone());
        if let Some(info) = &info {
            Self::fold_info(&mut spec, info);
            if let Some(raw) = &info.image_labels {
                let mut masked = raw.clone();
                if let Some(user) = &user_labels {
                    for overridden in user.keys() {
                        masked.remove(overridden);
                    }
                }
                spec.image_labels = Some(masked);
            }
        }

        // label merge: image labels first, user overrides second, machine
        // flags last; empty user values are meaningful and preserved
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        if let Some(image) = &raw_image_labels {
            merged.extend(image.clone());
        }
        if let Some(user) = &user_labels {
            merged.extend(user.clone());
        }
        if machine_spec.connected {
            merged.insert(labels::CONNECTED.to_string(), String::new());
        }
        if ctx
            .get(ResourceType::MachineStatusSnapshot, DEFAULT_NAMESPACE, key)?
            .is_some()
        {
            merged.insert(labels::REPORTING_EVENTS.to_string(), String::new());
        }

        let mut status = Resource::new(DEFAULT_NAMESPACE, key, Spec::MachineStatus(spec));
        status.metadata.labels = merged;
        Ok(vec![status])
    }
}

#[cfg(test)]
mod tests {
    use super::MachineStatusController;
    use crate::{
        collector::CollectorPool,
        node::{ClientError, NodeClient, NodeClientFactory},
    };
    use async_trait::async_trait;
    use fleet_core::{machine::MachineStatusSpec, Resource, ResourceType, Spec, DEFAULT_NAMESPACE};
    use fleet_runtime::{ReconcileContext, Reconciler};
    use std::sync::Arc;

    struct NoDial;

    #[async_trait]
    impl NodeClientFactory for NoDial {
        async fn connect(
            &self,
            _management_address: &str,
        ) -> Result<Arc<dyn NodeClient>, ClientError> {
            Err(ClientError::Unavailable("no node in unit tests".into()))
        }
    }

    fn controller() -> MachineStatusController {
        MachineStatusController::new(CollectorPool::new(Arc::new(NoDial)))
    }

    #[test]
    fn declares_machine_as_strong_input_and_owns_the_status() {
        let ctrl = controller();
        let inputs = ctrl.inputs();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0].resource_type, ResourceType::Machine);
        let outputs = ctrl.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].resource_type, ResourceType::MachineStatus);
        assert_eq!(outputs[0].namespace, DEFAULT_NAMESPACE);
    }

    #[tokio::test]
    async fn absent_machine_yields_empty_intent() {
        let ctrl = controller();
        let store = fleet_runtime::Store::new();
        let ctx = ReconcileContext::new(store);
        let intent = ctrl.reconcile(&ctx, "m1").await.unwrap();
        assert!(intent.is_empty());
    }

    #[test]
    fn fold_keeps_unobserved_slices() {
        use crate::collector::Info;
        let mut spec = MachineStatusSpec {
            talos_version: Some("v1.8.0".into()),
            ..MachineStatusSpec::default()
        };
        // a fresh, empty snapshot must not wipe anything
        MachineStatusController::fold_info(&mut spec, &Info::default());
        assert_eq!(spec.talos_version.as_deref(), Some("v1.8.0"));
        assert!(spec.network.is_none());

        let info = Info {
            hostname: Some("node-a".into()),
            ..Info::default()
        };
        MachineStatusController::fold_info(&mut spec, &info);
        assert_eq!(spec.network.as_ref().unwrap().hostname, "node-a");
    }

    #[test]
    fn status_resources_build_in_the_default_namespace() {
        let status = Resource::new(
            DEFAULT_NAMESPACE,
            "m1",
            Spec::MachineStatus(MachineStatusSpec::default()),
        );
        assert_eq!(status.metadata.namespace, DEFAULT_NAMESPACE);
    }
}
