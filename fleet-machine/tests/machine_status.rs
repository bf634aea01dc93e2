//! End-to-end scenarios: store + runtime + collector + MachineStatus
//! reconciler against a scripted node.

use async_trait::async_trait;
use fleet_core::{
    machine::{labels, MachineLabelsSpec, MachineSpec, MachineStatusSnapshotSpec},
    Actor, Resource, ResourceId, ResourceType, Spec, Version, DEFAULT_NAMESPACE,
};
use fleet_machine::{
    node::{
        ClientError, Disk, ExtensionStatusSpec, MetaKeySpec, NodeClient, NodeClientFactory,
        NodeEvent, NodeNamespace, NodeResource, VersionInfo, LABELS_META_TAG,
    },
    schematic::{DEFAULT_SCHEMATIC_ID, SCHEMATIC_EXTENSION_DESCRIPTION},
    CollectorPool, MachineStatusController,
};
use fleet_runtime::{Runtime, RuntimeHandle, Store};
use futures::{channel::mpsc, stream, StreamExt};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Scripted node: replays seeded resources per namespace, then streams
/// whatever the test applies later.
#[derive(Default)]
struct ScriptedNode {
    resources: Mutex<Vec<(String, NodeResource)>>,
    subscribers: Mutex<Vec<(NodeNamespace, mpsc::UnboundedSender<Result<NodeEvent, ClientError>>)>>,
}

impl ScriptedNode {
    fn seed(&self, id: &str, resource: NodeResource) {
        self.resources.lock().unwrap().push((id.to_string(), resource));
    }

    fn apply(&self, id: &str, resource: NodeResource) {
        let namespace = resource.namespace();
        {
            let mut resources = self.resources.lock().unwrap();
            resources.retain(|(existing, _)| existing != id);
            resources.push((id.to_string(), resource.clone()));
        }
        self.subscribers.lock().unwrap().retain(|(ns, tx)| {
            *ns != namespace
                || tx
                    .unbounded_send(Ok(NodeEvent::Applied {
                        id: id.to_string(),
                        resource: resource.clone(),
                    }))
                    .is_ok()
        });
    }
}

#[async_trait]
impl NodeClient for ScriptedNode {
    fn maintenance_mode(&self) -> bool {
        false
    }

    async fn watch(
        &self,
        namespace: NodeNamespace,
    ) -> Result<
        futures::stream::BoxStream<'static, Result<NodeEvent, ClientError>>,
        ClientError,
    > {
        let replay: Vec<Result<NodeEvent, ClientError>> = self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, resource)| resource.namespace() == namespace)
            .map(|(id, resource)| {
                Ok(NodeEvent::Applied {
                    id: id.clone(),
                    resource: resource.clone(),
                })
            })
            .collect();
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push((namespace, tx));
        Ok(stream::iter(replay)
            .chain(stream::iter(vec![Ok(NodeEvent::Bootstrapped)]))
            .chain(rx)
            .boxed())
    }

    async fn version(&self) -> Result<VersionInfo, ClientError> {
        Ok(VersionInfo {
            version: "v1.8.3".into(),
            arch: "amd64".into(),
        })
    }

    async fn disks(&self) -> Result<Vec<Disk>, ClientError> {
        Ok(vec![Disk {
            linux_name: "/dev/nvme0n1".into(),
            size: 512 * 1024 * 1024 * 1024,
            model: "Samsung PM9A1".into(),
            system_disk: true,
            ..Disk::default()
        }])
    }
}

struct ScriptedFactory {
    node: Arc<ScriptedNode>,
}

#[async_trait]
impl NodeClientFactory for ScriptedFactory {
    async fn connect(
        &self,
        _management_address: &str,
    ) -> Result<Arc<dyn NodeClient>, ClientError> {
        Ok(self.node.clone())
    }
}

struct Harness {
    store: Store,
    node: Arc<ScriptedNode>,
    pool: CollectorPool,
    handle: RuntimeHandle,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Store::new();
    let node = Arc::new(ScriptedNode::default());
    let pool = CollectorPool::new(Arc::new(ScriptedFactory { node: node.clone() }));
    let mut runtime = Runtime::new(store.clone());
    runtime
        .register(MachineStatusController::new(pool.clone()))
        .expect("register controller");
    Harness {
        store,
        node,
        pool,
        handle: runtime.start(),
    }
}

impl Harness {
    fn create_machine(&self, id: &str, connected: bool) {
        self.store
            .create(
                Resource::new(
                    DEFAULT_NAMESPACE,
                    id,
                    Spec::Machine(MachineSpec {
                        connected,
                        management_address: format!("{id}.fleet.internal:50000"),
                    }),
                ),
                &Actor::anonymous(),
            )
            .expect("create machine");
    }

    fn set_connected(&self, id: &str, connected: bool) {
        self.store
            .update(
                &ResourceId::new(ResourceType::Machine, DEFAULT_NAMESPACE, id),
                Version::UNDEFINED,
                &Actor::anonymous(),
                |machine| {
                    if let Spec::Machine(spec) = &mut machine.spec {
                        spec.connected = connected;
                    }
                },
            )
            .expect("update machine");
    }

    fn set_user_labels(&self, id: &str, pairs: &[(&str, &str)]) {
        let id = ResourceId::new(ResourceType::MachineLabels, DEFAULT_NAMESPACE, id);
        let labels: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        if self.store.get(&id).is_ok() {
            self.store
                .update(&id, Version::UNDEFINED, &Actor::anonymous(), |r| {
                    r.metadata.labels = labels.clone();
                })
                .expect("update machine labels");
        } else {
            let mut resource = Resource::new(
                DEFAULT_NAMESPACE,
                id.id.clone(),
                Spec::MachineLabels(MachineLabelsSpec),
            );
            resource.metadata.labels = labels;
            self.store
                .create(resource, &Actor::anonymous())
                .expect("create machine labels");
        }
    }

    fn status(&self, id: &str) -> Option<Resource> {
        self.store
            .get(&ResourceId::new(
                ResourceType::MachineStatus,
                DEFAULT_NAMESPACE,
                id,
            ))
            .ok()
    }

    async fn expect_status<F: Fn(&Resource) -> bool>(&self, id: &str, what: &str, check: F) {
        for _ in 0..500 {
            if self.status(id).as_ref().is_some_and(&check) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {what}; last status: {:#?}",
            self.status(id)
        );
    }

    async fn shutdown(self) {
        self.handle.shutdown().await;
        self.pool.shutdown().await;
    }
}

fn labels_meta(json: &str) -> NodeResource {
    NodeResource::MetaKey(MetaKeySpec {
        tag: LABELS_META_TAG,
        value: json.to_string(),
    })
}

#[tokio::test]
async fn connected_flag_toggles() {
    let h = harness();
    h.create_machine("m1", true);

    h.expect_status("m1", "connected status with label", |status| {
        status.spec.as_machine_status().is_some_and(|s| s.connected)
            && status.metadata.labels.contains_key(labels::CONNECTED)
    })
    .await;

    h.set_connected("m1", false);
    h.expect_status("m1", "disconnected status without label", |status| {
        status.spec.as_machine_status().is_some_and(|s| !s.connected)
            && !status.metadata.labels.contains_key(labels::CONNECTED)
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn reporting_events_follows_the_snapshot() {
    let h = harness();
    h.create_machine("m1", true);
    h.store
        .create(
            Resource::new(
                DEFAULT_NAMESPACE,
                "m1",
                Spec::MachineStatusSnapshot(MachineStatusSnapshotSpec {
                    last_event: "RUNNING".into(),
                }),
            ),
            &Actor::anonymous(),
        )
        .unwrap();

    h.expect_status("m1", "reporting-events label", |status| {
        status.metadata.labels.contains_key(labels::REPORTING_EVENTS)
    })
    .await;

    h.store
        .destroy(
            &ResourceId::new(ResourceType::MachineStatusSnapshot, DEFAULT_NAMESPACE, "m1"),
            &Actor::anonymous(),
        )
        .unwrap();
    h.expect_status("m1", "reporting-events label gone", |status| {
        !status.metadata.labels.contains_key(labels::REPORTING_EVENTS)
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn user_labels_overlay_image_labels() {
    let h = harness();
    h.node
        .seed("0x0c", labels_meta(r#"{"machineLabels":{"label1":"value1"}}"#));
    h.create_machine("m1", true);

    h.expect_status("m1", "image label applied", |status| {
        status.metadata.labels.get("label1").map(String::as_str) == Some("value1")
    })
    .await;

    // empty user label values are meaningful and preserved
    h.set_user_labels("m1", &[("test", "")]);
    h.expect_status("m1", "user label added alongside image label", |status| {
        status.metadata.labels.get("label1").map(String::as_str) == Some("value1")
            && status.metadata.labels.get("test").map(String::as_str) == Some("")
    })
    .await;

    // user override wins over the image label
    h.set_user_labels("m1", &[("label1", "gasp")]);
    h.expect_status("m1", "user override wins", |status| {
        status.metadata.labels.get("label1").map(String::as_str) == Some("gasp")
    })
    .await;

    // dropping the overrides reverts to the image value
    h.store
        .destroy(
            &ResourceId::new(ResourceType::MachineLabels, DEFAULT_NAMESPACE, "m1"),
            &Actor::anonymous(),
        )
        .unwrap();
    h.expect_status("m1", "image label restored", |status| {
        status.metadata.labels.get("label1").map(String::as_str) == Some("value1")
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn overlay_precedence_survives_image_label_updates() {
    let h = harness();
    h.node
        .seed("0x0c", labels_meta(r#"{"machineLabels":{"label1":"value1"}}"#));
    h.create_machine("m1", true);
    h.set_user_labels("m1", &[("label2", "aaa")]);

    h.expect_status("m1", "initial labels", |status| {
        status.metadata.labels.get("label1").map(String::as_str) == Some("value1")
    })
    .await;

    h.node.apply(
        "0x0c",
        labels_meta(r#"{"machineLabels":{"label1":"updated","label2":"override"}}"#),
    );

    h.expect_status("m1", "updated image labels with user precedence", |status| {
        status.metadata.labels.get("label1").map(String::as_str) == Some("updated")
            && status.metadata.labels.get("label2").map(String::as_str) == Some("aaa")
    })
    .await;

    // the spec's image labels are masked by the user override
    h.expect_status("m1", "masked image labels", |status| {
        status
            .spec
            .as_machine_status()
            .and_then(|s| s.image_labels.as_ref())
            .is_some_and(|image| {
                image.get("label1").map(String::as_str) == Some("updated")
                    && !image.contains_key("label2")
            })
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn schematic_id_comes_from_the_marker_extension() {
    let h = harness();
    h.node.seed(
        "schematic",
        NodeResource::ExtensionStatus(ExtensionStatusSpec {
            name: "schematic".into(),
            version: "1234".into(),
            description: SCHEMATIC_EXTENSION_DESCRIPTION.into(),
        }),
    );
    h.create_machine("m1", true);

    h.expect_status("m1", "schematic id", |status| {
        status
            .spec
            .as_machine_status()
            .and_then(|s| s.schematic.as_ref())
            .is_some_and(|schematic| schematic.id == "1234" && !schematic.invalid)
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn unknown_extensions_invalidate_the_schematic() {
    let h = harness();
    h.node.seed(
        "unknown",
        NodeResource::ExtensionStatus(ExtensionStatusSpec {
            name: "unknown".into(),
            version: String::new(),
            description: "unknown".into(),
        }),
    );
    h.create_machine("m1", true);

    h.expect_status("m1", "invalid schematic", |status| {
        status
            .spec
            .as_machine_status()
            .and_then(|s| s.schematic.as_ref())
            .is_some_and(|schematic| schematic.invalid)
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn no_extensions_resolve_the_default_schematic() {
    let h = harness();
    h.create_machine("m1", true);

    h.expect_status("m1", "default schematic", |status| {
        status
            .spec
            .as_machine_status()
            .and_then(|s| s.schematic.as_ref())
            .is_some_and(|schematic| schematic.id == DEFAULT_SCHEMATIC_ID && !schematic.invalid)
    })
    .await;

    h.shutdown().await;
}

#[tokio::test]
async fn machine_destroy_takes_the_status_with_it() {
    let h = harness();
    h.create_machine("m1", true);
    h.expect_status("m1", "status created", |_| true).await;

    // deferred by the controller finalizer, completed by its teardown
    let machine = ResourceId::new(ResourceType::Machine, DEFAULT_NAMESPACE, "m1");
    let _ = h.store.destroy(&machine, &Actor::anonymous());
    for _ in 0..500 {
        if h.store.get(&machine).is_err() && h.status("m1").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.store.get(&machine).is_err(), "machine should be gone");
    assert!(h.status("m1").is_none(), "status should be gone");

    h.shutdown().await;
}

#[tokio::test]
async fn collected_state_arrives_in_the_status() {
    let h = harness();
    h.create_machine("m1", true);

    h.expect_status("m1", "version and disks collected", |status| {
        status.spec.as_machine_status().is_some_and(|s| {
            s.talos_version.as_deref() == Some("v1.8.3")
                && s.arch.as_deref() == Some("amd64")
                && s.hardware
                    .as_ref()
                    .is_some_and(|hw| hw.blockdevices.iter().any(|d| d.system_disk))
        })
    })
    .await;

    h.shutdown().await;
}
