//! Long-lived per-machine collector tasks
//!
//! One task per connected machine. A task dials the node's management
//! address (retrying with backoff), subscribes to the node's resource
//! namespaces, runs the interval RPC pollers, and folds everything into a
//! shared [`Info`] snapshot. Every completed poll signals the machine id on
//! the pool's trigger channel, which the MachineStatus controller consumes
//! as an input.
//!
//! A single poller failing never kills the task; a lost connection does, and
//! the reconnect loop takes over. Cancellation is prompt: in-flight RPCs are
//! abandoned between `await` points and never write partial `Info` slices.

mod info;
mod pollers;

pub use info::{Info, SharedInfo};

use crate::node::{ClientError, NodeClient, NodeClientFactory, NodeEvent, NodeNamespace};
use ahash::AHashMap;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use fleet_core::machine::BlockDevice;
use futures::{
    stream::{self, BoxStream, SelectAll},
    StreamExt,
};
use parking_lot::Mutex;
use pollers::Poller;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Collector tuning knobs.
#[derive(Clone, Debug)]
pub struct CollectorOptions {
    /// Interval of the RPC pollers (`version`, `disks`); also their
    /// per-call deadline. They additionally run once at task start.
    pub poll_interval: Duration,
    /// First reconnect delay after a failed dial.
    pub connect_initial: Duration,
    /// Reconnect delay cap.
    pub connect_max: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        CollectorOptions {
            poll_interval: Duration::from_secs(30),
            connect_initial: Duration::from_secs(1),
            connect_max: Duration::from_secs(30),
        }
    }
}

struct TaskHandle {
    address: String,
    cancel: CancellationToken,
    info: SharedInfo,
    task: JoinHandle<()>,
}

struct PoolInner {
    factory: Arc<dyn NodeClientFactory>,
    options: CollectorOptions,
    tasks: Mutex<AHashMap<String, TaskHandle>>,
    trigger_tx: UnboundedSender<String>,
    trigger_rx: Mutex<Option<UnboundedReceiver<String>>>,
    cancel: CancellationToken,
}

/// Owns the collector tasks, keyed by machine id. Cloning shares the pool.
#[derive(Clone)]
pub struct CollectorPool {
    inner: Arc<PoolInner>,
}

impl CollectorPool {
    #[must_use]
    pub fn new(factory: Arc<dyn NodeClientFactory>) -> Self {
        CollectorPool::with_options(factory, CollectorOptions::default())
    }

    #[must_use]
    pub fn with_options(factory: Arc<dyn NodeClientFactory>, options: CollectorOptions) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        CollectorPool {
            inner: Arc::new(PoolInner {
                factory,
                options,
                tasks: Mutex::new(AHashMap::new()),
                trigger_tx,
                trigger_rx: Mutex::new(Some(trigger_rx)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Make sure a collector task runs for `machine_id` against `address`,
    /// restarting the task if the management address moved.
    pub fn ensure(&self, machine_id: &str, address: &str) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(existing) = tasks.get(machine_id) {
            if existing.address == address && !existing.task.is_finished() {
                return;
            }
            existing.cancel.cancel();
        }
        debug!(machine = machine_id, address, "starting collector");
        let cancel = self.inner.cancel.child_token();
        let info = SharedInfo::default();
        let task = tokio::spawn(run_task(
            machine_id.to_string(),
            address.to_string(),
            self.inner.factory.clone(),
            self.inner.options.clone(),
            info.clone(),
            self.inner.trigger_tx.clone(),
            cancel.clone(),
        ));
        tasks.insert(
            machine_id.to_string(),
            TaskHandle {
                address: address.to_string(),
                cancel,
                info,
                task,
            },
        );
    }

    /// Cancel and forget the collector task for `machine_id`, if any. The
    /// task notices promptly and releases its client connection on exit.
    pub fn stop(&self, machine_id: &str) {
        if let Some(handle) = self.inner.tasks.lock().remove(machine_id) {
            debug!(machine = machine_id, "stopping collector");
            handle.cancel.cancel();
        }
    }

    /// Snapshot of the collected state for `machine_id`, if a task exists.
    #[must_use]
    pub fn info(&self, machine_id: &str) -> Option<Info> {
        self.inner
            .tasks
            .lock()
            .get(machine_id)
            .map(|handle| handle.info.snapshot())
    }

    /// The stream of machine ids whose `Info` changed. Can be taken once;
    /// the MachineStatus controller merges it with its store inputs.
    #[must_use]
    pub fn trigger_stream(&self) -> Option<BoxStream<'static, String>> {
        let rx = self.inner.trigger_rx.lock().take()?;
        Some(
            stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|id| (id, rx))
            })
            .boxed(),
        )
    }

    /// Cancel every collector task and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<TaskHandle> = self.inner.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.task.await;
        }
    }
}

enum Stop {
    Cancelled,
    ConnectionLost,
}

async fn run_task(
    machine_id: String,
    address: String,
    factory: Arc<dyn NodeClientFactory>,
    options: CollectorOptions,
    info: SharedInfo,
    trigger: UnboundedSender<String>,
    cancel: CancellationToken,
) {
    loop {
        let Some(client) = connect_with_backoff(&*factory, &address, &options, &cancel).await
        else {
            break;
        };
        info.update(|i| i.maintenance_mode = client.maintenance_mode());
        let _ = trigger.send(machine_id.clone());

        match poll_node(&machine_id, &*client, &options, &info, &trigger, &cancel).await {
            Stop::Cancelled => break,
            Stop::ConnectionLost => {
                warn!(machine = %machine_id, "node connection lost, reconnecting");
            }
        }
    }
    debug!(machine = %machine_id, "collector stopped");
}

async fn connect_with_backoff(
    factory: &dyn NodeClientFactory,
    address: &str,
    options: &CollectorOptions,
    cancel: &CancellationToken,
) -> Option<Arc<dyn NodeClient>> {
    let mut backoff = connect_backoff(options);
    loop {
        let attempt = tokio::select! {
            () = cancel.cancelled() => return None,
            attempt = factory.connect(address) => attempt,
        };
        match attempt {
            Ok(client) => return Some(client),
            Err(err) => {
                let delay = backoff.next_backoff().unwrap_or(options.connect_max);
                debug!(address, error = %err, delay_ms = delay.as_millis() as u64, "dial failed");
                tokio::select! {
                    () = cancel.cancelled() => return None,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn connect_backoff(options: &CollectorOptions) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(options.connect_initial)
        .with_max_interval(options.connect_max)
        .with_max_elapsed_time(None)
        .build()
}

async fn poll_node(
    machine_id: &str,
    client: &dyn NodeClient,
    options: &CollectorOptions,
    info: &SharedInfo,
    trigger: &UnboundedSender<String>,
    cancel: &CancellationToken,
) -> Stop {
    let mut watches: SelectAll<BoxStream<'static, (NodeNamespace, Result<NodeEvent, ClientError>)>> =
        SelectAll::new();
    for namespace in NodeNamespace::ALL {
        let watch = tokio::select! {
            () = cancel.cancelled() => return Stop::Cancelled,
            watch = client.watch(namespace) => watch,
        };
        match watch {
            Ok(stream) => watches.push(stream.map(move |event| (namespace, event)).boxed()),
            Err(err) => {
                warn!(machine = %machine_id, %namespace, error = %err, "watch failed");
                return Stop::ConnectionLost;
            }
        }
    }

    let mut caches: AHashMap<Poller, BTreeMap<String, crate::node::NodeResource>> =
        AHashMap::new();
    let mut interval = tokio::time::interval(options.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Stop::Cancelled,
            // first tick fires immediately, covering the run-at-start rule
            _ = interval.tick() => {
                tokio::select! {
                    () = cancel.cancelled() => return Stop::Cancelled,
                    () = run_rpc_pollers(machine_id, client, options.poll_interval, info) => {
                        let _ = trigger.send(machine_id.to_string());
                    }
                }
            }
            event = watches.next() => match event {
                Some((_, Ok(NodeEvent::Applied { id, resource }))) => {
                    let poller = Poller::of(&resource);
                    trace!(machine = %machine_id, poller = poller.key(), %id, "applied");
                    let cache = caches.entry(poller).or_default();
                    cache.insert(id, resource);
                    info.update(|i| poller.apply(cache, i));
                    let _ = trigger.send(machine_id.to_string());
                }
                Some((_, Ok(NodeEvent::Destroyed { id, resource }))) => {
                    let poller = Poller::of(&resource);
                    trace!(machine = %machine_id, poller = poller.key(), %id, "destroyed");
                    let cache = caches.entry(poller).or_default();
                    cache.remove(&id);
                    info.update(|i| poller.apply(cache, i));
                    let _ = trigger.send(machine_id.to_string());
                }
                Some((namespace, Ok(NodeEvent::Bootstrapped))) => {
                    // replay done for one namespace: settle its pollers so
                    // absent remote resources resolve too (e.g. a machine
                    // without extensions still gets its default schematic)
                    info.update(|i| {
                        for poller in Poller::ALL {
                            if poller.namespace() == namespace {
                                poller.apply(caches.entry(poller).or_default(), i);
                            }
                        }
                    });
                    let _ = trigger.send(machine_id.to_string());
                }
                Some((_, Err(err))) => {
                    warn!(machine = %machine_id, error = %err, "watch stream failed");
                    return Stop::ConnectionLost;
                }
                None => return Stop::ConnectionLost,
            }
        }
    }
}

/// The unary RPC pollers: `version` and `disks`. Each failure is isolated
/// and retried on the next tick; `Unimplemented` advances nothing.
async fn run_rpc_pollers(
    machine_id: &str,
    client: &dyn NodeClient,
    deadline: Duration,
    info: &SharedInfo,
) {
    match tokio::time::timeout(deadline, client.version()).await {
        Ok(Ok(version)) => info.update(|i| {
            i.talos_version = Some(version.version);
            i.arch = Some(version.arch);
        }),
        Ok(Err(ClientError::Unimplemented(_))) => {}
        Ok(Err(err)) => warn!(machine = %machine_id, error = %err, "version poll failed"),
        Err(_) => warn!(machine = %machine_id, "version poll timed out"),
    }

    match tokio::time::timeout(deadline, client.disks()).await {
        Ok(Ok(disks)) => info.update(|i| {
            i.blockdevices = Some(
                disks
                    .into_iter()
                    .map(|disk| BlockDevice {
                        linux_name: disk.linux_name,
                        size: disk.size,
                        model: disk.model,
                        serial: disk.serial,
                        wwid: disk.wwid,
                        bus_path: disk.bus_path,
                        device_type: disk.device_type,
                        readonly: disk.readonly,
                        system_disk: disk.system_disk,
                    })
                    .collect(),
            );
        }),
        Ok(Err(ClientError::Unimplemented(_))) => {}
        Ok(Err(err)) => warn!(machine = %machine_id, error = %err, "disks poll failed"),
        Err(_) => warn!(machine = %machine_id, "disks poll timed out"),
    }
}
