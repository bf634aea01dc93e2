//! Controller runtime: registration, input watches and the reconcile loop
//!
//! A controller declares its inputs (watched resource types with a key
//! mapping), its outputs (resource types it exclusively owns) and a
//! `reconcile` function deriving the intended outputs for one key. The
//! runtime subscribes to every input, funnels changed keys through a
//! deduplicating [`scheduler`](crate::scheduler), runs passes with bounded
//! concurrency and applies the intent to the store, diffing against what is
//! already there so an unchanged intent produces zero writes.
//!
//! Failed passes are requeued with exponential backoff; invalid-input
//! failures are shelved until the next input event. Strong inputs get a
//! finalizer named after the controller pinned to them, which is lifted once
//! a tearing-down input's key reconciles to zero remaining outputs — that is
//! what lets a deferred destroy complete.

mod runner;

use crate::{
    scheduler::{scheduler, ReconcileKey, ScheduleRequest},
    store::{Event, Store},
};
use ahash::AHashMap;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use fleet_core::{Actor, Error, Owner, Phase, Resource, ResourceId, ResourceType, Result};
use futures::{
    channel::mpsc,
    future::BoxFuture,
    stream::{self, BoxStream},
    SinkExt, StreamExt,
};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// How strongly a controller depends on an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    /// The runtime pins a finalizer on live strong-input resources so their
    /// destroy defers until the controller has torn down its outputs for the
    /// key. Strong inputs must use the identity key mapping.
    Strong,
    /// Events trigger reconciliation but the input's lifecycle is not
    /// coordinated with this controller.
    Weak,
}

/// Derives the affected reconcile key from an input resource. Returning
/// `None` skips the event.
pub type KeyMapper = fn(&Resource) -> Option<String>;

fn id_mapper(resource: &Resource) -> Option<String> {
    Some(resource.metadata.id.clone())
}

/// A declared controller input: a watched `(type, namespace)` plus the key
/// mapping applied to its events.
#[derive(Clone)]
pub struct Input {
    pub resource_type: ResourceType,
    pub namespace: String,
    pub kind: InputKind,
    pub mapper: KeyMapper,
}

impl Input {
    pub fn strong(resource_type: ResourceType, namespace: impl Into<String>) -> Self {
        Input {
            resource_type,
            namespace: namespace.into(),
            kind: InputKind::Strong,
            mapper: id_mapper,
        }
    }

    pub fn weak(resource_type: ResourceType, namespace: impl Into<String>) -> Self {
        Input {
            resource_type,
            namespace: namespace.into(),
            kind: InputKind::Weak,
            mapper: id_mapper,
        }
    }

    /// Replace the identity key mapping. Only meaningful for weak inputs.
    #[must_use]
    pub fn with_mapper(mut self, mapper: KeyMapper) -> Self {
        self.mapper = mapper;
        self
    }
}

/// A declared controller output. Each `(type, namespace)` has exactly one
/// owning controller; the runtime rejects double registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub resource_type: ResourceType,
    pub namespace: String,
}

impl Output {
    pub fn new(resource_type: ResourceType, namespace: impl Into<String>) -> Self {
        Output {
            resource_type,
            namespace: namespace.into(),
        }
    }
}

/// Read-only view handed to reconcile passes.
///
/// All writes go through the runtime's intent application, which is how the
/// single-writer-per-output rule is kept by construction.
#[derive(Clone)]
pub struct ReconcileContext {
    store: Store,
}

impl ReconcileContext {
    /// Build a context over a store directly; handy for exercising a
    /// reconciler without a running [`Runtime`].
    #[must_use]
    pub fn new(store: Store) -> Self {
        ReconcileContext { store }
    }

    /// Fetch a resource, mapping `NotFound` to `None`.
    pub fn get(
        &self,
        resource_type: ResourceType,
        namespace: &str,
        id: &str,
    ) -> Result<Option<Resource>> {
        match self
            .store
            .get(&ResourceId::new(resource_type, namespace, id))
        {
            Ok(resource) => Ok(Some(resource)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// List resources of a type in a namespace.
    pub fn list(
        &self,
        resource_type: ResourceType,
        namespace: &str,
        selector: &fleet_core::Selector,
    ) -> Vec<Resource> {
        self.store.list(resource_type, namespace, selector)
    }
}

/// A reconciler registered with the [`Runtime`].
///
/// `reconcile` must be a pure derivation of the intended outputs for `key`
/// from the current store state: same inputs, same intent. The runtime
/// relies on that to suppress writes when nothing changed. Intended outputs
/// must use declared `(type, namespace)` pairs and carry `key` as their id.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Unique name; doubles as the owner string of every output.
    fn name(&self) -> &'static str;

    fn inputs(&self) -> Vec<Input>;

    fn outputs(&self) -> Vec<Output>;

    /// Extra key streams merged with the store inputs, for signals that do
    /// not live in the store (e.g. collector state changes). Called once at
    /// startup.
    fn triggers(&self) -> Vec<BoxStream<'static, String>> {
        Vec::new()
    }

    async fn reconcile(&self, ctx: &ReconcileContext, key: &str) -> Result<Vec<Resource>>;
}

/// Runtime tuning knobs, shared by all controllers.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Concurrent reconcile passes per controller.
    pub degree: usize,
    /// Quiet period required before a key is emitted, absorbing event bursts.
    pub debounce: Duration,
    /// Per-pass deadline; passes over it fail with `Cancelled` and requeue.
    pub reconcile_timeout: Duration,
    /// First requeue delay after a failed pass.
    pub requeue_initial: Duration,
    /// Requeue delay cap.
    pub requeue_max: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            degree: 1,
            debounce: Duration::ZERO,
            reconcile_timeout: Duration::from_secs(30),
            requeue_initial: Duration::from_secs(1),
            requeue_max: Duration::from_secs(60),
        }
    }
}

struct Registration {
    controller: Arc<dyn Reconciler>,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    owner: Owner,
}

/// Owns the store handle and the set of registered controllers; [`start`]
/// spawns one driver task per controller.
///
/// [`start`]: Runtime::start
pub struct Runtime {
    store: Store,
    options: RuntimeOptions,
    registrations: Vec<Registration>,
    owned_outputs: AHashMap<(ResourceType, String), &'static str>,
}

impl Runtime {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Runtime::with_options(store, RuntimeOptions::default())
    }

    #[must_use]
    pub fn with_options(store: Store, options: RuntimeOptions) -> Self {
        Runtime {
            store,
            options,
            registrations: Vec::new(),
            owned_outputs: AHashMap::new(),
        }
    }

    /// Register a controller, enforcing unique ownership of every declared
    /// output `(type, namespace)`.
    pub fn register<C: Reconciler>(&mut self, controller: C) -> Result<()> {
        let name = controller.name();
        let outputs = controller.outputs();
        for output in &outputs {
            let slot = (output.resource_type, output.namespace.clone());
            if let Some(existing) = self.owned_outputs.get(&slot) {
                return Err(Error::InvalidArgument(format!(
                    "output {}.{} of controller {name} is already owned by {existing}",
                    output.resource_type, output.namespace,
                )));
            }
            self.owned_outputs.insert(slot, name);
        }
        self.registrations.push(Registration {
            inputs: controller.inputs(),
            outputs,
            owner: Owner::new(name),
            controller: Arc::new(controller),
        });
        Ok(())
    }

    /// Spawn one driver task per registered controller and hand back the
    /// shutdown handle.
    #[must_use]
    pub fn start(self) -> RuntimeHandle {
        let cancel = CancellationToken::new();
        let tasks = self
            .registrations
            .into_iter()
            .map(|registration| {
                tokio::spawn(run_controller(
                    self.store.clone(),
                    registration,
                    self.options.clone(),
                    cancel.child_token(),
                ))
            })
            .collect();
        RuntimeHandle { cancel, tasks }
    }
}

/// Handle to a started [`Runtime`]; dropping it does not stop the
/// controllers, [`shutdown`](RuntimeHandle::shutdown) does, gracefully.
pub struct RuntimeHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    /// Stop accepting new reconcile keys, let in-flight passes finish, and
    /// wait for every controller task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

struct PassContext {
    controller: Arc<dyn Reconciler>,
    ctx: ReconcileContext,
    store: Store,
    actor: Actor,
    outputs: Vec<Output>,
    strong_inputs: Vec<Input>,
    timeout: Duration,
    name: &'static str,
}

struct PassOutcome {
    key: ReconcileKey,
    result: Result<()>,
}

async fn run_controller(
    store: Store,
    registration: Registration,
    options: RuntimeOptions,
    cancel: CancellationToken,
) {
    let name = registration.controller.name();
    let mut triggers = stream::SelectAll::new();
    for input in registration.inputs.clone() {
        triggers.push(input_trigger(store.clone(), input, name).boxed());
    }
    for external in registration.controller.triggers() {
        triggers.push(external);
    }

    let (requeue_tx, requeue_rx) = mpsc::channel::<ScheduleRequest>(100);
    let requests = stream::select(
        triggers.map(|key| ScheduleRequest {
            key,
            run_at: Instant::now(),
        }),
        requeue_rx,
    )
    .take_until(cancel.cancelled_owned());

    let pass_ctx = Arc::new(PassContext {
        controller: registration.controller,
        ctx: ReconcileContext {
            store: store.clone(),
        },
        store,
        actor: Actor::controller(registration.owner.clone()),
        strong_inputs: registration
            .inputs
            .iter()
            .filter(|input| input.kind == InputKind::Strong)
            .cloned()
            .collect(),
        outputs: registration.outputs,
        timeout: options.reconcile_timeout,
        name,
    });

    let runner = runner::Runner::new(
        scheduler(requests, options.debounce),
        options.degree,
        move |key: &ReconcileKey| -> BoxFuture<'static, PassOutcome> {
            Box::pin(run_pass(pass_ctx.clone(), key.clone()))
        },
    );
    futures::pin_mut!(runner);

    let mut backoffs: AHashMap<ReconcileKey, ExponentialBackoff> = AHashMap::new();
    while let Some(outcome) = runner.next().await {
        match outcome.result {
            Ok(()) => {
                backoffs.remove(&outcome.key);
            }
            Err(err) if err.is_retryable() => {
                let delay = backoffs
                    .entry(outcome.key.clone())
                    .or_insert_with(|| requeue_backoff(&options))
                    .next_backoff()
                    .unwrap_or(options.requeue_max);
                warn!(
                    controller = name,
                    key = %outcome.key,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "reconcile failed, requeueing"
                );
                // send failure means shutdown is in progress; drop the requeue
                let _ = requeue_tx
                    .clone()
                    .send(ScheduleRequest {
                        key: outcome.key,
                        run_at: Instant::now() + delay,
                    })
                    .await;
            }
            Err(err) => {
                warn!(
                    controller = name,
                    key = %outcome.key,
                    error = %err,
                    "reconcile failed, shelved until the next input event"
                );
                backoffs.remove(&outcome.key);
            }
        }
    }
    debug!(controller = name, "controller terminated");
}

fn requeue_backoff(options: &RuntimeOptions) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(options.requeue_initial)
        .with_max_interval(options.requeue_max)
        .with_randomization_factor(0.2)
        .with_max_elapsed_time(None)
        .build()
}

/// Yields the affected reconcile key for every event on one input,
/// re-subscribing (with its snapshot replay) whenever the watch lags.
fn input_trigger(
    store: Store,
    input: Input,
    controller: &'static str,
) -> impl futures::Stream<Item = String> {
    async_stream::stream! {
        loop {
            let mut watch = store.watch(input.resource_type, &input.namespace);
            let mut lagged = false;
            while let Some(item) = watch.next().await {
                match item {
                    Ok(Event::Bootstrapped) => {}
                    Ok(event) => {
                        if input.kind == InputKind::Strong {
                            pin_finalizer(&store, &event, controller);
                        }
                        if let Some(resource) = event.latest() {
                            if let Some(key) = (input.mapper)(resource) {
                                yield key;
                            }
                        }
                    }
                    Err(_) => {
                        lagged = true;
                        break;
                    }
                }
            }
            if !lagged {
                // the store itself went away
                break;
            }
            debug!(
                controller,
                input = %input.resource_type,
                "watch lagged, re-subscribing"
            );
        }
    }
}

/// Pin the controller's finalizer onto a live strong-input resource so its
/// destroy defers until the outputs for the key are gone.
fn pin_finalizer(store: &Store, event: &Event, controller: &'static str) {
    let resource = match event {
        Event::Created(new) | Event::Updated { new, .. } => new,
        _ => return,
    };
    if resource.metadata.phase != Phase::Running || resource.metadata.has_finalizer(controller) {
        return;
    }
    let id = resource.id();
    match store.add_finalizer(&id, &Actor::internal(), controller) {
        Ok(()) | Err(Error::NotFound(_)) => {}
        Err(err) => warn!(controller, %id, error = %err, "failed to pin finalizer"),
    }
}

async fn run_pass(pass: Arc<PassContext>, key: ReconcileKey) -> PassOutcome {
    let span = info_span!("reconcile", controller = pass.name, %key);
    let result = async {
        let intent = match tokio::time::timeout(
            pass.timeout,
            pass.controller.reconcile(&pass.ctx, &key),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::Cancelled),
        };
        apply_intent(&pass, &key, intent)?;
        release_strong_inputs(&pass, &key)
    }
    .instrument(span)
    .await;
    PassOutcome { key, result }
}

/// Diff the intended outputs against the store and write only differences,
/// as the controller's owner.
fn apply_intent(pass: &PassContext, key: &str, intent: Vec<Resource>) -> Result<()> {
    for resource in &intent {
        let declared = pass.outputs.iter().any(|o| {
            o.resource_type == resource.resource_type() && o.namespace == resource.metadata.namespace
        });
        if !declared {
            return Err(Error::InvalidArgument(format!(
                "controller {} produced undeclared output {}",
                pass.name,
                resource.id(),
            )));
        }
        if resource.metadata.id != key {
            return Err(Error::InvalidArgument(format!(
                "output {} does not match reconcile key {key}",
                resource.id(),
            )));
        }
    }

    for output in &pass.outputs {
        let id = ResourceId::new(output.resource_type, output.namespace.clone(), key);
        let intended = intent.iter().find(|r| {
            r.resource_type() == output.resource_type && r.metadata.namespace == output.namespace
        });
        let stored = match pass.store.get(&id) {
            Ok(resource) => Some(resource),
            Err(Error::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        match (stored, intended) {
            (None, Some(want)) => {
                pass.store.create(want.clone(), &pass.actor)?;
                debug!(controller = pass.name, %id, "created output");
            }
            (Some(have), Some(want)) => {
                let unchanged = have.spec == want.spec
                    && have.metadata.labels == want.metadata.labels
                    && have.metadata.annotations == want.metadata.annotations;
                if unchanged {
                    continue;
                }
                pass.store
                    .update(&id, have.metadata.version, &pass.actor, |r| {
                        r.spec = want.spec.clone();
                        r.metadata.labels = want.metadata.labels.clone();
                        r.metadata.annotations = want.metadata.annotations.clone();
                    })?;
                debug!(controller = pass.name, %id, "updated output");
            }
            (Some(_), None) => {
                match pass.store.destroy(&id, &pass.actor) {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                debug!(controller = pass.name, %id, "destroyed output");
            }
            (None, None) => {}
        }
    }
    Ok(())
}

/// Lift the controller's finalizer from tearing-down strong inputs once no
/// outputs remain for the key, letting the deferred destroy complete.
fn release_strong_inputs(pass: &PassContext, key: &str) -> Result<()> {
    for input in &pass.strong_inputs {
        let input_id = ResourceId::new(input.resource_type, input.namespace.clone(), key);
        let resource = match pass.store.get(&input_id) {
            Ok(resource) => resource,
            Err(Error::NotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        if resource.metadata.phase != Phase::TearingDown
            || !resource.metadata.has_finalizer(pass.name)
        {
            continue;
        }
        let outputs_remain = pass.outputs.iter().any(|o| {
            pass.store
                .get(&ResourceId::new(o.resource_type, o.namespace.clone(), key))
                .is_ok()
        });
        if outputs_remain {
            continue;
        }
        pass.store
            .remove_finalizer(&input_id, &Actor::internal(), pass.name)?;
        debug!(controller = pass.name, id = %input_id, "released strong input");
    }
    Ok(())
}
