//! Machine lifecycle and status reconciliation core for a fleet control
//! plane
//!
//! This facade re-exports the workspace crates:
//!
//! - [`core`]: the versioned resource model (metadata, labels, selectors,
//!   machine spec payloads, error taxonomy)
//! - [`runtime`]: the in-memory resource store with watch semantics and the
//!   controller runtime driving reconcilers against it
//! - [`machine`]: per-machine collector tasks and the MachineStatus
//!   reconciler
//!
//! # Example
//!
//! Wire the store, runtime and collectors together and let a machine flow
//! through:
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleet::core::{machine::MachineSpec, Actor, Resource, Spec, DEFAULT_NAMESPACE};
//! use fleet::machine::{CollectorPool, MachineStatusController};
//! use fleet::runtime::{Runtime, Store};
//! # use fleet::machine::node::{ClientError, NodeClient, NodeClientFactory};
//! # struct Dialer;
//! # #[async_trait::async_trait]
//! # impl NodeClientFactory for Dialer {
//! #     async fn connect(&self, _: &str) -> Result<Arc<dyn NodeClient>, ClientError> {
//! #         Err(ClientError::Unavailable("example".into()))
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fleet::core::Error> {
//!     let store = Store::new();
//!     let pool = CollectorPool::new(Arc::new(Dialer));
//!
//!     let mut runtime = Runtime::new(store.clone());
//!     runtime.register(MachineStatusController::new(pool))?;
//!     let handle = runtime.start();
//!
//!     // machines are created by the admission pipeline; the controller
//!     // derives a MachineStatus for each
//!     store.create(
//!         Resource::new(
//!             DEFAULT_NAMESPACE,
//!             "machine-1",
//!             Spec::Machine(MachineSpec {
//!                 connected: true,
//!                 management_address: "10.0.0.5:50000".into(),
//!             }),
//!         ),
//!         &Actor::anonymous(),
//!     )?;
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub use fleet_core as core;
pub use fleet_machine as machine;
pub use fleet_runtime as runtime;

pub use fleet_core::{Error, Resource, ResourceId, ResourceType};
pub use fleet_machine::{CollectorPool, MachineStatusController};
pub use fleet_runtime::{Runtime, Store};
