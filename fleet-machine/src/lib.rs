//! Per-machine collectors and the MachineStatus reconciler
//!
//! This crate connects the controller runtime to real machines:
//!
//! - [`node`] abstracts the remote node's management API (resource watches
//!   plus the `version` and `disks` RPCs) behind traits so transports and
//!   tests plug in.
//! - [`collector`] runs one long-lived task per connected machine,
//!   multiplexing pollers into a shared `Info` snapshot and signalling the
//!   controller whenever it changes.
//! - [`schematic`] resolves the image schematic identity from extension
//!   statuses.
//! - [`status`] is the MachineStatus reconciler tying it all together.

pub mod collector;
pub mod node;
pub mod schematic;
pub mod status;

pub use collector::{CollectorOptions, CollectorPool, Info};
pub use status::MachineStatusController;
