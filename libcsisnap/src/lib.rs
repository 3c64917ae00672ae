//! # libcsisnap: CSI snapshot lifecycle coordination for volume backups
//!
//! `libcsisnap` implements the item actions a backup orchestrator calls while
//! it walks the objects of a backup, a restore or a backup deletion. The
//! actions take CSI volume snapshots of persistent volume claims, wait for
//! the snapshot controller to bind them, hand bulk data movement over to a
//! data mover, and later recreate claims from those snapshots.
//!
//! All cluster access goes through the [`client::ObjectApi`] facade, so the
//! same actions run against a live API server ([`client::cluster`]) or an
//! in-memory store ([`client::memory`]).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Snapshot and orchestrator resource kinds. |
//! | [`error`] | [`SnapshotError`] and [`ClientError`]. |
//! | [`config`] | Timeouts and poll intervals, from the environment. |
//! | [`client`] | Typed object clients, live and in-memory. |
//! | [`labels`] | Well-known label and annotation keys, metadata helpers. |
//! | [`quantity`] | Storage quantity parsing and comparison. |
//! | [`wait`] | Bounded polling. |
//! | [`snapshot`] | Class selection, readiness, metadata propagation, cleanup. |
//! | [`operation`] | Asynchronous operation ids and data movement requests. |
//! | [`action`] | Backup, restore and delete item actions. |
//! | [`registry`] | The shared context and the registered actions. |

pub mod action;
pub mod client;
pub mod config;
pub mod error;
pub mod labels;
pub mod operation;
pub mod quantity;
pub mod registry;
pub mod snapshot;
pub mod types;
pub mod wait;

#[cfg(test)]
pub(crate) mod testutil;

pub use action::{BackupItemAction, DeleteItemAction, RestoreItemAction};
pub use client::memory::MemoryClients;
pub use client::{Clients, ObjectApi};
pub use config::Config;
pub use error::{ClientError, SnapshotError};
pub use operation::{OperationId, OperationProgress};
pub use registry::{PluginContext, PluginRegistry};
