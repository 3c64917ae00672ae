//! Snapshot lifecycle: class resolution, reconciliation waiting, metadata
//! propagation and the deletion policy guard.

pub mod class;
pub mod guard;
pub mod metadata;
pub mod reconcile;

pub use guard::{cleanup_volume_snapshot, detach_content, rebind_static, set_deletion_policy};
pub use metadata::{Propagation, label_content_for_backup, propagate};
pub use reconcile::{WaitMode, bound_content};
