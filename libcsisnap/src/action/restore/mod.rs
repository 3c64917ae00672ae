//! Restore item actions.

pub mod class;
pub mod content;
pub mod pvc;
pub mod volumesnapshot;

pub use class::ClassRestorer;
pub use content::ContentRestorer;
pub use pvc::ClaimRestorer;
pub use volumesnapshot::SnapshotRestorer;
