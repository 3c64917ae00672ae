//! Backup deletion actions. Both only touch objects labelled with the name
//! of the backup being deleted.

pub mod content;
pub mod volumesnapshot;

pub use content::ContentDeleter;
pub use volumesnapshot::SnapshotDeleter;
