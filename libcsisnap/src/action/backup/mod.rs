//! Backup item actions.

pub mod class;
pub mod content;
pub mod pvc;
pub mod volumesnapshot;

pub use class::ClassBackupper;
pub use content::ContentBackupper;
pub use pvc::ClaimBackupper;
pub use volumesnapshot::SnapshotBackupper;
