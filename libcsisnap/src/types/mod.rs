//! Resource model.
//!
//! Core Kubernetes kinds come straight from `k8s-openapi`; the snapshot and
//! orchestrator kinds are declared here.

pub mod snapshot;
pub mod velero;

pub use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, Pod,
};
pub use k8s_openapi::api::storage::v1::StorageClass;

pub use snapshot::{
    DeletionPolicy, VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotContent,
    VolumeSnapshotContentSource, VolumeSnapshotContentSpec, VolumeSnapshotSource,
    VolumeSnapshotSpec,
};
pub use velero::{
    Backup, BackupPhase, DataDownload, DataDownloadSpec, DataMovePhase, DataMoveStatus,
    DataUpload, DataUploadResult, DataUploadSpec, Restore,
};
