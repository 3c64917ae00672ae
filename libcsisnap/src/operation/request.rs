//! Construction of data-movement requests.
//!
//! A request carries everything the mover needs, so the coordinator never
//! touches it again except to read progress or set the cancel flag.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::OperationId;
use crate::labels;
use crate::types::velero::{CsiSnapshotSpec, TargetVolumeSpec, owner_reference};
use crate::types::{
    Backup, DataDownload, DataDownloadSpec, DataUpload, DataUploadResult, DataUploadSpec,
    PersistentVolumeClaim, Restore, VolumeSnapshot,
};

const SNAPSHOT_TYPE_CSI: &str = "CSI";

fn request_labels<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    let mut meta = ObjectMeta::default();
    labels::add_labels(&mut meta, pairs);
    meta.labels.unwrap_or_default()
}

/// Upload of `snapshot`, taken from `claim` for `backup`.
pub fn new_upload(
    backup: &Backup,
    snapshot: &VolumeSnapshot,
    claim: &PersistentVolumeClaim,
    id: &OperationId,
) -> DataUpload {
    let claim_spec = claim.spec.clone().unwrap_or_default();
    DataUpload {
        metadata: ObjectMeta {
            namespace: Some(backup.namespace().to_owned()),
            generate_name: Some(format!("{}-", backup.name())),
            owner_references: Some(vec![owner_reference(backup)]),
            labels: Some(request_labels([
                (labels::BACKUP_NAME, backup.name().to_owned()),
                (labels::BACKUP_UID, backup.uid().to_owned()),
                (labels::PVC_UID, claim.metadata.uid.clone().unwrap_or_default()),
                (labels::ASYNC_OPERATION_ID, id.to_string()),
            ])),
            ..Default::default()
        },
        spec: DataUploadSpec {
            snapshot_type: SNAPSHOT_TYPE_CSI.to_owned(),
            csi_snapshot: Some(CsiSnapshotSpec {
                volume_snapshot: snapshot.metadata.name.clone().unwrap_or_default(),
                storage_class: claim_spec.storage_class_name.unwrap_or_default(),
                snapshot_class: snapshot
                    .spec
                    .volume_snapshot_class_name
                    .clone()
                    .unwrap_or_default(),
            }),
            source_pvc: claim.metadata.name.clone().unwrap_or_default(),
            data_mover: backup.spec.data_mover.clone(),
            backup_storage_location: backup.spec.storage_location.clone().unwrap_or_default(),
            source_namespace: claim.metadata.namespace.clone().unwrap_or_default(),
            operation_timeout: backup.spec.csi_snapshot_timeout.clone(),
            cancel: None,
        },
        status: None,
    }
}

/// Download of a completed upload into `claim`, for `restore`.
pub fn new_download(
    restore: &Restore,
    result: &DataUploadResult,
    claim: &PersistentVolumeClaim,
    id: &OperationId,
) -> DataDownload {
    DataDownload {
        metadata: ObjectMeta {
            namespace: Some(restore.namespace().to_owned()),
            generate_name: Some(format!("{}-", restore.name())),
            owner_references: Some(vec![owner_reference(restore)]),
            labels: Some(request_labels([
                (labels::RESTORE_NAME, restore.name().to_owned()),
                (labels::RESTORE_UID, restore.uid().to_owned()),
                (labels::ASYNC_OPERATION_ID, id.to_string()),
            ])),
            ..Default::default()
        },
        spec: DataDownloadSpec {
            target_volume: TargetVolumeSpec {
                pvc: claim.metadata.name.clone().unwrap_or_default(),
                pv: None,
                namespace: claim.metadata.namespace.clone().unwrap_or_default(),
            },
            backup_storage_location: result.backup_storage_location.clone(),
            data_mover: result.data_mover.clone(),
            snapshot_id: result.snapshot_id.clone(),
            source_namespace: result.source_namespace.clone(),
            operation_timeout: restore.spec.item_operation_timeout.clone(),
            cancel: None,
        },
        status: None,
    }
}
