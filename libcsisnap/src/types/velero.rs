//! Orchestrator resources: `velero.io/v1` Backup and Restore, and the
//! `velero.io/v2alpha1` data-movement requests.
//!
//! Only the fields the coordinator reads or writes are modelled. Unknown
//! fields are ignored on input.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::{CustomResource, Resource};
use serde::de::IntoDeserializer;
use serde::de::value::StrDeserializer;
use serde::{Deserialize, Deserializer, Serialize};

/// API group of the orchestrator kinds.
pub const GROUP: &str = "velero.io";

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

/// The parts of a backup request the coordinator acts on.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "Backup",
    namespaced,
    status = "BackupStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// `false` turns volume snapshots off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,
    /// Move snapshot data to the backup storage location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_move_data: Option<bool>,
    /// Back up volumes with the filesystem uploader unless a pod opts out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_volumes_to_fs_backup: Option<bool>,
    /// Go duration string, e.g. `10m0s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi_snapshot_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_operation_timeout: Option<String>,
    /// Backup storage location the data mover writes to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    /// Data mover name. Empty selects the built-in one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Unknown phases read as [`BackupPhase::Unknown`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,
}

/// Backup lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum BackupPhase {
    New,
    FailedValidation,
    InProgress,
    WaitingForPluginOperations,
    WaitingForPluginOperationsPartiallyFailed,
    Finalizing,
    FinalizingPartiallyFailed,
    Completed,
    PartiallyFailed,
    Failed,
    Deleting,
    /// A phase this crate does not know about.
    #[serde(other)]
    Unknown,
}

impl Backup {
    /// Current phase, if the status carries one.
    pub fn phase(&self) -> Option<BackupPhase> {
        self.status.as_ref()?.phase
    }

    /// Async operations are being wrapped up; no new work may start.
    pub fn is_finalizing(&self) -> bool {
        matches!(
            self.phase(),
            Some(BackupPhase::Finalizing | BackupPhase::FinalizingPartiallyFailed)
        )
    }

    /// Snapshots are only skipped when explicitly disabled.
    pub fn snapshots_disabled(&self) -> bool {
        self.spec.snapshot_volumes == Some(false)
    }

    /// Snapshot data is moved by a data mover.
    pub fn moves_data(&self) -> bool {
        self.spec.snapshot_move_data == Some(true)
    }

    pub fn defaults_to_fs_backup(&self) -> bool {
        self.spec.default_volumes_to_fs_backup == Some(true)
    }

    /// Metadata accessors. Empty when unset.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

/// The parts of a restore request the coordinator acts on.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "Restore",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Backup being restored.
    #[serde(default)]
    pub backup_name: String,
    /// Source namespace to target namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_mapping: Option<BTreeMap<String, String>>,
    /// `false` restores claims without their data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_pvs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_operation_timeout: Option<String>,
}

impl Restore {
    /// Target namespace for an object that lived in `namespace` at backup
    /// time.
    pub fn map_namespace<'a>(&'a self, namespace: &'a str) -> &'a str {
        self.spec
            .namespace_mapping
            .as_ref()
            .and_then(|m| m.get(namespace))
            .map(String::as_str)
            .unwrap_or(namespace)
    }

    /// Volumes are restored unless explicitly disabled.
    pub fn restores_volumes(&self) -> bool {
        self.spec.restore_pvs != Some(false)
    }

    /// Metadata accessors. Empty when unset.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }
}

/// Controller owner reference pointing at `owner`.
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> OwnerReference {
    let meta = owner.meta();
    OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

// ---------------------------------------------------------------------------
// Data movement
// ---------------------------------------------------------------------------

/// Lifecycle of an upload or download request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DataMovePhase {
    New,
    Accepted,
    Prepared,
    InProgress,
    Canceling,
    Canceled,
    Completed,
    Failed,
}

impl fmt::Display for DataMovePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An empty phase string means the mover has not picked the request up yet.
fn phase_or_empty<'de, D>(d: D) -> Result<Option<DataMovePhase>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(d)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => {
            let de: StrDeserializer<'_, D::Error> = s.into_deserializer();
            DataMovePhase::deserialize(de).map(Some)
        }
    }
}

/// Byte counters of a running transfer.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMoveProgress {
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default)]
    pub bytes_done: i64,
}

/// Status shared by uploads and downloads.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMoveStatus {
    #[serde(
        default,
        deserialize_with = "phase_or_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub phase: Option<DataMovePhase>,
    /// Failure or cancellation detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<DataMoveProgress>,
    /// Repository snapshot written by a completed upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

/// The CSI snapshot an upload reads from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiSnapshotSpec {
    /// Snapshot name, in the upload's source namespace.
    pub volume_snapshot: String,
    pub storage_class: String,
    #[serde(default)]
    pub snapshot_class: String,
}

/// Asks the data mover to copy a snapshot into backup storage.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "velero.io",
    version = "v2alpha1",
    kind = "DataUpload",
    namespaced,
    status = "DataMoveStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DataUploadSpec {
    /// Always `CSI` here.
    pub snapshot_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi_snapshot: Option<CsiSnapshotSpec>,
    pub source_pvc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<String>,
    pub backup_storage_location: String,
    pub source_namespace: String,
    /// Go duration string bounding the transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout: Option<String>,
    /// Set to ask the data mover to stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<bool>,
}

/// Claim (and optionally volume) a download writes into.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetVolumeSpec {
    pub pvc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pv: Option<String>,
    pub namespace: String,
}

/// Asks the data mover to fill a restored claim from backup storage.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "velero.io",
    version = "v2alpha1",
    kind = "DataDownload",
    namespaced,
    status = "DataMoveStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DataDownloadSpec {
    pub target_volume: TargetVolumeSpec,
    /// Copied from the [`DataUploadResult`].
    pub backup_storage_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<String>,
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
    pub source_namespace: String,
    /// Go duration string bounding the transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout: Option<String>,
    /// Set to ask the data mover to stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<bool>,
}

/// Record left by a completed upload, consumed by the restore path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUploadResult {
    pub backup_storage_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<String>,
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
    pub source_namespace: String,
}
