//! Claim backupper: snapshots a CSI claim, optionally handing the snapshot
//! to the data mover.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::action::{
    BackupItemAction, BackupItemOutput, GroupResource, ResourceIdentifier, ResourceSelector,
    from_item, require_operation_id, to_item,
};
use crate::client::Selector;
use crate::error::SnapshotError;
use crate::labels;
use crate::operation::{OperationId, OperationProgress, Tracker, new_upload};
use crate::registry::PluginContext;
use crate::snapshot::{WaitMode, bound_content, class, cleanup_volume_snapshot};
use crate::types::{
    Backup, DataUpload, PersistentVolume, PersistentVolumeClaim, Pod, VolumeSnapshot,
    VolumeSnapshotClass, VolumeSnapshotSource, VolumeSnapshotSpec,
};

const KIND: &str = "PersistentVolumeClaim";
const CLAIM_BOUND: &str = "Bound";

/// Snapshots a bound CSI claim and, when the backup moves data, hands the
/// snapshot to the data mover as an asynchronous upload.
pub struct ClaimBackupper {
    ctx: Arc<PluginContext>,
}

impl ClaimBackupper {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-pvc-backupper";

    /// Action using the clients and timing of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }

    /// The volume the claim is bound to.
    async fn bound_volume(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolume, SnapshotError> {
        let not_bound = |reason: String| SnapshotError::ClaimNotBound {
            namespace: claim.metadata.namespace.clone().unwrap_or_default(),
            name: claim.metadata.name.clone().unwrap_or_default(),
            reason,
        };

        let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase != Some(CLAIM_BOUND) {
            return Err(not_bound(format!("phase is {}", phase.unwrap_or("unknown"))));
        }
        let volume_name = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_deref())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| not_bound("no volume name".to_owned()))?;

        match self.ctx.clients.volumes.get("", volume_name).await {
            Ok(pv) => Ok(pv),
            Err(e) if e.is_not_found() => Err(not_bound(format!("volume {volume_name} not found"))),
            Err(e) => Err(e.into()),
        }
    }

    /// Why this claim is left to another backup mechanism, if it is.
    async fn skip_reason(
        &self,
        claim: &PersistentVolumeClaim,
        volume: &PersistentVolume,
        backup: &Backup,
    ) -> Result<Option<&'static str>, SnapshotError> {
        let is_csi = volume.spec.as_ref().and_then(|s| s.csi.as_ref()).is_some();
        if !is_csi {
            return Ok(Some("volume is not provisioned by a CSI driver"));
        }
        if self.uses_fs_backup(claim, backup).await? {
            return Ok(Some("volume is backed up by the filesystem mover"));
        }
        Ok(None)
    }

    /// True if a pod mounting the claim selects its volume for filesystem
    /// backup.
    async fn uses_fs_backup(
        &self,
        claim: &PersistentVolumeClaim,
        backup: &Backup,
    ) -> Result<bool, SnapshotError> {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        let claim_name = claim.metadata.name.as_deref().unwrap_or_default();
        let pods = self.ctx.clients.pods.list(namespace, &Selector::new()).await?;

        Ok(pods.iter().any(|pod| {
            let selected = fs_backup_volumes(pod, backup.defaults_to_fs_backup());
            pod_volumes(pod)
                .filter(|(_, claim)| *claim == claim_name)
                .any(|(volume, _)| selected.contains(volume))
        }))
    }

    async fn create_snapshot(
        &self,
        claim: &PersistentVolumeClaim,
        backup: &Backup,
        class: &VolumeSnapshotClass,
    ) -> Result<VolumeSnapshot, SnapshotError> {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let claim_name = claim.metadata.name.clone().unwrap_or_default();

        let mut snapshot = VolumeSnapshot::new(
            "",
            VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(claim_name.clone()),
                    volume_snapshot_content_name: None,
                },
                volume_snapshot_class_name: class.metadata.name.clone(),
            },
        );
        snapshot.metadata.name = None;
        snapshot.metadata.generate_name = Some(format!("velero-{claim_name}-"));
        snapshot.metadata.namespace = Some(namespace.clone());
        snapshot.metadata.labels = claim.metadata.labels.clone();
        labels::add_labels(
            &mut snapshot.metadata,
            [(labels::BACKUP_NAME, backup.name().to_owned())],
        );

        let created = self.ctx.clients.snapshots.create(&namespace, &snapshot).await?;
        info!(
            snapshot = ?created.metadata.name,
            class = ?class.metadata.name,
            "created volume snapshot"
        );
        Ok(created)
    }

    /// Wait for a handle, then create the upload request. Either failure
    /// removes the snapshot.
    async fn submit_upload(
        &self,
        backup: &Backup,
        snapshot: &VolumeSnapshot,
        claim: &PersistentVolumeClaim,
    ) -> Result<(OperationId, DataUpload), SnapshotError> {
        let clients = &self.ctx.clients;
        let timeout = self
            .ctx
            .config
            .snapshot_timeout_for(backup.spec.csi_snapshot_timeout.as_deref());

        let waited = bound_content(
            clients,
            self.ctx.config.poll_interval,
            snapshot,
            WaitMode::Await { timeout },
        )
        .await;
        if let Err(e) = waited {
            cleanup_volume_snapshot(clients, snapshot).await;
            return Err(e);
        }

        let claim_uid = claim.metadata.uid.as_deref().unwrap_or_default();
        let id = OperationId::upload(backup.uid(), claim_uid);
        let request = new_upload(backup, snapshot, claim, &id);
        match clients.uploads.create(backup.namespace(), &request).await {
            Ok(upload) => {
                info!(upload = ?upload.metadata.name, operation_id = %id, "submitted data upload");
                Ok((id, upload))
            }
            Err(e) => {
                warn!(error = %e, "failed to submit data upload");
                cleanup_volume_snapshot(clients, snapshot).await;
                Err(e.into())
            }
        }
    }

    fn uploads(&self) -> Tracker<DataUpload> {
        Tracker::new(Arc::clone(&self.ctx.clients.uploads))
    }
}

#[async_trait]
impl BackupItemAction for ClaimBackupper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::PERSISTENT_VOLUME_CLAIMS)
    }

    #[instrument(skip(self, item, backup), fields(backup = %backup.name()))]
    async fn execute(&self, item: Value, backup: &Backup) -> Result<BackupItemOutput, SnapshotError> {
        if backup.snapshots_disabled() {
            info!("backup excludes volume snapshots, skipping claim");
            return Ok(BackupItemOutput::passthrough(item));
        }
        if backup.is_finalizing() {
            info!("backup is finalizing, skipping claim");
            return Ok(BackupItemOutput::passthrough(item));
        }

        let mut claim: PersistentVolumeClaim = from_item(KIND, &item)?;
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let name = claim.metadata.name.clone().unwrap_or_default();

        let volume = self.bound_volume(&claim).await?;
        if let Some(reason) = self.skip_reason(&claim, &volume, backup).await? {
            info!(%namespace, %name, reason, "skipping claim");
            labels::add_annotations(
                &mut claim.metadata,
                [(labels::SKIPPED_NO_CSI_PV, "true".to_owned())],
            );
            return Ok(BackupItemOutput::passthrough(to_item(KIND, &claim)?));
        }

        let storage_class = claim
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SnapshotError::MissingStorageClass {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;
        let provisioner = self
            .ctx
            .clients
            .storage_classes
            .get("", &storage_class)
            .await?
            .provisioner;
        let class = class::resolve(&self.ctx.clients, &provisioner, &claim, backup).await?;

        let snapshot = self.create_snapshot(&claim, backup, &class).await?;
        let snapshot_name = snapshot.metadata.name.clone().unwrap_or_default();

        let mut output = BackupItemOutput::passthrough(Value::Null);
        let mut annotations = vec![
            (labels::VOLUME_SNAPSHOT_NAME, snapshot_name.clone()),
            (labels::MUST_INCLUDE_ADDITIONAL_ITEMS, "true".to_owned()),
        ];

        if backup.moves_data() {
            let (id, upload) = self.submit_upload(backup, &snapshot, &claim).await?;
            let upload_ns = upload.metadata.namespace.clone().unwrap_or_default();
            let upload_name = upload.metadata.name.clone().unwrap_or_default();
            annotations.push((labels::DATA_UPLOAD_NAME, format!("{upload_ns}/{upload_name}")));
            output.operation_id = Some(id.to_string());
            output.items_to_update.push(ResourceIdentifier::new(
                GroupResource::DATA_UPLOADS,
                &upload_ns,
                &upload_name,
            ));
        } else {
            output.additional_items.push(ResourceIdentifier::new(
                GroupResource::VOLUME_SNAPSHOTS,
                &namespace,
                &snapshot_name,
            ));
        }

        labels::remove_annotations(&mut claim.metadata, &labels::BINDING_ANNOTATIONS);
        labels::add_annotations(&mut claim.metadata, annotations);
        labels::add_labels(
            &mut claim.metadata,
            [
                (labels::VOLUME_SNAPSHOT_NAME, snapshot_name),
                (labels::BACKUP_NAME, backup.name().to_owned()),
            ],
        );
        output.item = to_item(KIND, &claim)?;
        Ok(output)
    }

    async fn progress(
        &self,
        operation_id: &str,
        backup: &Backup,
    ) -> Result<OperationProgress, SnapshotError> {
        require_operation_id(operation_id)?;
        self.uploads()
            .progress(backup.namespace(), &OperationId::Transfer(operation_id.to_owned()))
            .await
    }

    async fn cancel(&self, operation_id: &str, backup: &Backup) -> Result<(), SnapshotError> {
        require_operation_id(operation_id)?;
        self.uploads()
            .cancel(backup.namespace(), &OperationId::Transfer(operation_id.to_owned()))
            .await
    }
}

/// `(volume name, claim name)` for every claim-backed volume of the pod.
fn pod_volumes(pod: &Pod) -> impl Iterator<Item = (&str, &str)> {
    pod.spec
        .iter()
        .flat_map(|s| s.volumes.iter().flatten())
        .filter_map(|v| {
            let claim = v.persistent_volume_claim.as_ref()?;
            Some((v.name.as_str(), claim.claim_name.as_str()))
        })
}

/// Names of the pod volumes selected for filesystem backup.
fn fs_backup_volumes(pod: &Pod, defaults_to_fs_backup: bool) -> BTreeSet<&str> {
    let list = |key| {
        labels::annotation(&pod.metadata, key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default()
    };

    if !defaults_to_fs_backup {
        return list(labels::FS_BACKUP_VOLUMES);
    }
    let excluded = list(labels::FS_BACKUP_VOLUMES_EXCLUDES);
    pod_volumes(pod)
        .map(|(volume, _)| volume)
        .filter(|v| !excluded.contains(v))
        .collect()
}
