//! Claim restorer: points a restored claim at its snapshot, or at the volume
//! a data download will produce.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    TypedLocalObjectReference, TypedObjectReference, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::action::{
    GroupResource, RestoreItemAction, RestoreItemInput, RestoreItemOutput, ResourceSelector,
    from_item, require_operation_id, to_item,
};
use crate::client::{Selector, selector_string};
use crate::error::SnapshotError;
use crate::labels::{self, random_suffix, valid_name};
use crate::operation::{OperationId, OperationProgress, Tracker, new_download};
use crate::quantity;
use crate::registry::PluginContext;
use crate::types::{DataDownload, DataUploadResult, PersistentVolumeClaim, Restore};

const KIND: &str = "PersistentVolumeClaim";
const STORAGE: &str = "storage";
const SELECTOR_SUFFIX_LEN: usize = 5;

/// Restores a claim either straight from its snapshot or through a
/// DataDownload when the backup moved the data.
pub struct ClaimRestorer {
    ctx: Arc<PluginContext>,
}

impl ClaimRestorer {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-pvc-restorer";

    /// Action using the clients and timing of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }

    fn downloads(&self) -> Tracker<DataDownload> {
        Tracker::new(Arc::clone(&self.ctx.clients.downloads))
    }

    /// The upload result recorded for `claim` and addressed to `restore`.
    async fn upload_result(
        &self,
        restore: &Restore,
        source_namespace: &str,
        claim_name: &str,
    ) -> Result<DataUploadResult, SnapshotError> {
        let selector = Selector::from([
            (
                labels::PVC_NAMESPACE_NAME.to_owned(),
                valid_name(&format!("{source_namespace}.{claim_name}")),
            ),
            (labels::RESTORE_UID.to_owned(), valid_name(restore.uid())),
            (
                labels::RESOURCE_USAGE.to_owned(),
                valid_name(labels::RESOURCE_USAGE_DATA_UPLOAD),
            ),
        ]);
        let mut maps = self
            .ctx
            .clients
            .config_maps
            .list(restore.namespace(), &selector)
            .await?;

        let map = match maps.len() {
            0 => {
                return Err(SnapshotError::DataUploadResultNotFound {
                    selector: selector_string(&selector),
                });
            }
            1 => maps.remove(0),
            count => {
                return Err(SnapshotError::AmbiguousDataUploadResult {
                    selector: selector_string(&selector),
                    count,
                });
            }
        };

        let raw = map
            .data
            .as_ref()
            .and_then(|d| d.get(restore.uid()))
            .ok_or_else(|| {
                SnapshotError::internal(format!(
                    "config map {} has no data upload result for restore {} ({})",
                    map.metadata.name.as_deref().unwrap_or_default(),
                    restore.name(),
                    restore.uid(),
                ))
            })?;
        serde_json::from_str(raw).map_err(|e| SnapshotError::item("DataUploadResult", e))
    }

    /// Submit a download into `claim` and bind the claim to the volume it
    /// will provision.
    async fn restore_from_upload(
        &self,
        restore: &Restore,
        claim: &mut PersistentVolumeClaim,
        source_namespace: &str,
        id: &OperationId,
    ) -> Result<DataDownload, SnapshotError> {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let name = claim.metadata.name.clone().unwrap_or_default();
        let result = self.upload_result(restore, source_namespace, &name).await?;

        let spec = claim.spec.get_or_insert_with(Default::default);
        spec.volume_name = None;
        spec.selector
            .get_or_insert_with(LabelSelector::default)
            .match_labels
            .get_or_insert_with(Default::default)
            .insert(
                labels::DYNAMIC_PV_RESTORE.to_owned(),
                valid_name(&format!(
                    "{namespace}.{name}.{}",
                    random_suffix(SELECTOR_SUFFIX_LEN)
                )),
            );

        let request = new_download(restore, &result, claim, id);
        let download = self
            .ctx
            .clients
            .downloads
            .create(restore.namespace(), &request)
            .await?;
        info!(download = ?download.metadata.name, operation_id = %id, "submitted data download");
        Ok(download)
    }

    /// Source the claim from `snapshot_name`, growing its request to the
    /// snapshot's restore size when that is larger.
    async fn restore_from_snapshot(
        &self,
        claim: &mut PersistentVolumeClaim,
        snapshot_name: &str,
    ) -> Result<(), SnapshotError> {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let snapshot = self.ctx.clients.snapshots.get(&namespace, snapshot_name).await?;

        if let Some(size) = labels::annotation(&snapshot.metadata, labels::RESTORE_SIZE) {
            raise_storage_request(claim, size)?;
        }
        source_from_snapshot(claim, snapshot_name);
        Ok(())
    }
}

/// Raise the claim's storage request to `size` if it asks for less.
fn raise_storage_request(claim: &mut PersistentVolumeClaim, size: &str) -> Result<(), SnapshotError> {
    let requests = claim
        .spec
        .get_or_insert_with(Default::default)
        .resources
        .get_or_insert_with(VolumeResourceRequirements::default)
        .requests
        .get_or_insert_with(Default::default);

    let smaller = match requests.get(STORAGE) {
        Some(current) => quantity::compare(&current.0, size)? == Ordering::Less,
        None => true,
    };
    if smaller {
        debug!(size, "raising storage request to snapshot restore size");
        requests.insert(STORAGE.to_owned(), Quantity(size.to_owned()));
    }
    Ok(())
}

fn source_from_snapshot(claim: &mut PersistentVolumeClaim, snapshot_name: &str) {
    let group = Some(crate::types::snapshot::GROUP.to_owned());
    let spec = claim.spec.get_or_insert_with(Default::default);
    spec.volume_name = None;
    spec.data_source = Some(TypedLocalObjectReference {
        api_group: group.clone(),
        kind: "VolumeSnapshot".to_owned(),
        name: snapshot_name.to_owned(),
    });
    spec.data_source_ref = Some(TypedObjectReference {
        api_group: group,
        kind: "VolumeSnapshot".to_owned(),
        name: snapshot_name.to_owned(),
        namespace: None,
    });
}

#[async_trait]
impl RestoreItemAction for ClaimRestorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::PERSISTENT_VOLUME_CLAIMS)
    }

    #[instrument(skip_all, fields(restore = %input.restore.name()))]
    async fn execute(&self, input: RestoreItemInput) -> Result<RestoreItemOutput, SnapshotError> {
        let restore = &input.restore;
        let mut claim: PersistentVolumeClaim = from_item(KIND, &input.item)?;
        let from_backup: PersistentVolumeClaim = from_item(KIND, &input.item_from_backup)?;
        let source_namespace = from_backup.metadata.namespace.clone().unwrap_or_default();

        labels::remove_annotations(&mut claim.metadata, &labels::BINDING_ANNOTATIONS);
        labels::remove_annotations(
            &mut claim.metadata,
            &[labels::VOLUME_SNAPSHOT_NAME, labels::DATA_UPLOAD_NAME],
        );
        if let Some(ns) = claim.metadata.namespace.as_deref() {
            let mapped = restore.map_namespace(ns).to_owned();
            claim.metadata.namespace = Some(mapped);
        }

        let mut output = RestoreItemOutput::passthrough(Value::Null);

        if !restore.restores_volumes() {
            info!("restore does not restore volumes, clearing claim sources");
            let spec = claim.spec.get_or_insert_with(Default::default);
            spec.volume_name = None;
            spec.data_source = None;
            spec.data_source_ref = None;
        } else {
            let backup = self
                .ctx
                .clients
                .backups
                .get(restore.namespace(), &restore.spec.backup_name)
                .await?;

            if backup.moves_data() {
                if labels::annotation(&from_backup.metadata, labels::DATA_UPLOAD_NAME).is_none() {
                    warn!("claim has no data upload, leaving it unchanged");
                    return Ok(RestoreItemOutput::passthrough(input.item));
                }
                let claim_uid = from_backup.metadata.uid.as_deref().unwrap_or_default();
                let id = OperationId::download(restore.uid(), claim_uid);
                self.restore_from_upload(restore, &mut claim, &source_namespace, &id)
                    .await?;
                output.operation_id = Some(id.to_string());
            } else {
                let Some(snapshot_name) =
                    labels::annotation(&from_backup.metadata, labels::VOLUME_SNAPSHOT_NAME)
                else {
                    info!("claim has no volume snapshot, leaving it unchanged");
                    return Ok(RestoreItemOutput::passthrough(input.item));
                };
                self.restore_from_snapshot(&mut claim, snapshot_name).await?;
            }
        }

        output.item = to_item(KIND, &claim)?;
        Ok(output)
    }

    async fn progress(
        &self,
        operation_id: &str,
        restore: &Restore,
    ) -> Result<OperationProgress, SnapshotError> {
        require_operation_id(operation_id)?;
        self.downloads()
            .progress(restore.namespace(), &OperationId::Transfer(operation_id.to_owned()))
            .await
    }

    async fn cancel(&self, operation_id: &str, restore: &Restore) -> Result<(), SnapshotError> {
        require_operation_id(operation_id)?;
        self.downloads()
            .cancel(restore.namespace(), &OperationId::Transfer(operation_id.to_owned()))
            .await
    }
}
