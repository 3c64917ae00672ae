use async_trait::async_trait;
use serde_json::Value;

use crate::action::{
    BackupItemAction, BackupItemOutput, GroupResource, ResourceIdentifier, ResourceSelector,
    from_item,
};
use crate::error::SnapshotError;
use crate::labels::{self, SecretRef};
use crate::types::{Backup, VolumeSnapshotClass};

const KIND: &str = "VolumeSnapshotClass";

/// The class's list secret, if it names one.
pub(crate) fn list_secret(item: &Value) -> Result<Option<ResourceIdentifier>, SnapshotError> {
    let class: VolumeSnapshotClass = from_item(KIND, item)?;
    Ok(SecretRef::from_annotations(
        &class.metadata,
        labels::SNAPSHOTTER_LIST_SECRET_NAME,
        labels::SNAPSHOTTER_LIST_SECRET_NAMESPACE,
    )
    .map(|s| ResourceIdentifier::secret(&s)))
}

/// Adds the class's list secret to the backup.
#[derive(Default)]
pub struct ClassBackupper;

impl ClassBackupper {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshotclass-backupper";
}

#[async_trait]
impl BackupItemAction for ClassBackupper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOT_CLASSES)
    }

    async fn execute(&self, item: Value, _backup: &Backup) -> Result<BackupItemOutput, SnapshotError> {
        let secret = list_secret(&item)?;
        let mut output = BackupItemOutput::passthrough(item);
        output.additional_items.extend(secret);
        Ok(output)
    }
}
