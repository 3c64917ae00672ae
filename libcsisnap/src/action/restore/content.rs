//! Content restorer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::action::{
    GroupResource, RestoreItemAction, RestoreItemInput, RestoreItemOutput, ResourceIdentifier,
    ResourceSelector, from_item, to_item,
};
use crate::error::SnapshotError;
use crate::labels::{self, SecretRef};
use crate::registry::PluginContext;
use crate::snapshot::rebind_static;
use crate::types::VolumeSnapshotContent;

const KIND: &str = "VolumeSnapshotContent";

/// Rebinds a restored content to the snapshot it belongs to.
pub struct ContentRestorer {
    ctx: Arc<PluginContext>,
}

impl ContentRestorer {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshotcontent-restorer";

    /// Action using the clients of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RestoreItemAction for ContentRestorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOT_CONTENTS)
    }

    #[instrument(skip_all, fields(restore = %input.restore.name()))]
    async fn execute(&self, input: RestoreItemInput) -> Result<RestoreItemOutput, SnapshotError> {
        let mut content: VolumeSnapshotContent = from_item(KIND, &input.item)?;
        let name = content.metadata.name.clone().unwrap_or_default();

        match self.ctx.clients.contents.get("", &name).await {
            Ok(_) => {
                debug!(content = %name, "content already exists, skipping");
                return Ok(RestoreItemOutput::skip(input.item));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let from_backup: VolumeSnapshotContent = from_item(KIND, &input.item_from_backup)?;
        let handle = from_backup
            .snapshot_handle()
            .ok_or_else(|| SnapshotError::item(KIND, "unable to lookup snapshot handle from status"))?;
        rebind_static(&mut content, handle);

        let mut output = RestoreItemOutput::passthrough(to_item(KIND, &content)?);
        if let Some(secret) = SecretRef::from_annotations(
            &content.metadata,
            labels::SNAPSHOTTER_SECRET_NAME,
            labels::SNAPSHOTTER_SECRET_NAMESPACE,
        ) {
            output.additional_items.push(ResourceIdentifier::secret(&secret));
        }
        Ok(output)
    }
}
