//! Snapshot deleter: removes a snapshot taken by the backup being deleted,
//! together with its storage-side data.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::action::{DeleteItemAction, DeleteItemInput, GroupResource, ResourceSelector, from_item};
use crate::error::SnapshotError;
use crate::labels;
use crate::registry::PluginContext;
use crate::snapshot::set_deletion_policy;
use crate::types::{DeletionPolicy, VolumeSnapshot};

const KIND: &str = "VolumeSnapshot";

/// Removes the storage-side snapshot behind a backed up snapshot.
pub struct SnapshotDeleter {
    ctx: Arc<PluginContext>,
}

impl SnapshotDeleter {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshot-delete";

    /// Action using the clients of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DeleteItemAction for SnapshotDeleter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOTS)
    }

    #[instrument(skip_all, fields(backup = %input.backup.name()))]
    async fn execute(&self, input: DeleteItemInput) -> Result<(), SnapshotError> {
        let snapshot: VolumeSnapshot = from_item(KIND, &input.item)?;
        let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();
        let name = snapshot.metadata.name.as_deref().unwrap_or_default();

        if !labels::has_backup_label(&snapshot.metadata, input.backup.name()) {
            info!(%namespace, %name, "snapshot was not taken by this backup, skipping");
            return Ok(());
        }

        let clients = &self.ctx.clients;
        if let Some(content) = snapshot.bound_content_name() {
            match set_deletion_policy(clients, content, DeletionPolicy::Delete).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    info!(%content, "bound content is already gone");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(%namespace, %name, "deleting volume snapshot");
        match clients.snapshots.delete(namespace, name).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }
}
