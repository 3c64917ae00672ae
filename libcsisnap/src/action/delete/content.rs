//! Content deleter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::action::{DeleteItemAction, DeleteItemInput, GroupResource, ResourceSelector, from_item};
use crate::error::SnapshotError;
use crate::labels;
use crate::registry::PluginContext;
use crate::snapshot::set_deletion_policy;
use crate::types::{DeletionPolicy, VolumeSnapshotContent};

const KIND: &str = "VolumeSnapshotContent";

/// Removes the storage-side snapshot behind a backed up content.
pub struct ContentDeleter {
    ctx: Arc<PluginContext>,
}

impl ContentDeleter {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshotcontent-delete";

    /// Action using the clients of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DeleteItemAction for ContentDeleter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOT_CONTENTS)
    }

    #[instrument(skip_all, fields(backup = %input.backup.name()))]
    async fn execute(&self, input: DeleteItemInput) -> Result<(), SnapshotError> {
        let content: VolumeSnapshotContent = from_item(KIND, &input.item)?;
        let name = content.metadata.name.as_deref().unwrap_or_default();

        if !labels::has_backup_label(&content.metadata, input.backup.name()) {
            info!(content = %name, "content was not taken by this backup, skipping");
            return Ok(());
        }

        let clients = &self.ctx.clients;
        match set_deletion_policy(clients, name, DeletionPolicy::Delete).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                info!(content = %name, "content not found");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        info!(content = %name, "deleting volume snapshot content");
        match clients.contents.delete("", name).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::Verb;
    use crate::testutil::{Fixture, content_with_handle};

    fn action(fx: &Fixture) -> ContentDeleter {
        ContentDeleter::new(fx.ctx.clone())
    }

    fn labelled(name: &str, backup: &str) -> VolumeSnapshotContent {
        let mut content = content_with_handle(name, Some("h-1"), None);
        content.spec.deletion_policy = DeletionPolicy::Retain;
        labels::add_labels(&mut content.metadata, [(labels::BACKUP_NAME, backup.to_owned())]);
        content
    }

    fn input(fx: &Fixture, content: &VolumeSnapshotContent) -> DeleteItemInput {
        DeleteItemInput {
            item: serde_json::to_value(content).unwrap(),
            backup: fx.backup(),
        }
    }

    #[tokio::test]
    async fn owned_content_is_deleted_with_storage_snapshot() {
        let fx = Fixture::new();
        let content = fx.store.contents.insert(labelled("snapcontent-1", "nightly"));
        action(&fx).execute(input(&fx, &content)).await.unwrap();

        let ops: Vec<_> = fx
            .store
            .journal
            .entries()
            .into_iter()
            .map(|e| e.verb)
            .collect();
        assert_eq!(ops, vec![Verb::Patch, Verb::Delete]);
        let patch = &fx.store.journal.filter(KIND, Verb::Patch)[0];
        assert_eq!(
            patch.patch,
            Some(serde_json::json!({"spec": {"deletionPolicy": "Delete"}}))
        );
        assert!(fx.store.contents.all().is_empty());
    }

    #[tokio::test]
    async fn other_backups_content_is_kept() {
        let fx = Fixture::new();
        let content = fx.store.contents.insert(labelled("snapcontent-1", "weekly"));
        action(&fx).execute(input(&fx, &content)).await.unwrap();
        assert_eq!(fx.store.contents.all().len(), 1);
        assert!(fx.store.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn vanished_content_is_benign() {
        let fx = Fixture::new();
        let content = labelled("snapcontent-1", "nightly");
        action(&fx).execute(input(&fx, &content)).await.unwrap();
        assert!(fx.store.journal.filter(KIND, Verb::Delete).is_empty());
    }
}
