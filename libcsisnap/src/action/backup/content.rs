//! Content backupper.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::action::{
    BackupItemAction, BackupItemOutput, GroupResource, ResourceIdentifier, ResourceSelector,
    from_item, require_operation_id, to_item,
};
use crate::error::SnapshotError;
use crate::labels::{self, SecretRef};
use crate::operation::{OperationId, OperationProgress};
use crate::registry::PluginContext;
use crate::types::{Backup, VolumeSnapshotContent};

const KIND: &str = "VolumeSnapshotContent";

/// Labels a snapshot content with the backup and adds its delete secret.
pub struct ContentBackupper {
    ctx: Arc<PluginContext>,
}

impl ContentBackupper {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshotcontent-backupper";

    /// Action using the clients of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl BackupItemAction for ContentBackupper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOT_CONTENTS)
    }

    #[instrument(skip(self, item, backup), fields(backup = %backup.name()))]
    async fn execute(&self, item: Value, backup: &Backup) -> Result<BackupItemOutput, SnapshotError> {
        if backup.is_finalizing() {
            return Ok(BackupItemOutput::passthrough(item));
        }

        let mut content: VolumeSnapshotContent = from_item(KIND, &item)?;
        let name = content.metadata.name.clone().unwrap_or_default();
        let mut output = BackupItemOutput::passthrough(Value::Null);

        if let Some(secret) = SecretRef::from_annotations(
            &content.metadata,
            labels::SNAPSHOTTER_SECRET_NAME,
            labels::SNAPSHOTTER_SECRET_NAMESPACE,
        ) {
            debug!(content = %name, secret = %secret.name, "including delete secret");
            output.additional_items.push(ResourceIdentifier::secret(&secret));
            labels::add_annotations(
                &mut content.metadata,
                [(labels::MUST_INCLUDE_ADDITIONAL_ITEMS, "true".to_owned())],
            );
        }

        if labels::has_backup_label(&content.metadata, backup.name()) {
            output.operation_id = Some(OperationId::content_started_now(&name).to_string());
            output.items_to_update.push(ResourceIdentifier::cluster(
                GroupResource::VOLUME_SNAPSHOT_CONTENTS,
                &name,
            ));
        }

        output.item = to_item(KIND, &content)?;
        Ok(output)
    }

    async fn progress(
        &self,
        operation_id: &str,
        _backup: &Backup,
    ) -> Result<OperationProgress, SnapshotError> {
        require_operation_id(operation_id)?;
        let OperationId::Content { name, started } = OperationId::parse_content(operation_id)? else {
            return Err(SnapshotError::operation_id(operation_id, "not a content operation"));
        };

        let mut progress = OperationProgress {
            started: Some(started),
            ..Default::default()
        };
        let content = self.ctx.clients.contents.get("", &name).await?;
        if content.status.is_none() {
            return Ok(progress);
        }
        if let Some(message) = content.error_message() {
            progress.completed = true;
            progress.err = Some(message);
        } else if content.is_ready() {
            progress.completed = true;
            progress.updated = Some(chrono::Utc::now());
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Fixture, content_with_handle};
    use crate::types::{BackupPhase, velero::BackupStatus};

    fn action(fx: &Fixture) -> ContentBackupper {
        ContentBackupper::new(fx.ctx.clone())
    }

    #[tokio::test]
    async fn labelled_content_returns_operation() {
        let fx = Fixture::new();
        let backup = fx.backup();
        let mut content = content_with_handle("snapcontent-1", Some("h"), None);
        labels::add_labels(&mut content.metadata, [(labels::BACKUP_NAME, backup.name().to_owned())]);
        labels::add_annotations(
            &mut content.metadata,
            [
                (labels::SNAPSHOTTER_SECRET_NAME, "creds".to_owned()),
                (labels::SNAPSHOTTER_SECRET_NAMESPACE, "kube-system".to_owned()),
            ],
        );

        let out = action(&fx)
            .execute(serde_json::to_value(&content).unwrap(), &backup)
            .await
            .unwrap();
        assert_eq!(
            out.additional_items,
            vec![ResourceIdentifier::new(GroupResource::SECRETS, "kube-system", "creds")]
        );
        let returned: VolumeSnapshotContent = serde_json::from_value(out.item).unwrap();
        assert_eq!(
            labels::annotation(&returned.metadata, labels::MUST_INCLUDE_ADDITIONAL_ITEMS),
            Some("true")
        );
        let id = out.operation_id.unwrap();
        assert!(id.starts_with("snapcontent-1/"));
        assert!(OperationId::parse_content(&id).is_ok());
        assert_eq!(out.items_to_update.len(), 1);
    }

    #[tokio::test]
    async fn unlabelled_content_has_no_operation() {
        let fx = Fixture::new();
        let content = content_with_handle("snapcontent-1", Some("h"), None);
        let out = action(&fx)
            .execute(serde_json::to_value(&content).unwrap(), &fx.backup())
            .await
            .unwrap();
        assert_eq!(out.operation_id, None);
        assert!(out.additional_items.is_empty());
    }

    #[tokio::test]
    async fn finalizing_passes_through() {
        let fx = Fixture::new();
        let mut backup = fx.backup();
        backup.status = Some(BackupStatus {
            phase: Some(BackupPhase::FinalizingPartiallyFailed),
        });
        let item = serde_json::to_value(content_with_handle("c", Some("h"), None)).unwrap();
        let out = action(&fx).execute(item.clone(), &backup).await.unwrap();
        assert_eq!(out, BackupItemOutput::passthrough(item));
    }

    #[tokio::test]
    async fn progress_reports_readiness() {
        let fx = Fixture::new();
        let mut content = content_with_handle("snapcontent-1", Some("h"), None);
        content.status.as_mut().unwrap().ready_to_use = Some(false);
        fx.store.contents.insert(content);
        let id = OperationId::content_started_now("snapcontent-1").to_string();

        let p = action(&fx).progress(&id, &fx.backup()).await.unwrap();
        assert!(!p.completed);

        fx.store.contents.modify("", "snapcontent-1", |c| {
            c.status.as_mut().unwrap().ready_to_use = Some(true);
        });
        let p = action(&fx).progress(&id, &fx.backup()).await.unwrap();
        assert!(p.completed);

        let err = action(&fx)
            .progress("apps/snapcontent-1/2024-03-01T00:00:00Z", &fx.backup())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidOperationId { .. }));
    }
}
