//! Snapshot backupper: captures the bound content's facts on the snapshot
//! and reports when the storage-side snapshot is ready.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::action::{
    BackupItemAction, BackupItemOutput, GroupResource, ResourceIdentifier, ResourceSelector,
    from_item, require_operation_id, to_item,
};
use crate::error::SnapshotError;
use crate::labels;
use crate::operation::{OperationId, OperationProgress};
use crate::registry::PluginContext;
use crate::snapshot::{
    WaitMode, bound_content, cleanup_volume_snapshot, detach_content, label_content_for_backup,
    propagate,
};
use crate::types::{Backup, VolumeSnapshot};

const KIND: &str = "VolumeSnapshot";

/// Waits for a snapshot to be bound to a ready content and records the
/// content facts a restore needs on the snapshot itself.
pub struct SnapshotBackupper {
    ctx: Arc<PluginContext>,
}

impl SnapshotBackupper {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshot-backupper";

    /// Action using the clients and timing of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }

    /// The snapshot was taken by the current backup and has outlived its
    /// purpose. Keep the storage-side snapshot, drop the objects.
    ///
    /// An unbound snapshot holds no storage-side data. It is deleted when this
    /// backup created it and left alone otherwise.
    async fn finalize(&self, snapshot: &VolumeSnapshot, backup: &Backup) -> Result<(), SnapshotError> {
        let clients = &self.ctx.clients;
        let config = &self.ctx.config;
        let content = bound_content(clients, config.poll_interval, snapshot, WaitMode::Observe).await?;
        if let Some(content) = content {
            let timeout = config.snapshot_timeout_for(backup.spec.csi_snapshot_timeout.as_deref());
            detach_content(
                clients,
                snapshot,
                &content,
                config.recreate_poll_interval,
                timeout,
            )
            .await;
            return Ok(());
        }

        let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();
        let name = snapshot.metadata.name.as_deref().unwrap_or_default();
        if !labels::has_backup_label(&snapshot.metadata, backup.name()) {
            info!(%namespace, %name, "unbound snapshot was not taken by this backup, keeping it");
            return Ok(());
        }
        match clients.snapshots.delete(namespace, name).await {
            Ok(()) => info!(%namespace, %name, "deleted unbound volume snapshot"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%namespace, %name, error = %e, "failed to delete unbound volume snapshot"),
        }
        Ok(())
    }
}

#[async_trait]
impl BackupItemAction for SnapshotBackupper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOTS)
    }

    #[instrument(skip(self, item, backup), fields(backup = %backup.name()))]
    async fn execute(&self, item: Value, backup: &Backup) -> Result<BackupItemOutput, SnapshotError> {
        let mut snapshot: VolumeSnapshot = from_item(KIND, &item)?;
        let namespace = snapshot.metadata.namespace.clone().unwrap_or_default();
        let name = snapshot.metadata.name.clone().unwrap_or_default();

        if backup.is_finalizing() {
            info!(%namespace, %name, "backup is finalizing, releasing snapshot");
            self.finalize(&snapshot, backup).await?;
            return Ok(BackupItemOutput::passthrough(item));
        }

        let clients = &self.ctx.clients;
        let ongoing = labels::has_backup_label(&snapshot.metadata, backup.name());
        let mode = if ongoing {
            WaitMode::Await {
                timeout: self
                    .ctx
                    .config
                    .snapshot_timeout_for(backup.spec.csi_snapshot_timeout.as_deref()),
            }
        } else {
            WaitMode::Observe
        };

        let content = match bound_content(clients, self.ctx.config.poll_interval, &snapshot, mode).await {
            Ok(content) => content,
            Err(e) => {
                // Only snapshots this backup created are ours to remove.
                if ongoing {
                    cleanup_volume_snapshot(clients, &snapshot).await;
                }
                return Err(e);
            }
        };

        let mut output = BackupItemOutput::passthrough(Value::Null);
        if let Some(class) = snapshot.spec.volume_snapshot_class_name.as_deref() {
            output.additional_items.push(ResourceIdentifier::cluster(
                GroupResource::VOLUME_SNAPSHOT_CLASSES,
                class,
            ));
        }

        let mut annotations = BTreeMap::new();
        let content_name = content.as_ref().and_then(|c| c.metadata.name.clone());
        if let Some(content) = &content {
            let content_name = content.metadata.name.as_deref().unwrap_or_default();
            if ongoing {
                label_content_for_backup(clients, content_name, backup.name()).await;
            }
            let propagation = propagate(content);
            annotations = propagation.facts.to_annotations();
            output.additional_items.push(ResourceIdentifier::cluster(
                GroupResource::VOLUME_SNAPSHOT_CONTENTS,
                content_name,
            ));
            output.additional_items.extend(propagation.secret);
        } else {
            debug!(%namespace, %name, "snapshot not reconciled, backing up without content");
        }
        annotations.insert(
            labels::MUST_INCLUDE_ADDITIONAL_ITEMS.to_owned(),
            "true".to_owned(),
        );

        let patch = json!({"metadata": {"annotations": annotations}});
        clients
            .snapshots
            .patch(&namespace, &name, &patch)
            .await
            .inspect_err(|e| warn!(%namespace, %name, error = %e, "failed to annotate live snapshot"))?;
        snapshot
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(annotations);

        if ongoing {
            let id = OperationId::snapshot_started_now(&namespace, &name);
            output.operation_id = Some(id.to_string());
            output.items_to_update.push(ResourceIdentifier::new(
                GroupResource::VOLUME_SNAPSHOTS,
                &namespace,
                &name,
            ));
            if let Some(content_name) = &content_name {
                output.items_to_update.push(ResourceIdentifier::cluster(
                    GroupResource::VOLUME_SNAPSHOT_CONTENTS,
                    content_name,
                ));
            }
        }

        output.item = to_item(KIND, &snapshot)?;
        Ok(output)
    }

    /// Ready content completes the operation, a content error fails it.
    /// Errors reported on the snapshot itself may still clear and leave the
    /// operation pending.
    async fn progress(
        &self,
        operation_id: &str,
        _backup: &Backup,
    ) -> Result<OperationProgress, SnapshotError> {
        require_operation_id(operation_id)?;
        let OperationId::Snapshot {
            namespace,
            name,
            started,
        } = OperationId::parse_snapshot(operation_id)?
        else {
            return Err(SnapshotError::operation_id(operation_id, "not a snapshot operation"));
        };

        let mut progress = OperationProgress {
            started: Some(started),
            ..Default::default()
        };

        let snapshot = self.ctx.clients.snapshots.get(&namespace, &name).await?;
        let Some(status) = snapshot.status.as_ref() else {
            return Ok(progress);
        };
        if let Some(error) = &status.error {
            warn!(%namespace, %name, message = ?error.message, "snapshot reports an error, still waiting");
            return Ok(progress);
        }
        let Some(content_name) = snapshot.bound_content_name() else {
            return Ok(progress);
        };

        let content = self.ctx.clients.contents.get("", content_name).await?;
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

    /// Snapshot creation cannot be interrupted.
    async fn cancel(&self, _operation_id: &str, _backup: &Backup) -> Result<(), SnapshotError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::memory::Verb;
    use crate::testutil::{Fixture, bind_snapshot, snapshot_for_claim};
    use crate::types::snapshot::SnapshotErrorStatus;
    use crate::types::{BackupPhase, DeletionPolicy, velero::BackupStatus};

    fn action(fx: &Fixture) -> SnapshotBackupper {
        SnapshotBackupper::new(fx.ctx.clone())
    }

    async fn labelled_snapshot(fx: &Fixture) -> VolumeSnapshot {
        let mut vs = snapshot_for_claim("apps", "data");
        vs.spec.volume_snapshot_class_name = Some("csi-hostpath".into());
        labels::add_labels(&mut vs.metadata, [(labels::BACKUP_NAME, fx.backup().name().to_owned())]);
        fx.create_snapshot(vs).await
    }

    #[tokio::test]
    async fn ongoing_backup_captures_facts_and_returns_operation() {
        let fx = Fixture::new();
        let vs = labelled_snapshot(&fx).await;
        let vs = bind_snapshot(&fx.store, &vs, Some("handle-1"), Some(5 << 30));
        let content_name = vs.bound_content_name().unwrap().to_owned();
        fx.store.contents.modify("", &content_name, |c| {
            labels::add_annotations(
                &mut c.metadata,
                [
                    (labels::SNAPSHOTTER_SECRET_NAME, "creds".to_owned()),
                    (labels::SNAPSHOTTER_SECRET_NAMESPACE, "kube-system".to_owned()),
                ],
            );
        });
        let backup = fx.backup();

        let out = action(&fx)
            .execute(serde_json::to_value(&vs).unwrap(), &backup)
            .await
            .unwrap();

        let returned: VolumeSnapshot = serde_json::from_value(out.item).unwrap();
        let facts = labels::SnapshotFacts::from_annotations(&returned.metadata);
        assert_eq!(facts.handle.as_deref(), Some("handle-1"));
        assert_eq!(facts.restore_size.as_deref(), Some("5Gi"));
        assert_eq!(facts.deletion_policy.as_deref(), Some("Delete"));
        assert_eq!(facts.delete_secret.unwrap().name, "creds");
        assert_eq!(
            labels::annotation(&returned.metadata, labels::MUST_INCLUDE_ADDITIONAL_ITEMS),
            Some("true")
        );

        let live = fx.store.snapshots.peek("apps", vs.metadata.name.as_deref().unwrap()).unwrap();
        assert_eq!(
            labels::annotation(&live.metadata, labels::SNAPSHOT_HANDLE),
            Some("handle-1")
        );

        let content = fx.store.contents.peek("", &content_name).unwrap();
        assert!(labels::has_backup_label(&content.metadata, backup.name()));

        assert_eq!(
            out.additional_items,
            vec![
                ResourceIdentifier::cluster(GroupResource::VOLUME_SNAPSHOT_CLASSES, "csi-hostpath"),
                ResourceIdentifier::cluster(GroupResource::VOLUME_SNAPSHOT_CONTENTS, &content_name),
                ResourceIdentifier::new(GroupResource::SECRETS, "kube-system", "creds"),
            ]
        );
        let id = OperationId::parse_snapshot(out.operation_id.as_deref().unwrap()).unwrap();
        assert!(matches!(id, OperationId::Snapshot { ref namespace, .. } if namespace == "apps"));
        assert_eq!(out.items_to_update.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_snapshot_is_observed_without_waiting() {
        let fx = Fixture::new();
        let vs = fx.create_snapshot(snapshot_for_claim("apps", "data")).await;
        let start = tokio::time::Instant::now();
        let out = action(&fx)
            .execute(serde_json::to_value(&vs).unwrap(), &fx.backup())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(out.operation_id, None);
        assert!(out.additional_items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_failure_cleans_up_snapshot() {
        let fx = Fixture::new();
        let vs = labelled_snapshot(&fx).await;
        let mut backup = fx.backup();
        backup.spec.csi_snapshot_timeout = Some("30s".into());

        let err = action(&fx)
            .execute(serde_json::to_value(&vs).unwrap(), &backup)
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::ReconcileTimeout { .. }));
        assert!(fx.store.snapshots.all().is_empty());
    }

    #[tokio::test]
    async fn foreign_snapshot_survives_lookup_failure() {
        let fx = Fixture::new();
        let vs = fx.create_snapshot(snapshot_for_claim("apps", "data")).await;
        let vs = bind_snapshot(&fx.store, &vs, Some("handle-1"), None);
        let content_name = vs.bound_content_name().unwrap().to_owned();
        fx.store.contents.modify("", &content_name, |c| {
            c.spec.deletion_policy = DeletionPolicy::Retain;
        });
        fx.store.contents.fail(Verb::Get, "etcd timeout");

        let err = action(&fx)
            .execute(serde_json::to_value(&vs).unwrap(), &fx.backup())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Client(_)));

        assert_eq!(fx.store.snapshots.all().len(), 1);
        assert_eq!(
            fx.store.contents.peek("", &content_name).unwrap().spec.deletion_policy,
            DeletionPolicy::Retain
        );
        assert!(fx.store.journal.filter("VolumeSnapshot", Verb::Delete).is_empty());
    }

    #[tokio::test]
    async fn live_annotation_failure_is_returned() {
        let fx = Fixture::new();
        let vs = labelled_snapshot(&fx).await;
        let vs = bind_snapshot(&fx.store, &vs, Some("handle-1"), None);
        fx.store.snapshots.fail(Verb::Patch, "conflict");
        let err = action(&fx)
            .execute(serde_json::to_value(&vs).unwrap(), &fx.backup())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Client(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn finalizing_detaches_content() {
        let fx = Fixture::new();
        let vs = labelled_snapshot(&fx).await;
        let vs = bind_snapshot(&fx.store, &vs, Some("handle-1"), None);
        let content_name = vs.bound_content_name().unwrap().to_owned();
        let mut backup = fx.backup();
        backup.status = Some(BackupStatus {
            phase: Some(BackupPhase::Finalizing),
        });

        let item = serde_json::to_value(&vs).unwrap();
        let out = action(&fx).execute(item.clone(), &backup).await.unwrap();
        assert_eq!(out, BackupItemOutput::passthrough(item));

        assert!(fx.store.snapshots.all().is_empty());
        let recreated = fx.store.contents.peek("", &content_name).unwrap();
        assert_eq!(recreated.spec.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(recreated.spec.source.snapshot_handle.as_deref(), Some("handle-1"));
    }

    #[tokio::test]
    async fn finalizing_removes_unbound_snapshot_it_created() {
        let fx = Fixture::new();
        let ours = labelled_snapshot(&fx).await;
        let foreign = fx.create_snapshot(snapshot_for_claim("apps", "other")).await;
        let mut backup = fx.backup();
        backup.status = Some(BackupStatus {
            phase: Some(BackupPhase::Finalizing),
        });

        for vs in [&ours, &foreign] {
            action(&fx)
                .execute(serde_json::to_value(vs).unwrap(), &backup)
                .await
                .unwrap();
        }

        let left = fx.store.snapshots.all();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].metadata.name, foreign.metadata.name);
    }

    #[tokio::test]
    async fn progress_follows_content_state() {
        let fx = Fixture::new();
        let a = action(&fx);
        let backup = fx.backup();
        let vs = labelled_snapshot(&fx).await;
        let ns = "apps";
        let name = vs.metadata.name.clone().unwrap();
        let id = OperationId::snapshot_started_now(ns, &name).to_string();

        let p = a.progress(&id, &backup).await.unwrap();
        assert!(!p.completed);
        assert!(p.started.is_some());

        fx.store.snapshots.modify(ns, &name, |s| {
            s.status.get_or_insert_with(Default::default).error = Some(SnapshotErrorStatus {
                time: None,
                message: Some("transient".into()),
            });
        });
        let p = a.progress(&id, &backup).await.unwrap();
        assert!(!p.completed && p.err.is_none());

        fx.store.snapshots.modify(ns, &name, |s| s.status = None);
        let vs = bind_snapshot(&fx.store, &vs, Some("handle-1"), None);
        let p = a.progress(&id, &backup).await.unwrap();
        assert!(p.completed);
        assert_eq!(p.err, None);

        let content_name = vs.bound_content_name().unwrap().to_owned();
        fx.store.contents.modify("", &content_name, |c| {
            let status = c.status.get_or_insert_with(Default::default);
            status.ready_to_use = Some(false);
            status.error = Some(SnapshotErrorStatus {
                time: None,
                message: Some("driver failure".into()),
            });
        });
        let p = a.progress(&id, &backup).await.unwrap();
        assert!(p.completed);
        assert_eq!(p.err.as_deref(), Some("driver failure"));
    }

    #[tokio::test]
    async fn progress_rejects_malformed_ids() {
        let fx = Fixture::new();
        for bad in ["", "apps/vs", "apps/vs/x/2024-03-01T00:00:00Z"] {
            let err = action(&fx).progress(bad, &fx.backup()).await.unwrap_err();
            assert!(matches!(err, SnapshotError::InvalidOperationId { .. }));
        }
    }
}
