//! Snapshot restorer.
//!
//! A dynamically provisioned content cannot be converted for static use in
//! place, so each restored snapshot gets a fresh content created from the
//! facts captured at backup time, and the snapshot is rewritten to source
//! from it by name.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use tracing::{debug, info, instrument};

use crate::action::{
    GroupResource, RestoreItemAction, RestoreItemInput, RestoreItemOutput, ResourceSelector,
    from_item, to_item,
};
use crate::error::SnapshotError;
use crate::labels::{self, SnapshotFacts};
use crate::registry::PluginContext;
use crate::types::snapshot::{GROUP, VERSION};
use crate::types::{
    DeletionPolicy, Restore, VolumeSnapshot, VolumeSnapshotContent, VolumeSnapshotContentSource,
    VolumeSnapshotContentSpec, VolumeSnapshotSource,
};

const KIND: &str = "VolumeSnapshot";

/// Recreates a snapshot on top of a static content built from the facts
/// captured at backup time.
pub struct SnapshotRestorer {
    ctx: Arc<PluginContext>,
}

impl SnapshotRestorer {
    /// Registration name.
    pub const NAME: &'static str = "velero.io/csi-volumesnapshot-restorer";

    /// Action using the clients of `ctx`.
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, SnapshotError> {
        match self.ctx.clients.snapshots.get(namespace, name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Statically sourced content for `snapshot`, built from its captured facts.
fn static_content(
    snapshot: &VolumeSnapshot,
    restore: &Restore,
) -> Result<VolumeSnapshotContent, SnapshotError> {
    let name = snapshot.metadata.name.clone().unwrap_or_default();
    let missing = |key| SnapshotError::MissingAnnotation {
        kind: KIND,
        name: name.clone(),
        key,
    };
    let facts = SnapshotFacts::from_annotations(&snapshot.metadata);
    let handle = facts.handle.ok_or_else(|| missing(labels::SNAPSHOT_HANDLE))?;
    let driver = facts.driver.ok_or_else(|| missing(labels::DRIVER_NAME))?;
    let deletion_policy = facts
        .deletion_policy
        .as_deref()
        .and_then(DeletionPolicy::from_name)
        .unwrap_or(DeletionPolicy::Retain);

    let mut content = VolumeSnapshotContent::new(
        "",
        VolumeSnapshotContentSpec {
            volume_snapshot_ref: ObjectReference {
                api_version: Some(format!("{GROUP}/{VERSION}")),
                kind: Some(KIND.to_owned()),
                namespace: snapshot.metadata.namespace.clone(),
                name: Some(name.clone()),
                ..Default::default()
            },
            deletion_policy,
            driver,
            volume_snapshot_class_name: None,
            source: VolumeSnapshotContentSource {
                volume_handle: None,
                snapshot_handle: Some(handle),
            },
        },
    );
    content.metadata.name = None;
    content.metadata.generate_name = Some(format!("{name}-"));
    labels::add_labels(
        &mut content.metadata,
        [(labels::RESTORE_NAME, restore.name().to_owned())],
    );
    if let Some(secret) = facts.delete_secret {
        labels::add_annotations(
            &mut content.metadata,
            secret.to_annotations(
                labels::SNAPSHOTTER_SECRET_NAME,
                labels::SNAPSHOTTER_SECRET_NAMESPACE,
            ),
        );
    }
    Ok(content)
}

#[async_trait]
impl RestoreItemAction for SnapshotRestorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn applies_to(&self) -> ResourceSelector {
        ResourceSelector::resource(GroupResource::VOLUME_SNAPSHOTS)
    }

    #[instrument(skip_all, fields(restore = %input.restore.name()))]
    async fn execute(&self, input: RestoreItemInput) -> Result<RestoreItemOutput, SnapshotError> {
        let restore = &input.restore;
        if !restore.restores_volumes() {
            info!("restore does not restore volumes, skipping snapshot");
            return Ok(RestoreItemOutput::skip(input.item));
        }

        let mut snapshot: VolumeSnapshot = from_item(KIND, &input.item)?;
        if let Some(ns) = snapshot.metadata.namespace.as_deref() {
            let mapped = restore.map_namespace(ns).to_owned();
            snapshot.metadata.namespace = Some(mapped);
        }
        let namespace = snapshot.metadata.namespace.clone().unwrap_or_default();
        let name = snapshot.metadata.name.clone().unwrap_or_default();

        if self.exists(&namespace, &name).await? {
            debug!(%namespace, %name, "snapshot already exists");
            return Ok(RestoreItemOutput::passthrough(to_item(KIND, &snapshot)?));
        }

        let content = static_content(&snapshot, restore)?;
        let created = self.ctx.clients.contents.create("", &content).await?;
        info!(
            %namespace,
            %name,
            content = ?created.metadata.name,
            "created statically bound content"
        );

        snapshot.spec.source = VolumeSnapshotSource {
            persistent_volume_claim_name: None,
            volume_snapshot_content_name: created.metadata.name,
        };
        snapshot.status = None;
        Ok(RestoreItemOutput::passthrough(to_item(KIND, &snapshot)?))
    }
}
