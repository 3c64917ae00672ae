//! Deletion policy handling for transient snapshots.
//!
//! Deleting a snapshot whose content has policy `Delete` cascades to the
//! storage-side snapshot. The procedures here control that cascade:
//!
//! * [`cleanup_volume_snapshot`] wants the cascade (failed or abandoned
//!   snapshot): content policy goes to `Delete` first, then the snapshot is
//!   deleted.
//! * [`detach_content`] must keep the storage snapshot alive after the
//!   snapshot object is gone: policy goes to `Retain`, the snapshot and its
//!   content are deleted, and the content is recreated statically so that
//!   backup deletion can remove it later.
//! * [`rebind_static`] is the restore-time transform of a backed-up content
//!   into a statically sourced one.
//!
//! All cluster-side procedures are best effort. Failures are logged and never
//! propagated.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::client::Clients;
use crate::types::{
    DeletionPolicy, VolumeSnapshot, VolumeSnapshotContent, VolumeSnapshotContentSource,
};
use crate::wait::{PollError, poll_until};

fn policy_patch(policy: DeletionPolicy) -> serde_json::Value {
    json!({"spec": {"deletionPolicy": policy.as_str()}})
}

/// Set the deletion policy of a content with a merge patch.
pub async fn set_deletion_policy(
    clients: &Clients,
    content_name: &str,
    policy: DeletionPolicy,
) -> Result<VolumeSnapshotContent, crate::error::ClientError> {
    clients
        .contents
        .patch("", content_name, &policy_patch(policy))
        .await
}

/// Delete a snapshot together with its storage-side data.
///
/// The snapshot is re-read first because the copy at hand may predate its
/// binding.
#[instrument(skip_all, fields(namespace = ?snapshot.metadata.namespace, name = ?snapshot.metadata.name))]
pub async fn cleanup_volume_snapshot(clients: &Clients, snapshot: &VolumeSnapshot) {
    let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();
    let Some(name) = snapshot.metadata.name.as_deref() else {
        return;
    };

    let current = match clients.snapshots.get(namespace, name).await {
        Ok(vs) => vs,
        Err(e) if e.is_not_found() => {
            debug!("snapshot already gone");
            return;
        }
        Err(e) => {
            warn!(error = %e, "failed to re-read snapshot before cleanup, using stale copy");
            snapshot.clone()
        }
    };

    if let Some(content_name) = current.bound_content_name() {
        if let Err(e) = set_deletion_policy(clients, content_name, DeletionPolicy::Delete).await {
            warn!(content = %content_name, error = %e, "failed to set content deletion policy to Delete");
        }
    }

    match clients.snapshots.delete(namespace, name).await {
        Ok(()) => info!("deleted volume snapshot"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(error = %e, "failed to delete volume snapshot"),
    }
}

/// Remove `snapshot` while keeping the storage-side snapshot referenced by
/// `content`, recreating the content as a static, unbound object.
///
/// The content's policy is set to `Retain` before the snapshot is deleted,
/// so the cascade cannot remove the storage-side snapshot. The recreate is
/// only issued once the old content is no longer fetchable.
#[instrument(skip_all, fields(snapshot = ?snapshot.metadata.name, content = ?content.metadata.name))]
pub async fn detach_content(
    clients: &Clients,
    snapshot: &VolumeSnapshot,
    content: &VolumeSnapshotContent,
    poll_interval: Duration,
    timeout: Duration,
) {
    let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();
    let snapshot_name = snapshot.metadata.name.as_deref().unwrap_or_default();
    let content_name = content.metadata.name.as_deref().unwrap_or_default();

    let relink = snapshot.bound_content_name().is_some()
        && content.spec.deletion_policy == DeletionPolicy::Delete;

    if relink {
        if let Err(e) = set_deletion_policy(clients, content_name, DeletionPolicy::Retain).await {
            warn!(error = %e, "failed to set content deletion policy to Retain, leaving snapshot in place");
            return;
        }
    }

    match clients.snapshots.delete(namespace, snapshot_name).await {
        Ok(()) => debug!("deleted volume snapshot"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(error = %e, "failed to delete volume snapshot"),
    }

    if !relink {
        return;
    }

    let Some(recreated) = recreate_template(content) else {
        warn!("content has no snapshot handle, cannot recreate it");
        return;
    };

    if let Err(e) = clients.contents.delete("", content_name).await {
        if !e.is_not_found() {
            warn!(error = %e, "failed to delete content");
            return;
        }
    }

    let gone = poll_until(poll_interval, timeout, || async {
        match clients.contents.get("", content_name).await {
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(Some(())),
            Err(e) => Err(e),
        }
    })
    .await;
    match gone {
        Ok(()) => {}
        Err(PollError::TimedOut) => {
            warn!(?timeout, "content still present, giving up on recreate");
            return;
        }
        Err(PollError::Failed(e)) => {
            warn!(error = %e, "failed to check content deletion");
            return;
        }
    }

    match clients.contents.create("", &recreated).await {
        Ok(_) => info!("recreated content with static source"),
        Err(e) => warn!(error = %e, "failed to recreate content"),
    }
}

/// A fresh copy of `content` sourced from its own handle. The snapshot
/// reference points at a name no snapshot will ever have, leaving the content
/// unbound, and the policy stays `Delete` so that removing the content
/// removes the storage-side snapshot.
fn recreate_template(content: &VolumeSnapshotContent) -> Option<VolumeSnapshotContent> {
    let handle = content.snapshot_handle()?.to_owned();
    let uid = content.metadata.uid.clone().unwrap_or_default();

    let mut spec = content.spec.clone();
    spec.deletion_policy = DeletionPolicy::Delete;
    spec.source = VolumeSnapshotContentSource {
        volume_handle: None,
        snapshot_handle: Some(handle),
    };
    spec.volume_snapshot_ref.namespace = Some(format!("ns-{uid}"));
    spec.volume_snapshot_ref.name = Some(format!("name-{uid}"));
    spec.volume_snapshot_ref.uid = None;
    spec.volume_snapshot_ref.resource_version = None;

    Some(VolumeSnapshotContent {
        metadata: ObjectMeta {
            name: content.metadata.name.clone(),
            labels: content.metadata.labels.clone(),
            annotations: content.metadata.annotations.clone(),
            ..Default::default()
        },
        spec,
        status: None,
    })
}

/// Convert a backed-up content into a statically bound one using `handle`:
/// `Retain` policy, no volume handle, and a snapshot reference stripped of
/// the fields that identify the original live object.
pub fn rebind_static(content: &mut VolumeSnapshotContent, handle: &str) {
    content.spec.deletion_policy = DeletionPolicy::Retain;
    content.spec.source = VolumeSnapshotContentSource {
        volume_handle: None,
        snapshot_handle: Some(handle.to_owned()),
    };
    content.spec.volume_snapshot_ref.uid = None;
    content.spec.volume_snapshot_ref.resource_version = None;
}
