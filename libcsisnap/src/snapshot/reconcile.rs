//! Waiting for a snapshot to be reconciled into handle-bearing content.
//!
//! The external snapshot controller first binds the snapshot to a content
//! object and only later does the driver assign a storage handle to that
//! content. Both steps are observed by polling.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::client::Clients;
use crate::error::SnapshotError;
use crate::types::{VolumeSnapshot, VolumeSnapshotContent};
use crate::wait::{PollError, poll_until};

/// Whether the caller expects reconciliation to happen now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Report what exists without blocking. An unreconciled snapshot yields
    /// `None`; it may be picked up on a later attempt.
    Observe,
    /// The caller created the snapshot and needs its handle: poll until the
    /// handle appears, the content fails, or `timeout` elapses.
    Await { timeout: Duration },
}

/// Resolve the content bound to `snapshot`.
#[instrument(skip_all, fields(namespace = ?snapshot.metadata.namespace, name = ?snapshot.metadata.name, mode = ?mode))]
pub async fn bound_content(
    clients: &Clients,
    poll_interval: Duration,
    snapshot: &VolumeSnapshot,
    mode: WaitMode,
) -> Result<Option<VolumeSnapshotContent>, SnapshotError> {
    let namespace = snapshot.metadata.namespace.clone().unwrap_or_default();
    let name = snapshot.metadata.name.clone().unwrap_or_default();

    let timeout = match mode {
        WaitMode::Observe => {
            let Some(content_name) = snapshot.bound_content_name() else {
                debug!("snapshot not reconciled yet, not waiting");
                return Ok(None);
            };
            let content = clients.contents.get("", content_name).await?;
            return Ok(Some(content));
        }
        WaitMode::Await { timeout } => timeout,
    };

    let result = poll_until(poll_interval, timeout, || {
        check_once(clients, &namespace, &name)
    })
    .await;

    match result {
        Ok(content) => Ok(Some(content)),
        Err(PollError::Failed(e)) => {
            warn!(%namespace, %name, error = %e, "snapshot reconciliation failed");
            Err(e)
        }
        Err(PollError::TimedOut) => {
            warn!(%namespace, %name, ?timeout, "timed out awaiting snapshot reconciliation");
            Err(SnapshotError::ReconcileTimeout {
                namespace,
                name,
                timeout,
            })
        }
    }
}

/// One poll: re-read the snapshot, then its content.
async fn check_once(
    clients: &Clients,
    namespace: &str,
    name: &str,
) -> Result<Option<VolumeSnapshotContent>, SnapshotError> {
    // The binding is only visible on a fresh read of the snapshot.
    let current = clients.snapshots.get(namespace, name).await?;
    let Some(content_name) = current.bound_content_name() else {
        info!(%namespace, %name, "waiting for snapshot to be bound to content");
        return Ok(None);
    };
    let content = clients.contents.get("", content_name).await?;
    if let Some(message) = content.error_message() {
        return Err(SnapshotError::ContentFailed {
            name: content_name.to_owned(),
            message,
        });
    }
    if content.snapshot_handle().is_none() {
        info!(content = %content_name, "waiting for content to receive a snapshot handle");
        return Ok(None);
    }
    Ok(Some(content))
}
