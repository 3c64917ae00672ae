//! Capturing content facts on the snapshot.
//!
//! The backup artifact holds each object on its own. Everything restore needs
//! to statically recreate the content (driver, handle, size, policy, delete
//! secret) is therefore copied onto the snapshot as annotations.

use serde_json::json;
use tracing::{info, warn};

use crate::action::ResourceIdentifier;
use crate::client::Clients;
use crate::labels::{self, SecretRef, SnapshotFacts};
use crate::quantity::format_binary_si;
use crate::types::VolumeSnapshotContent;

/// Result of [`propagate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Propagation {
    /// Facts to annotate the snapshot with.
    pub facts: SnapshotFacts,
    /// The delete secret, to be backed up alongside the snapshot.
    pub secret: Option<ResourceIdentifier>,
}

/// Derive the snapshot annotations from its bound content.
///
/// Only facts the content actually carries are produced, so applying the
/// result twice is the same as applying it once. The driver is only
/// recorded together with a handle.
pub fn propagate(content: &VolumeSnapshotContent) -> Propagation {
    let status = content.status.as_ref();
    let handle = content.snapshot_handle().map(str::to_owned);
    let delete_secret = SecretRef::from_annotations(
        &content.metadata,
        labels::SNAPSHOTTER_SECRET_NAME,
        labels::SNAPSHOTTER_SECRET_NAMESPACE,
    );

    let secret = delete_secret.as_ref().map(ResourceIdentifier::secret);
    let facts = SnapshotFacts {
        driver: handle
            .as_ref()
            .map(|_| content.spec.driver.clone())
            .filter(|d| !d.is_empty()),
        handle,
        deletion_policy: Some(content.spec.deletion_policy.to_string()),
        restore_size: status
            .and_then(|s| s.restore_size)
            .map(format_binary_si),
        delete_secret,
    };

    Propagation { facts, secret }
}

/// Label a content dynamically created for `backup_name`, so that backup
/// deletion can find it by label. Failures are logged only.
pub async fn label_content_for_backup(clients: &Clients, content_name: &str, backup_name: &str) {
    let patch = json!({
        "metadata": {"labels": {(labels::BACKUP_NAME): labels::valid_name(backup_name)}}
    });
    match clients.contents.patch("", content_name, &patch).await {
        Ok(_) => info!(content = %content_name, backup = %backup_name, "labelled content with backup name"),
        Err(e) => warn!(content = %content_name, error = %e, "failed to label content with backup name"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::action::GroupResource;
    use crate::testutil::{DRIVER, content_with_handle};

    #[test]
    fn captures_driver_handle_policy_and_size() {
        let content = content_with_handle("snapcontent-1", Some("handle-1"), Some(10 << 30));
        let p = propagate(&content);
        assert_eq!(p.facts.driver.as_deref(), Some(DRIVER));
        assert_eq!(p.facts.handle.as_deref(), Some("handle-1"));
        assert_eq!(p.facts.deletion_policy.as_deref(), Some("Delete"));
        assert_eq!(p.facts.restore_size.as_deref(), Some("10Gi"));
        assert_eq!(p.secret, None);
    }

    #[test]
    fn delete_secret_becomes_additional_item() {
        let mut content = content_with_handle("snapcontent-1", Some("handle-1"), None);
        content.metadata.annotations = Some(BTreeMap::from([
            (labels::SNAPSHOTTER_SECRET_NAME.to_owned(), "creds".to_owned()),
            (labels::SNAPSHOTTER_SECRET_NAMESPACE.to_owned(), "kube-system".to_owned()),
        ]));
        let p = propagate(&content);
        let secret = p.secret.unwrap();
        assert_eq!(secret.group_resource, GroupResource::SECRETS);
        assert_eq!((secret.namespace.as_str(), secret.name.as_str()), ("kube-system", "creds"));
        let annotations = p.facts.to_annotations();
        assert_eq!(annotations.get(labels::DELETE_SECRET_NAME).map(String::as_str), Some("creds"));
        assert_eq!(p.facts.restore_size, None);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let content = content_with_handle("snapcontent-1", Some("handle-1"), Some(3 << 20));
        let facts = propagate(&content).facts;

        let mut once = ObjectMeta::default();
        facts.apply(&mut once);
        let mut twice = ObjectMeta::default();
        facts.apply(&mut twice);
        propagate(&content).facts.apply(&mut twice);
        assert_eq!(once.annotations, twice.annotations);
    }

    #[tokio::test]
    async fn labels_content_with_canonical_backup_name() {
        let fx = crate::testutil::Fixture::new();
        fx.store
            .contents
            .insert(content_with_handle("snapcontent-1", Some("h"), None));
        let long = "b".repeat(70);
        label_content_for_backup(&fx.clients, "snapcontent-1", &long).await;
        let stored = fx.store.contents.peek("", "snapcontent-1").unwrap();
        assert!(labels::has_backup_label(&stored.metadata, &long));

        // Missing content is only logged.
        label_content_for_backup(&fx.clients, "missing", "b").await;
    }
}
