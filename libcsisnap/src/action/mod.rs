//! Item actions invoked by the backup orchestrator.
//!
//! The orchestrator hands every item over as untyped JSON and expects the
//! (possibly rewritten) item back, plus references to related objects it
//! should process too. Actions decode the item into its typed form with
//! [`from_item`] and encode the result with [`to_item`].
//!
//! | Action | Resource | Phase |
//! |---|---|---|
//! | [`backup::ClaimBackupper`] | persistentvolumeclaims | backup |
//! | [`backup::SnapshotBackupper`] | volumesnapshots | backup |
//! | [`backup::ContentBackupper`] | volumesnapshotcontents | backup |
//! | [`backup::ClassBackupper`] | volumesnapshotclasses | backup |
//! | [`restore::ClaimRestorer`] | persistentvolumeclaims | restore |
//! | [`restore::SnapshotRestorer`] | volumesnapshots | restore |
//! | [`restore::ContentRestorer`] | volumesnapshotcontents | restore |
//! | [`restore::ClassRestorer`] | volumesnapshotclasses | restore |
//! | [`delete::SnapshotDeleter`] | volumesnapshots | backup deletion |
//! | [`delete::ContentDeleter`] | volumesnapshotcontents | backup deletion |

pub mod backup;
pub mod delete;
pub mod restore;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SnapshotError;
use crate::labels::SecretRef;
use crate::operation::OperationProgress;
use crate::types::{Backup, Restore};

// ---------------------------------------------------------------------------
// Resource identity
// ---------------------------------------------------------------------------

/// API group and plural resource name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GroupResource {
    /// API group. Empty for the core group.
    pub group: &'static str,
    /// Plural resource name, e.g. `volumesnapshots`.
    pub resource: &'static str,
}

impl GroupResource {
    /// Core secrets, returned as additional items for snapshot credentials.
    pub const SECRETS: Self = Self::core("secrets");
    pub const PERSISTENT_VOLUME_CLAIMS: Self = Self::core("persistentvolumeclaims");
    /// `snapshot.storage.k8s.io` kinds.
    pub const VOLUME_SNAPSHOTS: Self = Self::snapshot("volumesnapshots");
    pub const VOLUME_SNAPSHOT_CONTENTS: Self = Self::snapshot("volumesnapshotcontents");
    pub const VOLUME_SNAPSHOT_CLASSES: Self = Self::snapshot("volumesnapshotclasses");
    /// `velero.io` upload requests, reported for items to update.
    pub const DATA_UPLOADS: Self = Self::velero("datauploads");

    const fn core(resource: &'static str) -> Self {
        Self { group: "", resource }
    }

    const fn snapshot(resource: &'static str) -> Self {
        Self {
            group: crate::types::snapshot::GROUP,
            resource,
        }
    }

    const fn velero(resource: &'static str) -> Self {
        Self {
            group: crate::types::velero::GROUP,
            resource,
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// A concrete object the orchestrator should also back up or wait on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    /// Kind of the object.
    pub group_resource: GroupResource,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ResourceIdentifier {
    /// A namespaced object.
    pub fn new(group_resource: GroupResource, namespace: &str, name: &str) -> Self {
        Self {
            group_resource,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    /// A cluster-scoped object.
    pub fn cluster(group_resource: GroupResource, name: &str) -> Self {
        Self::new(group_resource, "", name)
    }

    /// The secret a [`SecretRef`] points at.
    pub fn secret(secret: &SecretRef) -> Self {
        Self::new(GroupResource::SECRETS, &secret.namespace, &secret.name)
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.group_resource, self.name)
        } else {
            write!(f, "{} {}/{}", self.group_resource, self.namespace, self.name)
        }
    }
}

/// Which items an action wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSelector {
    /// Plural resource names. Empty means every resource.
    pub included_resources: Vec<String>,
}

impl ResourceSelector {
    /// Select a single resource.
    pub fn resource(group_resource: GroupResource) -> Self {
        Self {
            included_resources: vec![group_resource.resource.to_owned()],
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Result of a backup item action.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupItemOutput {
    /// The item to store in the backup.
    pub item: Value,
    /// Related objects the orchestrator should back up as well.
    pub additional_items: Vec<ResourceIdentifier>,
    /// Set when the action started work the orchestrator must poll.
    pub operation_id: Option<String>,
    /// Items to back up again once the operation completes.
    pub items_to_update: Vec<ResourceIdentifier>,
}

impl BackupItemOutput {
    /// Return `item` untouched.
    pub fn passthrough(item: Value) -> Self {
        Self {
            item,
            additional_items: Vec::new(),
            operation_id: None,
            items_to_update: Vec::new(),
        }
    }
}

/// Arguments of a restore item action.
#[derive(Debug, Clone)]
pub struct RestoreItemInput {
    /// The item as it is about to be created, after earlier actions ran.
    pub item: Value,
    /// The item exactly as it was stored in the backup.
    pub item_from_backup: Value,
    /// The restore being run.
    pub restore: Restore,
}

/// Result of a restore item action.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreItemOutput {
    /// The item to create.
    pub item: Value,
    /// Objects to restore before this one.
    pub additional_items: Vec<ResourceIdentifier>,
    /// Set when the action started work the orchestrator must poll.
    pub operation_id: Option<String>,
    /// Do not create the item.
    pub skip_restore: bool,
}

impl RestoreItemOutput {
    /// Restore `item` untouched.
    pub fn passthrough(item: Value) -> Self {
        Self {
            item,
            additional_items: Vec::new(),
            operation_id: None,
            skip_restore: false,
        }
    }

    /// Leave `item` out of the restore.
    pub fn skip(item: Value) -> Self {
        Self {
            skip_restore: true,
            ..Self::passthrough(item)
        }
    }
}

/// Arguments of a delete item action.
#[derive(Debug, Clone)]
pub struct DeleteItemInput {
    /// The item as stored in the backup being deleted.
    pub item: Value,
    /// The backup being deleted.
    pub backup: Backup,
}

// ---------------------------------------------------------------------------
// Action traits
// ---------------------------------------------------------------------------

/// Runs on every selected item while a backup is taken.
#[async_trait]
pub trait BackupItemAction: Send + Sync {
    /// Registration name.
    fn name(&self) -> &'static str;

    /// Items the action is called for.
    fn applies_to(&self) -> ResourceSelector;

    /// Process one item of `backup`.
    async fn execute(&self, item: Value, backup: &Backup) -> Result<BackupItemOutput, SnapshotError>;

    /// Progress of an operation returned by [`execute`](Self::execute).
    async fn progress(
        &self,
        operation_id: &str,
        _backup: &Backup,
    ) -> Result<OperationProgress, SnapshotError> {
        Err(SnapshotError::operation_id(operation_id, "action starts no operations"))
    }

    /// Stop an operation that is still running. A no-op by default.
    async fn cancel(&self, _operation_id: &str, _backup: &Backup) -> Result<(), SnapshotError> {
        Ok(())
    }
}

/// Runs on every selected item before it is restored.
#[async_trait]
pub trait RestoreItemAction: Send + Sync {
    /// Registration name.
    fn name(&self) -> &'static str;

    /// Items the action is called for.
    fn applies_to(&self) -> ResourceSelector;

    /// Rewrite one item, or ask for it to be skipped.
    async fn execute(&self, input: RestoreItemInput) -> Result<RestoreItemOutput, SnapshotError>;

    async fn progress(
        &self,
        operation_id: &str,
        _restore: &Restore,
    ) -> Result<OperationProgress, SnapshotError> {
        Err(SnapshotError::operation_id(operation_id, "action starts no operations"))
    }

    async fn cancel(&self, _operation_id: &str, _restore: &Restore) -> Result<(), SnapshotError> {
        Ok(())
    }

    /// Whether the additional items returned earlier are ready for use.
    async fn are_additional_items_ready(
        &self,
        _items: &[ResourceIdentifier],
        _restore: &Restore,
    ) -> Result<bool, SnapshotError> {
        Ok(true)
    }
}

/// Runs on every selected item of a backup that is being deleted.
#[async_trait]
pub trait DeleteItemAction: Send + Sync {
    /// Registration name.
    fn name(&self) -> &'static str;

    /// Items the action is called for.
    fn applies_to(&self) -> ResourceSelector;

    /// Release whatever the item holds outside the backup.
    async fn execute(&self, input: DeleteItemInput) -> Result<(), SnapshotError>;
}

// ---------------------------------------------------------------------------
// Item conversion
// ---------------------------------------------------------------------------

/// Decode an untyped item as `K`.
pub fn from_item<K: DeserializeOwned>(kind: &'static str, item: &Value) -> Result<K, SnapshotError> {
    serde_json::from_value(item.clone()).map_err(|e| SnapshotError::item(kind, e))
}

/// Encode `object` as an untyped item.
pub fn to_item<K: Serialize>(kind: &'static str, object: &K) -> Result<Value, SnapshotError> {
    serde_json::to_value(object).map_err(|e| SnapshotError::item(kind, e))
}

/// Require a non-empty operation ID.
pub(crate) fn require_operation_id(operation_id: &str) -> Result<(), SnapshotError> {
    if operation_id.is_empty() {
        return Err(SnapshotError::operation_id(operation_id, "empty operation id"));
    }
    Ok(())
}
