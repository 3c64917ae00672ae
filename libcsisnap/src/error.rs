//! Error types.
//!
//! Two layers are distinguished: [`ClientError`] is what the object facade
//! returns for a single API call, and [`SnapshotError`] is what an item action
//! surfaces to the orchestrator. Cleanup paths inspect a [`ClientError`] with
//! [`ClientError::is_not_found`] / [`ClientError::is_already_exists`] so that
//! benign races do not abort the surrounding work.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single object API call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The named object does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object kind, e.g. `VolumeSnapshot`.
        kind: String,
        /// Object name, namespace-qualified when namespaced.
        name: String,
    },

    /// An object with this name already exists.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// Any other API server or transport failure.
    #[error("api error: {0}")]
    Api(String),

    /// The object could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Create a [`ClientError::Api`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn api<E: std::fmt::Display>(e: E) -> Self {
        Self::Api(e.to_string())
    }

    /// Create a [`ClientError::Serialization`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    /// The object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// An object of that name exists already.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Unified error type for snapshot coordination.
#[derive(Debug, Error)]
pub enum SnapshotError {
    // ----- Configuration ----------------------------------------------------
    /// The claim has no bound volume, so the provisioner is unknown.
    #[error("claim {namespace}/{name} is not bound to a volume: {reason}")]
    ClaimNotBound {
        namespace: String,
        name: String,
        reason: String,
    },

    /// The claim names no storage class.
    #[error("claim {namespace}/{name} has no storage class")]
    MissingStorageClass { namespace: String, name: String },

    /// No usable volume snapshot class for the driver.
    #[error("no volume snapshot class for driver {driver}: {reason}")]
    NoSnapshotClass { driver: String, reason: String },

    /// A side-channel annotation required for restore is absent.
    #[error("{kind} {name} is missing annotation {key}")]
    MissingAnnotation {
        kind: &'static str,
        name: String,
        key: &'static str,
    },

    // ----- Reconciliation ---------------------------------------------------
    /// The snapshot was not bound to a handle-bearing content in time.
    #[error("timed out after {timeout:?} waiting for volume snapshot {namespace}/{name} to be ready")]
    ReconcileTimeout {
        namespace: String,
        name: String,
        timeout: Duration,
    },

    /// The bound content reported a terminal error.
    #[error("volume snapshot content {name} failed: {message}")]
    ContentFailed { name: String, message: String },

    // ----- Ambiguity --------------------------------------------------------
    /// No request object carries the operation ID.
    #[error("no {kind} found for operation {operation_id}")]
    OperationNotFound {
        kind: &'static str,
        operation_id: String,
    },

    /// More than one request object carries the operation ID.
    #[error("{count} {kind} objects found for operation {operation_id}")]
    AmbiguousOperation {
        kind: &'static str,
        operation_id: String,
        count: usize,
    },

    /// No data upload result record for the claim.
    #[error("no data upload result found with selector {selector}")]
    DataUploadResultNotFound { selector: String },

    /// Several data upload result records for the claim.
    #[error("{count} data upload results found with selector {selector}")]
    AmbiguousDataUploadResult { selector: String, count: usize },

    // ----- Parsing ----------------------------------------------------------
    #[error("invalid operation id {id:?}: {reason}")]
    InvalidOperationId { id: String, reason: String },

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("invalid duration in {key}: {reason}")]
    InvalidDuration { key: String, reason: String },

    /// An item handed over by the orchestrator could not be decoded.
    #[error("malformed {kind} item: {reason}")]
    InvalidItem { kind: &'static str, reason: String },

    // ----- Passthrough ------------------------------------------------------
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SnapshotError {
    /// Create a [`SnapshotError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`SnapshotError::InvalidItem`] for an item of `kind`.
    pub fn item<E: std::fmt::Display>(kind: &'static str, e: E) -> Self {
        Self::InvalidItem {
            kind,
            reason: e.to_string(),
        }
    }

    /// Create a [`SnapshotError::InvalidOperationId`].
    pub fn operation_id(id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOperationId {
            id: id.to_owned(),
            reason: reason.into(),
        }
    }

    /// True if the underlying cause is a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Client(e) if e.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ClientError::NotFound {
            kind: "VolumeSnapshot".into(),
            name: "ns/vs-1".into(),
        };
        assert_eq!(err.to_string(), "VolumeSnapshot ns/vs-1 not found");
    }

    #[test]
    fn timeout_and_content_failure_are_distinguishable() {
        let timeout = SnapshotError::ReconcileTimeout {
            namespace: "apps".into(),
            name: "velero-data-abcde".into(),
            timeout: Duration::from_secs(600),
        };
        let failed = SnapshotError::ContentFailed {
            name: "snapcontent-1".into(),
            message: "driver refused".into(),
        };
        assert!(timeout.to_string().starts_with("timed out"));
        assert!(failed.to_string().contains("driver refused"));
        assert!(!matches!(failed, SnapshotError::ReconcileTimeout { .. }));
    }

    #[test]
    fn not_found_passes_through_conversion() {
        let err: SnapshotError = ClientError::NotFound {
            kind: "DataUpload".into(),
            name: "velero/b-1".into(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!SnapshotError::internal("boom").is_not_found());
    }
}
