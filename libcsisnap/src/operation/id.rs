//! Async operation identifiers.
//!
//! Identifiers are decoded once at the action boundary into [`OperationId`]
//! and rendered back with [`Display`](std::fmt::Display). Two wire formats
//! exist:
//!
//! * data movement: `du-<backup uid>.<claim uid>` (uploads) and
//!   `dd-<restore uid>.<claim uid>` (downloads), canonicalised into a label
//!   value and matched by label equality only;
//! * snapshot and content operations: `<namespace>/<name>/<RFC3339>` and
//!   `<name>/<RFC3339>`, parsed positionally.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::SnapshotError;
use crate::labels::valid_name;

const UPLOAD_PREFIX: &str = "du-";
const DOWNLOAD_PREFIX: &str = "dd-";

/// Identifier of an asynchronous operation, in the string form the
/// orchestrator stores (see the [`Display`](fmt::Display) impl).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationId {
    /// Upload or download request, looked up by label.
    Transfer(String),
    /// Snapshot taken by the current backup.
    Snapshot {
        namespace: String,
        name: String,
        started: DateTime<Utc>,
    },
    /// Content bound to a snapshot taken by the current backup.
    Content {
        name: String,
        started: DateTime<Utc>,
    },
}

impl OperationId {
    /// `du-<backup uid>.<claim uid>`, canonicalised as a label value.
    pub fn upload(backup_uid: &str, claim_uid: &str) -> Self {
        Self::Transfer(valid_name(&format!("{UPLOAD_PREFIX}{backup_uid}.{claim_uid}")))
    }

    /// `dd-<restore uid>.<claim uid>`, canonicalised as a label value.
    pub fn download(restore_uid: &str, claim_uid: &str) -> Self {
        Self::Transfer(valid_name(&format!("{DOWNLOAD_PREFIX}{restore_uid}.{claim_uid}")))
    }

    /// Snapshot operation started now, truncated to whole seconds.
    pub fn snapshot_started_now(namespace: &str, name: &str) -> Self {
        Self::Snapshot {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            started: now(),
        }
    }

    /// Content operation started now, truncated to whole seconds.
    pub fn content_started_now(name: &str) -> Self {
        Self::Content {
            name: name.to_owned(),
            started: now(),
        }
    }

    /// Decode `<namespace>/<name>/<RFC3339>`.
    pub fn parse_snapshot(id: &str) -> Result<Self, SnapshotError> {
        let parts: Vec<&str> = id.split('/').collect();
        let [namespace, name, started] = parts.as_slice() else {
            return Err(SnapshotError::operation_id(
                id,
                format!("expected 3 '/'-separated parts, got {}", parts.len()),
            ));
        };
        Ok(Self::Snapshot {
            namespace: (*namespace).to_owned(),
            name: (*name).to_owned(),
            started: parse_time(id, started)?,
        })
    }

    /// Decode `<name>/<RFC3339>`.
    pub fn parse_content(id: &str) -> Result<Self, SnapshotError> {
        let parts: Vec<&str> = id.split('/').collect();
        let [name, started] = parts.as_slice() else {
            return Err(SnapshotError::operation_id(
                id,
                format!("expected 2 '/'-separated parts, got {}", parts.len()),
            ));
        };
        Ok(Self::Content {
            name: (*name).to_owned(),
            started: parse_time(id, started)?,
        })
    }

    /// When the operation started, for positional identifiers.
    pub fn started(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Transfer(_) => None,
            Self::Snapshot { started, .. } | Self::Content { started, .. } => Some(*started),
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer(id) => f.write_str(id),
            Self::Snapshot {
                namespace,
                name,
                started,
            } => write!(f, "{namespace}/{name}/{}", rfc3339(started)),
            Self::Content { name, started } => write!(f, "{name}/{}", rfc3339(started)),
        }
    }
}

fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(id: &str, raw: &str) -> Result<DateTime<Utc>, SnapshotError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SnapshotError::operation_id(id, format!("bad timestamp {raw:?}: {e}")))
}
