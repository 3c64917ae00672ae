//! Async operations: identifiers, request construction, and progress
//! tracking.

pub mod id;
pub mod request;
pub mod tracker;

use chrono::{DateTime, Utc};

pub use id::OperationId;
pub use request::{new_download, new_upload};
pub use tracker::{DataMovement, Tracker};

/// Normalised progress report handed back to the orchestrator.
///
/// The default value means "not started": not completed, no error, no
/// counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationProgress {
    /// The operation reached a terminal state.
    pub completed: bool,
    /// Failure or cancellation message of a completed operation.
    pub err: Option<String>,
    /// Units done so far.
    pub n_completed: i64,
    /// Units in total. Zero when unknown.
    pub n_total: i64,
    /// Unit of the counters, e.g. `Bytes`.
    pub operation_units: String,
    /// Phase or status as reported by the data mover.
    pub description: String,
    /// When the operation started.
    pub started: Option<DateTime<Utc>>,
    /// When the operation last changed.
    pub updated: Option<DateTime<Utc>>,
}
