//! Progress and cancellation of data-movement requests.
//!
//! Uploads and downloads share their status shape, so one [`Tracker`] serves
//! both kinds through the [`DataMovement`] trait.

use std::sync::Arc;

use kube::Resource;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{OperationId, OperationProgress};
use crate::client::{ObjectApi, Selector};
use crate::error::SnapshotError;
use crate::labels;
use crate::types::{DataDownload, DataMovePhase, DataMoveStatus, DataUpload};

const CANCELED_MESSAGE: &str = "operation is canceled";
const BYTES: &str = "Bytes";

/// A request kind executed by the data mover.
pub trait DataMovement: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    /// Kind name used in errors and logs.
    const KIND: &'static str;

    /// Status written by the data mover, if any yet.
    fn move_status(&self) -> Option<&DataMoveStatus>;
}

impl DataMovement for DataUpload {
    const KIND: &'static str = "DataUpload";

    fn move_status(&self) -> Option<&DataMoveStatus> {
        self.status.as_ref()
    }
}

impl DataMovement for DataDownload {
    const KIND: &'static str = "DataDownload";

    fn move_status(&self) -> Option<&DataMoveStatus> {
        self.status.as_ref()
    }
}

/// Looks up requests by operation ID.
pub struct Tracker<K> {
    api: Arc<dyn ObjectApi<K>>,
}

impl<K> Clone for Tracker<K> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
        }
    }
}

impl<K: DataMovement> Tracker<K> {
    /// Tracker over the client for `K`.
    pub fn new(api: Arc<dyn ObjectApi<K>>) -> Self {
        Self { api }
    }

    /// The single request in `namespace` labelled with `id`.
    pub async fn find(&self, namespace: &str, id: &OperationId) -> Result<K, SnapshotError> {
        let operation_id = id.to_string();
        let selector = Selector::from([(labels::ASYNC_OPERATION_ID.to_owned(), operation_id.clone())]);
        let mut found = self.api.list(namespace, &selector).await?;
        match found.len() {
            1 => Ok(found.swap_remove(0)),
            0 => Err(SnapshotError::OperationNotFound {
                kind: K::KIND,
                operation_id,
            }),
            count => Err(SnapshotError::AmbiguousOperation {
                kind: K::KIND,
                operation_id,
                count,
            }),
        }
    }

    /// Normalised progress of the request labelled with `id`.
    #[instrument(skip(self), fields(kind = K::KIND, operation_id = %id))]
    pub async fn progress(
        &self,
        namespace: &str,
        id: &OperationId,
    ) -> Result<OperationProgress, SnapshotError> {
        let request = self.find(namespace, id).await?;
        Ok(progress_of(request.move_status()))
    }

    /// Ask the mover to stop. Only the cancel flag is patched, so status
    /// written concurrently by the mover is preserved.
    #[instrument(skip(self), fields(kind = K::KIND, operation_id = %id))]
    pub async fn cancel(&self, namespace: &str, id: &OperationId) -> Result<(), SnapshotError> {
        let request = self.find(namespace, id).await?;
        let name = request.meta().name.clone().unwrap_or_default();
        let namespace = request.meta().namespace.clone().unwrap_or_default();
        self.api
            .patch(&namespace, &name, &json!({"spec": {"cancel": true}}))
            .await?;
        info!(%namespace, %name, "requested cancellation");
        Ok(())
    }
}

fn progress_of(status: Option<&DataMoveStatus>) -> OperationProgress {
    let Some(status) = status else {
        return OperationProgress::default();
    };
    let phase = match status.phase {
        None | Some(DataMovePhase::New) => {
            debug!("request not picked up by the data mover yet");
            return OperationProgress::default();
        }
        Some(phase) => phase,
    };

    let counters = status.progress.clone().unwrap_or_default();
    let mut progress = OperationProgress {
        description: phase.to_string(),
        operation_units: BYTES.to_owned(),
        n_completed: counters.bytes_done,
        n_total: counters.total_bytes,
        started: status.start_timestamp.as_ref().map(|t| t.0),
        updated: status.completion_timestamp.as_ref().map(|t| t.0),
        ..Default::default()
    };

    match phase {
        DataMovePhase::Completed => progress.completed = true,
        DataMovePhase::Failed => {
            progress.completed = true;
            progress.err = Some(status.message.clone().unwrap_or_default());
        }
        DataMovePhase::Canceled => {
            progress.completed = true;
            progress.err = Some(CANCELED_MESSAGE.to_owned());
        }
        _ => {}
    }
    progress
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::client::memory::{MemoryClients, Verb, labels as label_map};
    use crate::types::DataUploadSpec;
    use crate::types::velero::DataMoveProgress;

    fn upload(name: &str, id: &OperationId, status: Option<DataMoveStatus>) -> DataUpload {
        let mut du = DataUpload::new(
            name,
            DataUploadSpec {
                snapshot_type: "CSI".into(),
                source_pvc: "data".into(),
                backup_storage_location: "default".into(),
                source_namespace: "apps".into(),
                ..Default::default()
            },
        );
        du.metadata.namespace = Some("velero".into());
        du.metadata.labels = Some(label_map([(labels::ASYNC_OPERATION_ID, id.to_string().as_str())]));
        du.status = status;
        du
    }

    fn phase(phase: DataMovePhase) -> DataMoveStatus {
        DataMoveStatus {
            phase: Some(phase),
            progress: Some(DataMoveProgress {
                total_bytes: 100,
                bytes_done: 40,
            }),
            ..Default::default()
        }
    }

    fn tracker(store: &MemoryClients) -> Tracker<DataUpload> {
        Tracker::new(store.clients().uploads)
    }

    #[tokio::test]
    async fn zero_matches_is_not_found_without_progress() {
        let store = MemoryClients::new();
        let id = OperationId::upload("b", "c");
        let err = tracker(&store).progress("velero", &id).await.unwrap_err();
        assert!(matches!(err, SnapshotError::OperationNotFound { kind: "DataUpload", .. }));
    }

    #[tokio::test]
    async fn several_matches_are_ambiguous() {
        let store = MemoryClients::new();
        let id = OperationId::upload("b", "c");
        store.uploads.insert(upload("du-1", &id, None));
        store.uploads.insert(upload("du-2", &id, None));
        let err = tracker(&store).progress("velero", &id).await.unwrap_err();
        assert!(matches!(err, SnapshotError::AmbiguousOperation { count: 2, .. }));
    }

    #[tokio::test]
    async fn phase_mapping() {
        let store = MemoryClients::new();
        let t = tracker(&store);

        let cases = [
            (None, false, None, ""),
            (Some(phase(DataMovePhase::New)), false, None, ""),
            (Some(phase(DataMovePhase::InProgress)), false, None, "InProgress"),
            (Some(phase(DataMovePhase::Completed)), true, None, "Completed"),
            (Some(phase(DataMovePhase::Canceled)), true, Some(CANCELED_MESSAGE), "Canceled"),
        ];
        for (i, (status, completed, err, description)) in cases.into_iter().enumerate() {
            let id = OperationId::upload("b", &format!("c{i}"));
            store.uploads.insert(upload(&format!("du-{i}"), &id, status));
            let p = t.progress("velero", &id).await.unwrap();
            assert_eq!(p.completed, completed, "case {i}");
            assert_eq!(p.err.as_deref(), err, "case {i}");
            assert_eq!(p.description, description, "case {i}");
        }
    }

    #[tokio::test]
    async fn in_progress_reports_bytes_and_times() {
        let store = MemoryClients::new();
        let id = OperationId::upload("b", "c");
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut status = phase(DataMovePhase::InProgress);
        status.start_timestamp = Some(Time(started));
        store.uploads.insert(upload("du-1", &id, Some(status)));

        let p = tracker(&store).progress("velero", &id).await.unwrap();
        assert_eq!((p.n_completed, p.n_total), (40, 100));
        assert_eq!(p.operation_units, BYTES);
        assert_eq!(p.started, Some(started));
        assert_eq!(p.updated, None);
    }

    #[tokio::test]
    async fn failed_carries_status_message() {
        let store = MemoryClients::new();
        let id = OperationId::upload("b", "c");
        let mut status = phase(DataMovePhase::Failed);
        status.message = Some("repository unreachable".into());
        store.uploads.insert(upload("du-1", &id, Some(status)));

        let p = tracker(&store).progress("velero", &id).await.unwrap();
        assert!(p.completed);
        assert_eq!(p.err.as_deref(), Some("repository unreachable"));
    }

    #[tokio::test]
    async fn cancel_patches_only_the_flag() {
        let store = MemoryClients::new();
        let id = OperationId::upload("b", "c");
        let before = store.uploads.insert(upload("du-1", &id, Some(phase(DataMovePhase::InProgress))));

        tracker(&store).cancel("velero", &id).await.unwrap();

        let patches = store.journal.filter("DataUpload", Verb::Patch);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].patch, Some(json!({"spec": {"cancel": true}})));

        let after = store.uploads.peek("velero", "du-1").unwrap();
        assert_eq!(after.spec.cancel, Some(true));
        let mut expected = before.spec.clone();
        expected.cancel = Some(true);
        assert_eq!(
            serde_json::to_value(&after.spec).unwrap(),
            serde_json::to_value(&expected).unwrap()
        );
        assert_eq!(after.status.unwrap().phase, Some(DataMovePhase::InProgress));
    }
}
