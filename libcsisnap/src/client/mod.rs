//! Object client facade.
//!
//! Every component talks to the cluster through [`ObjectApi`], one instance
//! per resource kind, bundled in [`Clients`]. The bundle is built once by the
//! host process ([`Clients::from_kube`]) or by a test
//! ([`memory::MemoryClients::clients`]) and passed down explicitly.
//!
//! Namespaced kinds take the namespace as the first argument; cluster-scoped
//! kinds ignore it. An empty namespace on `list` means all namespaces.

pub mod cluster;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::types::{
    Backup, ConfigMap, DataDownload, DataUpload, PersistentVolume, Pod,
    StorageClass, VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotContent,
};

/// Label equality selector.
pub type Selector = BTreeMap<String, String>;

/// Typed CRUD against one resource kind.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ClientError>;

    /// Objects whose labels contain every pair of `selector`.
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>, ClientError>;

    /// Create `object`. A `generateName` is honoured when `name` is unset.
    async fn create(&self, namespace: &str, object: &K) -> Result<K, ClientError>;

    /// Apply a JSON merge patch (RFC 7386). Fields absent from the patch are
    /// left as the server has them.
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClientError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// One client per resource kind the coordinator touches.
#[derive(Clone)]
pub struct Clients {
    pub volumes: Arc<dyn ObjectApi<PersistentVolume>>,
    pub pods: Arc<dyn ObjectApi<Pod>>,
    pub storage_classes: Arc<dyn ObjectApi<StorageClass>>,
    /// Holds DataUploadResult entries.
    pub config_maps: Arc<dyn ObjectApi<ConfigMap>>,
    /// The snapshot kinds the coordinator manages.
    pub snapshots: Arc<dyn ObjectApi<VolumeSnapshot>>,
    pub contents: Arc<dyn ObjectApi<VolumeSnapshotContent>>,
    pub snapshot_classes: Arc<dyn ObjectApi<VolumeSnapshotClass>>,
    /// Data mover requests.
    pub uploads: Arc<dyn ObjectApi<DataUpload>>,
    pub downloads: Arc<dyn ObjectApi<DataDownload>>,
    /// Backups in the orchestrator namespace.
    pub backups: Arc<dyn ObjectApi<Backup>>,
}

/// Render a selector in `k=v,k=v` form.
pub fn selector_string(selector: &Selector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True if `labels` carry every pair of `selector`.
pub fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &Selector) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_rendering_and_matching() {
        let selector = Selector::from([
            ("a".to_owned(), "1".to_owned()),
            ("b".to_owned(), "2".to_owned()),
        ]);
        assert_eq!(selector_string(&selector), "a=1,b=2");

        let mut labels = selector.clone();
        labels.insert("c".into(), "3".into());
        assert!(matches_selector(Some(&labels), &selector));
        labels.insert("b".into(), "9".into());
        assert!(!matches_selector(Some(&labels), &selector));
        assert!(!matches_selector(None, &selector));
        assert!(matches_selector(None, &Selector::new()));
    }
}
