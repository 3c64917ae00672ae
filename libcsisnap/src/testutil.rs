//! Shared fixtures for unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec,
    Volume, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::task::JoinHandle;

use crate::client::Clients;
use crate::client::memory::{MemoryClients, labels};
use crate::config::Config;
use crate::registry::PluginContext;
use crate::types::snapshot::{VolumeSnapshotContentStatus, VolumeSnapshotStatus};
use crate::types::velero::{BackupSpec, RestoreSpec};
use crate::types::{
    Backup, DeletionPolicy, PersistentVolume, PersistentVolumeClaim, Pod, Restore, StorageClass,
    VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotContent, VolumeSnapshotContentSource,
    VolumeSnapshotContentSpec, VolumeSnapshotSource, VolumeSnapshotSpec,
};

pub const DRIVER: &str = "hostpath.csi.k8s.io";
pub const STORAGE_CLASS: &str = "csi-hostpath";
const BACKUP: &str = "nightly";
const VELERO_NS: &str = "velero";

pub struct Fixture {
    pub store: Arc<MemoryClients>,
    pub clients: Clients,
    pub config: Config,
    pub ctx: Arc<PluginContext>,
}

impl Fixture {
    /// Empty cluster holding only the backup `velero/nightly`.
    pub fn new() -> Self {
        let store = Arc::new(MemoryClients::new());
        let mut backup = Backup::new(
            BACKUP,
            BackupSpec {
                storage_location: Some("default".into()),
                ..Default::default()
            },
        );
        backup.metadata.namespace = Some(VELERO_NS.into());
        store.backups.insert(backup);

        let clients = store.clients();
        let config = Config::default();
        let ctx = Arc::new(PluginContext::new(clients.clone(), config.clone()));
        Self {
            store,
            clients,
            config,
            ctx,
        }
    }

    pub fn backup(&self) -> Backup {
        self.store.backups.peek(VELERO_NS, BACKUP).expect("fixture backup")
    }

    pub fn restore(&self) -> Restore {
        let mut restore = Restore::new(
            "nightly-restore",
            RestoreSpec {
                backup_name: BACKUP.into(),
                ..Default::default()
            },
        );
        restore.metadata.namespace = Some(VELERO_NS.into());
        restore.metadata.uid = Some("restore-uid-1".into());
        restore
    }

    /// A bound 1Gi claim. Nothing is stored.
    pub fn claim(&self, namespace: &str, name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                uid: Some(format!("{name}-uid")),
                labels: Some(labels([("app", name)])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(STORAGE_CLASS.into()),
                volume_name: Some(format!("pv-{namespace}-{name}")),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".into(), Quantity("1Gi".into()))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
        }
    }

    /// A bound claim, with its CSI volume and storage class stored.
    pub fn seed_claim(&self, namespace: &str, name: &str) -> PersistentVolumeClaim {
        let claim = self.claim(namespace, name);
        let volume_name = format!("pv-{namespace}-{name}");
        self.store.volumes.insert(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume_name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: DRIVER.into(),
                    volume_handle: format!("vol-{volume_name}"),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        });
        self.store.storage_classes.insert(StorageClass {
            metadata: ObjectMeta {
                name: Some(STORAGE_CLASS.into()),
                ..Default::default()
            },
            provisioner: DRIVER.into(),
            ..Default::default()
        });
        claim
    }

    /// Create `snapshot` through the client, so it gets a name and UID.
    pub async fn create_snapshot(&self, snapshot: VolumeSnapshot) -> VolumeSnapshot {
        let namespace = snapshot.metadata.namespace.clone().unwrap_or_default();
        self.clients
            .snapshots
            .create(&namespace, &snapshot)
            .await
            .expect("create snapshot")
    }
}

/// Unsaved snapshot of `claim`, named the way the claim backupper names it.
pub fn snapshot_for_claim(namespace: &str, claim: &str) -> VolumeSnapshot {
    let mut vs = VolumeSnapshot::new(
        "",
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(claim.into()),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name: None,
        },
    );
    vs.metadata.name = None;
    vs.metadata.generate_name = Some(format!("velero-{claim}-"));
    vs.metadata.namespace = Some(namespace.into());
    vs
}

/// Dynamically provisioned content with a ready status when `handle` is set.
pub fn content_with_handle(
    name: &str,
    handle: Option<&str>,
    restore_size: Option<i64>,
) -> VolumeSnapshotContent {
    let mut content = VolumeSnapshotContent::new(
        name,
        VolumeSnapshotContentSpec {
            volume_snapshot_ref: ObjectReference {
                kind: Some("VolumeSnapshot".into()),
                namespace: Some("apps".into()),
                name: Some("vs-1".into()),
                uid: Some("vs-1-uid".into()),
                resource_version: Some("7".into()),
                ..Default::default()
            },
            deletion_policy: DeletionPolicy::Delete,
            driver: DRIVER.into(),
            volume_snapshot_class_name: Some(STORAGE_CLASS.into()),
            source: VolumeSnapshotContentSource {
                volume_handle: Some("vol-1".into()),
                snapshot_handle: None,
            },
        },
    );
    content.status = Some(VolumeSnapshotContentStatus {
        snapshot_handle: handle.map(str::to_owned),
        restore_size,
        ready_to_use: Some(handle.is_some()),
        ..Default::default()
    });
    content
}

/// Act as the snapshot controller: store a content for `snapshot` and bind
/// the stored snapshot to it. Returns the updated snapshot.
pub fn bind_snapshot(
    store: &MemoryClients,
    snapshot: &VolumeSnapshot,
    handle: Option<&str>,
    restore_size: Option<i64>,
) -> VolumeSnapshot {
    let namespace = snapshot.metadata.namespace.clone().unwrap_or_default();
    let name = snapshot.metadata.name.clone().unwrap_or_default();
    let uid = snapshot.metadata.uid.clone().unwrap_or_default();
    let content_name = format!("snapcontent-{uid}");

    let mut content = content_with_handle(&content_name, handle, restore_size);
    content.spec.volume_snapshot_ref = ObjectReference {
        kind: Some("VolumeSnapshot".into()),
        namespace: Some(namespace.clone()),
        name: Some(name.clone()),
        uid: Some(uid),
        ..Default::default()
    };
    content.spec.volume_snapshot_class_name = snapshot.spec.volume_snapshot_class_name.clone();
    store.contents.insert(content);

    store.snapshots.modify(&namespace, &name, |vs| {
        vs.status = Some(VolumeSnapshotStatus {
            bound_volume_snapshot_content_name: Some(content_name.clone()),
            ready_to_use: Some(handle.is_some()),
            ..Default::default()
        });
    });
    store.snapshots.peek(&namespace, &name).expect("bound snapshot")
}

pub fn snapshot_class(name: &str, driver: &str, labelled: bool) -> VolumeSnapshotClass {
    let mut class = VolumeSnapshotClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        driver: driver.into(),
        deletion_policy: DeletionPolicy::Delete,
        parameters: None,
    };
    if labelled {
        class.metadata.labels = Some(labels([(crate::labels::SNAPSHOT_CLASS_SELECTOR, "true")]));
    }
    class
}

/// A pod mounting `claim` as `volume`, optionally opted into filesystem
/// backup through the pod annotation.
pub fn pod_mounting(
    namespace: &str,
    pod: &str,
    volume: &str,
    claim: &str,
    fs_backup_volumes: Option<&str>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod.into()),
            namespace: Some(namespace.into()),
            annotations: fs_backup_volumes
                .map(|v| labels([(crate::labels::FS_BACKUP_VOLUMES, v)])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: volume.into(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.into(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Bind every unbound snapshot once per second, starting after `delay`.
/// Handles are named `handle-<snapshot>`.
pub fn spawn_snapshot_controller(store: Arc<MemoryClients>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        loop {
            for vs in store.snapshots.all() {
                if vs.bound_content_name().is_none() {
                    let handle = format!("handle-{}", vs.metadata.name.as_deref().unwrap_or_default());
                    bind_snapshot(&store, &vs, Some(&handle), Some(1 << 30));
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}
