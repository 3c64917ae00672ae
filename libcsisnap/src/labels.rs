//! Label and annotation side channel.
//!
//! The orchestrator persists each object on its own, so facts about sibling
//! objects travel as annotations. The keys below are a wire contract and must
//! stay stable. The rest of the crate reads and writes them through the typed
//! helpers here ([`SnapshotFacts`], [`SecretRef`], [`add_labels`], ...).
//!
//! Label values are canonicalised with [`valid_name`] both when written and
//! when compared, so a long backup name matches its own label.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::Rng;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Claim annotation naming the snapshot taken for it.
pub const VOLUME_SNAPSHOT_NAME: &str = "velero.io/volume-snapshot-name";
/// Storage handle of the bound content.
pub const SNAPSHOT_HANDLE: &str = "velero.io/csi-volumesnapshot-handle";
/// Restore size of the bound content, binary-SI formatted.
pub const RESTORE_SIZE: &str = "velero.io/vsi-volumesnapshot-restore-size";
/// CSI driver of the bound content.
pub const DRIVER_NAME: &str = "velero.io/csi-driver-name";
/// Name and namespace of the secret the driver needs to delete the snapshot.
pub const DELETE_SECRET_NAME: &str = "velero.io/csi-deletesnapshotsecret-name";
pub const DELETE_SECRET_NAMESPACE: &str = "velero.io/csi-deletesnapshotsecret-namespace";
/// Deletion policy of the bound content at backup time.
pub const DELETION_POLICY: &str = "velero.io/csi-vsc-deletion-policy";
/// Selector label marking the preferred snapshot class for a driver; also the
/// per-claim class override annotation.
pub const SNAPSHOT_CLASS_SELECTOR: &str = "velero.io/csi-volumesnapshot-class";
/// Per-backup class override, suffixed with `_<driver>`.
pub const BACKUP_SNAPSHOT_CLASS_PREFIX: &str = "velero.io/csi-volumesnapshot-class_";

/// Snapshotter secret parameters on a snapshot class.
pub const SNAPSHOTTER_SECRET_NAME: &str = "csi.storage.k8s.io/snapshotter-secret-name";
pub const SNAPSHOTTER_SECRET_NAMESPACE: &str = "csi.storage.k8s.io/snapshotter-secret-namespace";
pub const SNAPSHOTTER_LIST_SECRET_NAME: &str = "csi.storage.k8s.io/snapshotter-list-secret-name";
pub const SNAPSHOTTER_LIST_SECRET_NAMESPACE: &str =
    "csi.storage.k8s.io/snapshotter-list-secret-namespace";

/// Tells the orchestrator to keep additional items it would otherwise prune.
pub const MUST_INCLUDE_ADDITIONAL_ITEMS: &str = "backup.velero.io/must-include-additional-items";
/// Marks a claim that was skipped because its volume is not CSI provisioned.
pub const SKIPPED_NO_CSI_PV: &str = "backup.velero.io/skipped-no-csi-pv";

/// Name of the backup that created or claimed an object.
pub const BACKUP_NAME: &str = "velero.io/backup-name";
/// UID of that backup.
pub const BACKUP_UID: &str = "velero.io/backup-uid";
/// Name of the restore that created an object.
pub const RESTORE_NAME: &str = "velero.io/restore-name";
/// UID of that restore. Also the key of a DataUploadResult config map entry.
pub const RESTORE_UID: &str = "velero.io/restore-uid";
/// UID of the claim a DataUpload or DataUploadResult belongs to.
pub const PVC_UID: &str = "velero.io/pvc-UID";
/// `namespace.name` of the restored claim, canonicalised.
pub const PVC_NAMESPACE_NAME: &str = "velero.io/pvc-namespace-name";
/// What a config map is used for.
pub const RESOURCE_USAGE: &str = "velero.io/resource-usage";
/// [`RESOURCE_USAGE`] value of DataUploadResult config maps.
pub const RESOURCE_USAGE_DATA_UPLOAD: &str = "DataUpload";
/// Operation id stamped on snapshots and data movement requests.
pub const ASYNC_OPERATION_ID: &str = "velero.io/async-operation-id";
/// Label selecting the volume a DataDownload provisions for a restored claim.
pub const DYNAMIC_PV_RESTORE: &str = "velero.io/dynamic-pv-restore";
/// Claim annotation naming the upload request as `namespace/name`.
pub const DATA_UPLOAD_NAME: &str = "velero.io/data-upload-name";

/// Pod annotations opting volumes in to (or out of) filesystem backup.
pub const FS_BACKUP_VOLUMES: &str = "backup.velero.io/backup-volumes";
pub const FS_BACKUP_VOLUMES_EXCLUDES: &str = "backup.velero.io/backup-volumes-excludes";

/// Binding annotations assigned by Kubernetes that must not follow a claim
/// into another cluster.
pub const BINDING_ANNOTATIONS: [&str; 5] = [
    "pv.kubernetes.io/bind-completed",
    "pv.kubernetes.io/bound-by-controller",
    "volume.kubernetes.io/storage-provisioner",
    "volume.beta.kubernetes.io/storage-provisioner",
    "volume.kubernetes.io/selected-node",
];

const MAX_LABEL_VALUE_LEN: usize = 63;
const HASH_SUFFIX_LEN: usize = 6;
/// Alphabet of generated name suffixes (no vowels, no look-alikes).
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

// ---------------------------------------------------------------------------
// Canonicalisation
// ---------------------------------------------------------------------------

/// Make `value` usable as a label value.
///
/// Values of at most 63 characters are returned as is. Longer values keep
/// their first 57 characters followed by the first 6 hex digits of their
/// SHA-256, which keeps them unique and deterministic.
pub fn valid_name(value: &str) -> String {
    if value.chars().count() <= MAX_LABEL_VALUE_LEN {
        return value.to_owned();
    }
    let digest = Sha256::digest(value.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let mut out: String = value
        .chars()
        .take(MAX_LABEL_VALUE_LEN - HASH_SUFFIX_LEN)
        .collect();
    out.push_str(&hex[..HASH_SUFFIX_LEN]);
    out
}

/// Random suffix of `len` characters that is safe in names and label values.
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

// ---------------------------------------------------------------------------
// Metadata helpers
// ---------------------------------------------------------------------------

/// Merge `vals` into the object's annotations, overwriting existing keys.
pub fn add_annotations<'a, I>(meta: &mut ObjectMeta, vals: I)
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in vals {
        annotations.insert(k.to_owned(), v);
    }
}

/// Merge `vals` into the object's labels. Values are canonicalised.
pub fn add_labels<'a, I>(meta: &mut ObjectMeta, vals: I)
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in vals {
        labels.insert(k.to_owned(), valid_name(&v));
    }
}

/// Drop `keys` from the object's annotations.
pub fn remove_annotations(meta: &mut ObjectMeta, keys: &[&str]) {
    if let Some(annotations) = meta.annotations.as_mut() {
        for key in keys {
            annotations.remove(*key);
        }
    }
}

/// Value of annotation `key`, if set.
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Value of label `key`, if set.
pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// True if the object was created by (or labelled for) the named backup.
pub fn has_backup_label(meta: &ObjectMeta, backup_name: &str) -> bool {
    if backup_name.trim().is_empty() {
        return false;
    }
    label(meta, BACKUP_NAME) == Some(valid_name(backup_name).as_str())
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

/// Namespaced reference to a secret carried as a pair of annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name.
    pub name: String,
    /// Namespace of the secret.
    pub namespace: String,
}

impl SecretRef {
    /// Read the pair `(name_key, namespace_key)`. Both must be present.
    pub fn from_annotations(meta: &ObjectMeta, name_key: &str, namespace_key: &str) -> Option<Self> {
        Some(Self {
            name: annotation(meta, name_key)?.to_owned(),
            namespace: annotation(meta, namespace_key)?.to_owned(),
        })
    }

    /// Inverse of [`SecretRef::from_annotations`].
    pub fn to_annotations<'a>(
        &self,
        name_key: &'a str,
        namespace_key: &'a str,
    ) -> [(&'a str, String); 2] {
        [
            (name_key, self.name.clone()),
            (namespace_key, self.namespace.clone()),
        ]
    }
}

/// Reconciliation facts captured on a snapshot at backup time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFacts {
    /// CSI driver of the content.
    pub driver: Option<String>,
    /// Storage-side snapshot handle.
    pub handle: Option<String>,
    /// `Delete` or `Retain`, as set on the content at backup time.
    pub deletion_policy: Option<String>,
    /// Restore size in binary-SI form, e.g. `10Gi`.
    pub restore_size: Option<String>,
    /// Secret the driver needs to delete the snapshot.
    pub delete_secret: Option<SecretRef>,
}

impl SnapshotFacts {
    /// Read whatever facts are present. Missing keys stay `None`.
    pub fn from_annotations(meta: &ObjectMeta) -> Self {
        let get = |key| annotation(meta, key).map(str::to_owned);
        Self {
            driver: get(DRIVER_NAME),
            handle: get(SNAPSHOT_HANDLE),
            deletion_policy: get(DELETION_POLICY),
            restore_size: get(RESTORE_SIZE),
            delete_secret: SecretRef::from_annotations(
                meta,
                DELETE_SECRET_NAME,
                DELETE_SECRET_NAMESPACE,
            ),
        }
    }

    /// The annotations that encode these facts. Absent facts are omitted.
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let pairs = [
            (DRIVER_NAME, &self.driver),
            (SNAPSHOT_HANDLE, &self.handle),
            (DELETION_POLICY, &self.deletion_policy),
            (RESTORE_SIZE, &self.restore_size),
        ];
        for (key, value) in pairs {
            if let Some(v) = value {
                out.insert(key.to_owned(), v.clone());
            }
        }
        if let Some(secret) = &self.delete_secret {
            for (k, v) in secret.to_annotations(DELETE_SECRET_NAME, DELETE_SECRET_NAMESPACE) {
                out.insert(k.to_owned(), v);
            }
        }
        out
    }

    /// Merge [`to_annotations`](Self::to_annotations) into `meta`.
    pub fn apply(&self, meta: &mut ObjectMeta) {
        let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
        annotations.extend(self.to_annotations());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_kept() {
        assert_eq!(valid_name("nightly"), "nightly");
        let exactly_63 = "a".repeat(63);
        assert_eq!(valid_name(&exactly_63), exactly_63);
    }

    #[test]
    fn random_suffix_is_name_safe() {
        let suffix = random_suffix(5);
        assert_eq!(suffix.len(), 5);
        assert!(suffix.bytes().all(|b| SUFFIX_ALPHABET.contains(&b)));
        assert_eq!(valid_name(&suffix), suffix);
        assert!(random_suffix(0).is_empty());
    }

    #[test]
    fn long_names_are_truncated_with_hash() {
        let long = "b".repeat(80);
        let v = valid_name(&long);
        assert_eq!(v.len(), 63);
        assert!(v.starts_with(&"b".repeat(57)));
        assert_eq!(v, valid_name(&long));
        assert_ne!(v, valid_name(&"b".repeat(81)));
    }

    #[test]
    fn backup_label_compares_canonical_value() {
        let backup = format!("backup-{}", "x".repeat(70));
        let mut meta = ObjectMeta::default();
        add_labels(&mut meta, [(BACKUP_NAME, backup.clone())]);
        assert!(has_backup_label(&meta, &backup));
        assert!(!has_backup_label(&meta, "other"));
        assert!(!has_backup_label(&meta, "  "));
    }

    #[test]
    fn facts_roundtrip_through_annotations() {
        let facts = SnapshotFacts {
            driver: Some("hostpath.csi.k8s.io".into()),
            handle: Some("snap-0123".into()),
            deletion_policy: Some("Delete".into()),
            restore_size: Some("10Gi".into()),
            delete_secret: Some(SecretRef {
                name: "creds".into(),
                namespace: "kube-system".into(),
            }),
        };
        let mut meta = ObjectMeta::default();
        facts.apply(&mut meta);
        assert_eq!(SnapshotFacts::from_annotations(&meta), facts);
    }

    #[test]
    fn secret_requires_both_keys() {
        let mut meta = ObjectMeta::default();
        add_annotations(&mut meta, [(DELETE_SECRET_NAME, "creds".to_owned())]);
        assert_eq!(
            SecretRef::from_annotations(&meta, DELETE_SECRET_NAME, DELETE_SECRET_NAMESPACE),
            None
        );
    }

    #[test]
    fn binding_annotations_are_removed() {
        let mut meta = ObjectMeta::default();
        add_annotations(
            &mut meta,
            [
                ("pv.kubernetes.io/bind-completed", "yes".to_owned()),
                ("team", "storage".to_owned()),
            ],
        );
        remove_annotations(&mut meta, &BINDING_ANNOTATIONS);
        assert_eq!(annotation(&meta, "pv.kubernetes.io/bind-completed"), None);
        assert_eq!(annotation(&meta, "team"), Some("storage"));
    }
}
