//! In-memory [`ObjectApi`] used for tests and local simulation.
//!
//! Behaves like a small API server for one kind: names are generated from
//! `generateName`, UIDs and resource versions are assigned on create, and
//! patches follow JSON merge-patch semantics. On top of that it offers test
//! hooks the real server cannot:
//!
//! * a [`Journal`] shared by all kinds of one [`MemoryClients`], recording
//!   every call in order together with its outcome;
//! * [`MemoryApi::linger_on_delete`], which keeps a deleted object visible for
//!   a number of further `get` calls to mimic finalizers;
//! * [`MemoryApi::fail`], which makes a verb return an API error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{Clients, ObjectApi, Selector, matches_selector};
use crate::error::ClientError;
use crate::labels::random_suffix;
use crate::types::{
    Backup, ConfigMap, DataDownload, DataUpload, PersistentVolume, Pod,
    StorageClass, VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotContent,
};

const GENERATED_SUFFIX_LEN: usize = 5;

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// The [`ObjectApi`] call a journal entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

/// How a recorded call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    NotFound,
    AlreadyExists,
    /// Any other error, injected ones included.
    Failed,
}

impl Outcome {
    fn of<T>(result: &Result<T, ClientError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(ClientError::NotFound { .. }) => Self::NotFound,
            Err(ClientError::AlreadyExists { .. }) => Self::AlreadyExists,
            Err(_) => Self::Failed,
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub verb: Verb,
    /// Kind name, e.g. `VolumeSnapshot`.
    pub kind: String,
    /// Empty for cluster-scoped kinds and cluster-wide lists.
    pub namespace: String,
    /// Empty for lists.
    pub name: String,
    pub outcome: Outcome,
    /// Merge patch body, for `Patch` entries.
    pub patch: Option<Value>,
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {}/{} -> {:?}",
            self.verb, self.kind, self.namespace, self.name, self.outcome
        )
    }
}

/// Ordered record of every call across kinds.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    fn record(&self, entry: JournalEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    /// Snapshot of all entries in call order.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Entries for one kind and verb.
    pub fn filter(&self, kind: &str, verb: Verb) -> Vec<JournalEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.kind == kind && e.verb == verb)
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryApi
// ---------------------------------------------------------------------------

type Key = (String, String);

/// In-memory store for one resource kind.
pub struct MemoryApi<K> {
    cluster_scoped: bool,
    objects: DashMap<Key, K>,
    /// Deleted objects still visible to `get`, with remaining visibility.
    lingering: DashMap<Key, (K, usize)>,
    linger: AtomicUsize,
    failures: DashMap<Verb, String>,
    resource_version: AtomicU64,
    journal: Arc<Journal>,
}

impl<K> MemoryApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Store for a namespaced kind.
    pub fn namespaced(journal: Arc<Journal>) -> Self {
        Self::new(false, journal)
    }

    /// Store for a cluster-scoped kind. Namespaces passed in are ignored.
    pub fn cluster(journal: Arc<Journal>) -> Self {
        Self::new(true, journal)
    }

    fn new(cluster_scoped: bool, journal: Arc<Journal>) -> Self {
        Self {
            cluster_scoped,
            objects: DashMap::new(),
            lingering: DashMap::new(),
            linger: AtomicUsize::new(0),
            failures: DashMap::new(),
            resource_version: AtomicU64::new(1),
            journal,
        }
    }

    fn key(&self, namespace: &str, name: &str) -> Key {
        let ns = if self.cluster_scoped { "" } else { namespace };
        (ns.to_owned(), name.to_owned())
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    fn not_found(&self, namespace: &str, name: &str) -> ClientError {
        let name = if self.cluster_scoped || namespace.is_empty() {
            name.to_owned()
        } else {
            format!("{namespace}/{name}")
        };
        ClientError::NotFound {
            kind: Self::kind(),
            name,
        }
    }

    fn next_version(&self) -> String {
        self.resource_version
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn injected(&self, verb: Verb) -> Result<(), ClientError> {
        match self.failures.get(&verb) {
            Some(msg) => Err(ClientError::Api(msg.clone())),
            None => Ok(()),
        }
    }

    fn log<T>(
        &self,
        verb: Verb,
        namespace: &str,
        name: &str,
        patch: Option<&Value>,
        result: &Result<T, ClientError>,
    ) {
        let (namespace, name) = self.key(namespace, name);
        self.journal.record(JournalEntry {
            verb,
            kind: Self::kind(),
            namespace,
            name,
            outcome: Outcome::of(result),
            patch: patch.cloned(),
        });
    }

    // ----- Test hooks ------------------------------------------------------

    /// Store `object` as is, filling in a UID and resource version when
    /// missing. Not journaled.
    pub fn insert(&self, mut object: K) -> K {
        let meta = object.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.resource_version = Some(self.next_version());
        let key = self.key(
            meta.namespace.as_deref().unwrap_or_default(),
            meta.name.as_deref().unwrap_or_default(),
        );
        self.objects.insert(key, object.clone());
        object
    }

    /// Mutate a stored object in place, as an external controller would.
    /// Not journaled. Returns `false` if the object does not exist.
    pub fn modify<F>(&self, namespace: &str, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut K),
    {
        match self.objects.get_mut(&self.key(namespace, name)) {
            Some(mut entry) => {
                f(entry.value_mut());
                entry.meta_mut().resource_version = Some(self.next_version());
                true
            }
            None => false,
        }
    }

    /// Current stored object, bypassing the journal and lingering state.
    pub fn peek(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .get(&self.key(namespace, name))
            .map(|e| e.value().clone())
    }

    /// All stored objects.
    pub fn all(&self) -> Vec<K> {
        self.objects.iter().map(|e| e.value().clone()).collect()
    }

    /// Keep deleted objects fetchable for `gets` further `get` calls.
    pub fn linger_on_delete(&self, gets: usize) {
        self.linger.store(gets, Ordering::SeqCst);
    }

    /// Make every call of `verb` fail with an API error.
    pub fn fail(&self, verb: Verb, message: impl Into<String>) {
        self.failures.insert(verb, message.into());
    }

    /// Undo every [`fail`](Self::fail).
    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    // ----- Operations ------------------------------------------------------

    fn do_get(&self, namespace: &str, name: &str) -> Result<K, ClientError> {
        self.injected(Verb::Get)?;
        let key = self.key(namespace, name);
        if let Some(obj) = self.objects.get(&key) {
            return Ok(obj.value().clone());
        }
        if let Some(mut entry) = self.lingering.get_mut(&key) {
            let (obj, remaining) = entry.value_mut();
            let obj = obj.clone();
            *remaining -= 1;
            let expired = *remaining == 0;
            drop(entry);
            if expired {
                self.lingering.remove(&key);
            }
            return Ok(obj);
        }
        Err(self.not_found(namespace, name))
    }

    fn do_list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>, ClientError> {
        self.injected(Verb::List)?;
        let mut out: Vec<(Key, K)> = self
            .objects
            .iter()
            .filter(|e| self.cluster_scoped || namespace.is_empty() || e.key().0 == namespace)
            .filter(|e| matches_selector(e.value().meta().labels.as_ref(), selector))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, v)| v).collect())
    }

    fn do_create(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        self.injected(Verb::Create)?;
        let mut object = object.clone();
        let meta = object.meta_mut();

        let name = match (meta.name.as_deref(), meta.generate_name.as_deref()) {
            (Some(name), _) if !name.is_empty() => name.to_owned(),
            (_, Some(prefix)) => format!("{prefix}{}", random_suffix(GENERATED_SUFFIX_LEN)),
            _ => return Err(ClientError::Api("name or generateName is required".into())),
        };
        let key = self.key(namespace, &name);
        if self.objects.contains_key(&key) || self.lingering.contains_key(&key) {
            return Err(ClientError::AlreadyExists {
                kind: Self::kind(),
                name,
            });
        }

        meta.name = Some(name);
        meta.namespace = (!self.cluster_scoped).then(|| namespace.to_owned());
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = Some(Time(Utc::now()));

        self.objects.insert(key, object.clone());
        Ok(object)
    }

    fn do_patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, ClientError> {
        self.injected(Verb::Patch)?;
        let key = self.key(namespace, name);
        let mut entry = self
            .objects
            .get_mut(&key)
            .ok_or_else(|| self.not_found(namespace, name))?;

        let mut doc = serde_json::to_value(entry.value()).map_err(ClientError::serialization)?;
        merge_patch(&mut doc, patch);
        let mut patched: K = serde_json::from_value(doc).map_err(ClientError::serialization)?;
        patched.meta_mut().resource_version = Some(self.next_version());
        *entry.value_mut() = patched.clone();
        Ok(patched)
    }

    fn do_delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.injected(Verb::Delete)?;
        let key = self.key(namespace, name);
        let (key, obj) = self
            .objects
            .remove(&key)
            .ok_or_else(|| self.not_found(namespace, name))?;
        let linger = self.linger.load(Ordering::SeqCst);
        if linger > 0 {
            self.lingering.insert(key, (obj, linger));
        }
        Ok(())
    }
}

#[async_trait]
impl<K> ObjectApi<K> for MemoryApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ClientError> {
        let result = self.do_get(namespace, name);
        self.log(Verb::Get, namespace, name, None, &result);
        result
    }

    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>, ClientError> {
        let result = self.do_list(namespace, selector);
        self.log(Verb::List, namespace, "", None, &result);
        result
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        let result = self.do_create(namespace, object);
        let name = match &result {
            Ok(created) => created.meta().name.clone().unwrap_or_default(),
            Err(_) => object
                .meta()
                .name
                .clone()
                .or_else(|| object.meta().generate_name.clone())
                .unwrap_or_default(),
        };
        self.log(Verb::Create, namespace, &name, None, &result);
        debug!(kind = %Self::kind(), %name, outcome = ?Outcome::of(&result), "memory create");
        result
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, ClientError> {
        let result = self.do_patch(namespace, name, patch);
        self.log(Verb::Patch, namespace, name, Some(patch), &result);
        result
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let result = self.do_delete(namespace, name);
        self.log(Verb::Delete, namespace, name, None, &result);
        result
    }
}

/// Apply an RFC 7386 merge patch to `target`.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in fields {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryClients
// ---------------------------------------------------------------------------

/// One [`MemoryApi`] per kind, sharing a [`Journal`]. Fields mirror those
/// of [`Clients`].
pub struct MemoryClients {
    pub journal: Arc<Journal>,
    pub volumes: Arc<MemoryApi<PersistentVolume>>,
    pub pods: Arc<MemoryApi<Pod>>,
    pub storage_classes: Arc<MemoryApi<StorageClass>>,
    pub config_maps: Arc<MemoryApi<ConfigMap>>,
    pub snapshots: Arc<MemoryApi<VolumeSnapshot>>,
    pub contents: Arc<MemoryApi<VolumeSnapshotContent>>,
    pub snapshot_classes: Arc<MemoryApi<VolumeSnapshotClass>>,
    pub uploads: Arc<MemoryApi<DataUpload>>,
    pub downloads: Arc<MemoryApi<DataDownload>>,
    pub backups: Arc<MemoryApi<Backup>>,
}

impl Default for MemoryClients {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClients {
    /// Empty stores.
    pub fn new() -> Self {
        let journal = Arc::new(Journal::default());
        let j = || Arc::clone(&journal);
        Self {
            volumes: Arc::new(MemoryApi::cluster(j())),
            pods: Arc::new(MemoryApi::namespaced(j())),
            storage_classes: Arc::new(MemoryApi::cluster(j())),
            config_maps: Arc::new(MemoryApi::namespaced(j())),
            snapshots: Arc::new(MemoryApi::namespaced(j())),
            contents: Arc::new(MemoryApi::cluster(j())),
            snapshot_classes: Arc::new(MemoryApi::cluster(j())),
            uploads: Arc::new(MemoryApi::namespaced(j())),
            downloads: Arc::new(MemoryApi::namespaced(j())),
            backups: Arc::new(MemoryApi::namespaced(j())),
            journal,
        }
    }

    /// The facade bundle over these stores.
    pub fn clients(&self) -> Clients {
        Clients {
            volumes: self.volumes.clone(),
            pods: self.pods.clone(),
            storage_classes: self.storage_classes.clone(),
            config_maps: self.config_maps.clone(),
            snapshots: self.snapshots.clone(),
            contents: self.contents.clone(),
            snapshot_classes: self.snapshot_classes.clone(),
            uploads: self.uploads.clone(),
            downloads: self.downloads.clone(),
            backups: self.backups.clone(),
        }
    }
}

/// Labels as an owned map, for building fixtures.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}
