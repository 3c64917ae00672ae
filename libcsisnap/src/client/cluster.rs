//! [`ObjectApi`] backed by a live API server through `kube`.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use super::{Clients, ObjectApi, Selector, selector_string};
use crate::error::ClientError;

/// Builds the `Api` handle for a namespace.
type ApiFactory<K> = fn(Client, &str) -> Api<K>;

/// A `kube` client bound to one resource kind.
pub struct KubeApi<K> {
    client: Client,
    api: ApiFactory<K>,
}

impl<K> KubeApi<K>
where
    K: Resource<DynamicType = ()>,
{
    /// Client for a cluster-scoped kind. The namespace argument is ignored.
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api: |c, _| Api::all(c),
        }
    }
}

impl<K> KubeApi<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    /// Client for a namespaced kind. An empty namespace addresses all
    /// namespaces.
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api: |c, ns| {
                if ns.is_empty() {
                    Api::all(c)
                } else {
                    Api::namespaced(c, ns)
                }
            },
        }
    }
}

impl<K> KubeApi<K>
where
    K: Resource<DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        (self.api)(self.client.clone(), namespace)
    }
}

/// Map a `kube` error onto the facade's error kinds.
fn map_err<K: Resource<DynamicType = ()>>(namespace: &str, name: &str, e: kube::Error) -> ClientError {
    let kind = K::kind(&()).into_owned();
    let name = if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{namespace}/{name}")
    };
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound { kind, name },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClientError::AlreadyExists { kind, name }
        }
        kube::Error::SerdeError(e) => ClientError::serialization(e),
        other => ClientError::api(other),
    }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ClientError> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| map_err::<K>(namespace, name, e))
    }

    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>, ClientError> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| map_err::<K>(namespace, "", e))?;
        Ok(list.items)
    }

    #[instrument(skip(self, object), fields(kind = %K::kind(&())))]
    async fn create(&self, namespace: &str, object: &K) -> Result<K, ClientError> {
        let meta = object.meta();
        let name = meta
            .name
            .clone()
            .or_else(|| meta.generate_name.clone())
            .unwrap_or_default();
        let created = self
            .api(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_err::<K>(namespace, &name, e))?;
        debug!(name = ?created.meta().name, "object created");
        Ok(created)
    }

    #[instrument(skip(self, patch), fields(kind = %K::kind(&())))]
    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClientError> {
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err::<K>(namespace, name, e))
    }

    #[instrument(skip(self), fields(kind = %K::kind(&())))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err::<K>(namespace, name, e))
    }
}

impl Clients {
    /// Bundle backed by a live cluster.
    pub fn from_kube(client: Client) -> Self {
        Self {
            volumes: Arc::new(KubeApi::cluster(client.clone())),
            pods: Arc::new(KubeApi::namespaced(client.clone())),
            storage_classes: Arc::new(KubeApi::cluster(client.clone())),
            config_maps: Arc::new(KubeApi::namespaced(client.clone())),
            snapshots: Arc::new(KubeApi::namespaced(client.clone())),
            contents: Arc::new(KubeApi::cluster(client.clone())),
            snapshot_classes: Arc::new(KubeApi::cluster(client.clone())),
            uploads: Arc::new(KubeApi::namespaced(client.clone())),
            downloads: Arc::new(KubeApi::namespaced(client.clone())),
            backups: Arc::new(KubeApi::namespaced(client)),
        }
    }
}
