//! Object access used by the reconcilers: the API server in production, an
//! in-memory map in tests.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    core::NamespaceResourceScope,
    Api, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    /// `namespace` is ignored for cluster-scoped kinds. `list` with an empty
    /// namespace spans all of them.
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error>;
    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>)
        -> Result<Vec<K>, Error>;
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, Error>;
    /// Full update guarded by the object's resourceVersion.
    async fn replace(&self, obj: &K) -> Result<K, Error>;
    async fn replace_status(&self, obj: &K) -> Result<K, Error>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join(",")
}

pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

pub struct KubeStore<K> {
    client: kube::Client,
    api: fn(kube::Client, &str) -> Api<K>,
}

/// An empty namespace lists across all namespaces.
fn namespaced_api<K>(client: kube::Client, namespace: &str) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    if namespace.is_empty() {
        Api::all(client)
    } else {
        Api::namespaced(client, namespace)
    }
}

fn cluster_api<K>(client: kube::Client, _namespace: &str) -> Api<K>
where
    K: Resource<DynamicType = ()>,
{
    Api::all(client)
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn cluster(client: kube::Client) -> Self {
        KubeStore {
            client,
            api: cluster_api::<K>,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn namespaced(client: kube::Client) -> Self {
        KubeStore {
            client,
            api: namespaced_api::<K>,
        }
    }
}

impl<K> KubeStore<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        (self.api)(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn list(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, Error> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, Error> {
        Ok(self.api(namespace).create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> Result<K, Error> {
        let namespace = obj.namespace().unwrap_or_default();
        Ok(self
            .api(&namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status(&self, obj: &K) -> Result<K, Error> {
        let namespace = obj.namespace().unwrap_or_default();
        let data = serde_json::to_vec(obj)?;
        Ok(self
            .api(&namespace)
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.api(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("app".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[test]
    fn selector_string_is_sorted() {
        let labels = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "a=1,b=2");
    }

    #[tokio::test]
    async fn memory_store_filters_by_labels() {
        let store = MemoryStore::<Pod>::default();
        store.seed(pod("a", &[("app", "web")]));
        store.seed(pod("b", &[("app", "db")]));
        let selector = BTreeMap::from([("app".to_string(), "web".to_string())]);
        let found = store.list("app", &selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_writes() {
        let store = MemoryStore::<Pod>::default();
        let seeded = store.seed(pod("a", &[]));
        store.replace(&seeded).await.unwrap();
        let err = store.replace(&seeded).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.delete("app", "missing").await.unwrap_err().is_not_found());
    }
}
