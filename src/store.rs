//! Access to the declarative store
//!
//! Reconcilers talk to the store through [`Store`] so that the state machines
//! can be driven against the Kubernetes API in production and an in-memory
//! store in tests. [`KubeStore`] is the Kubernetes implementation; it maps
//! 404 responses to [`Error::NotFound`] and 409 responses to
//! [`Error::Conflict`] so callers can classify failures without inspecting
//! HTTP details.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};

use crate::error::{Error, Result};
use crate::resource::Object;

/// Identifies the record a reconcile works on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    pub namespace: Option<String>,
    pub name: String,
}

impl Request {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn for_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Typed reads and writes against the store.
///
/// Writes use optimistic concurrency: `update` and `update_status` fail with
/// [`Error::Conflict`] when the object's resource version is stale.
#[async_trait]
pub trait Store<K>: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    /// List objects matching a label selector (empty selects everything)
    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace the object, excluding its status
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource
    async fn update_status(&self, obj: &K) -> Result<K>;

    async fn delete(&self, obj: &K) -> Result<()>;
}

type ApiFor<K> = fn(Client, Option<&str>) -> Api<K>;

/// [`Store`] backed by the Kubernetes API
pub struct KubeStore<K> {
    client: Client,
    api_for: ApiFor<K>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Object> KubeStore<K> {
    /// Store for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: |client: Client, _: Option<&str>| Api::all(client),
            _kind: PhantomData,
        }
    }

    /// Store for a namespaced kind; a `None` namespace addresses all namespaces
    pub fn namespaced(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            client,
            api_for: |client: Client, namespace: Option<&str>| match namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }
}

#[async_trait]
impl<K: Object> Store<K> for KubeStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), label_selector))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.api(obj.namespace().as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &obj.name_any()))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api(obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &name))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        self.api(obj.namespace().as_deref())
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &name))
    }

    async fn delete(&self, obj: &K) -> Result<()> {
        let name = obj.name_any();
        self.api(obj.namespace().as_deref())
            .delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(e, &Self::kind(), &name))?;
        Ok(())
    }
}
