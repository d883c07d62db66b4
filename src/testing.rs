//! Test support: an in-memory store, a scripted external client and a small
//! set of test kinds (a `Database` managed resource that references a
//! `Network`, claimed through a `DatabaseClaim` against a `DatabaseClass`).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controller::managed::{
    ExternalClient, ExternalConnecter, ExternalCreation, ExternalObservation, ExternalUpdate,
};
use crate::crd::{ClaimSpec, ClassSpecTemplate, ObjectReference, ResourceSpec, ResourceStatus};
use crate::error::{Error, Result};
use crate::resource::{Claim, Class, Conditioned, Managed, Object};
use crate::store::Store;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "test.managed-runtime.io",
    version = "v1alpha1",
    kind = "Database",
    status = "ResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    #[serde(flatten)]
    pub resource: ResourceSpec,
    #[serde(default)]
    pub size: String,
    /// Network the database is placed in, resolved into `network_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "test.managed-runtime.io",
    version = "v1alpha1",
    kind = "Network",
    status = "ResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(flatten)]
    pub resource: ResourceSpec,
    #[serde(default)]
    pub cidr: String,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "test.managed-runtime.io",
    version = "v1alpha1",
    kind = "DatabaseClaim",
    namespaced,
    status = "ResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClaimSpec {
    #[serde(flatten)]
    pub claim: ClaimSpec,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "test.managed-runtime.io",
    version = "v1alpha1",
    kind = "DatabaseClass"
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClassSpec {
    #[serde(flatten)]
    pub template: ClassSpecTemplate,
    #[serde(default)]
    pub size: String,
}

macro_rules! impl_conditioned {
    ($($kind:ty),*) => {
        $(
            impl Conditioned for $kind {
                fn resource_status(&self) -> Option<&ResourceStatus> {
                    self.status.as_ref()
                }

                fn resource_status_mut(&mut self) -> &mut ResourceStatus {
                    self.status.get_or_insert_with(Default::default)
                }
            }
        )*
    };
}

impl_conditioned!(Database, Network, DatabaseClaim);

impl Managed for Database {
    fn resource_spec(&self) -> &ResourceSpec {
        &self.spec.resource
    }

    fn resource_spec_mut(&mut self) -> &mut ResourceSpec {
        &mut self.spec.resource
    }
}

impl Managed for Network {
    fn resource_spec(&self) -> &ResourceSpec {
        &self.spec.resource
    }

    fn resource_spec_mut(&mut self) -> &mut ResourceSpec {
        &mut self.spec.resource
    }
}

impl Claim for DatabaseClaim {
    fn claim_spec(&self) -> &ClaimSpec {
        &self.spec.claim
    }

    fn claim_spec_mut(&mut self) -> &mut ClaimSpec {
        &mut self.spec.claim
    }
}

impl Class for DatabaseClass {
    fn template(&self) -> &ClassSpecTemplate {
        &self.spec.template
    }
}

/// The managed resource a `DatabaseClass` provisions
pub fn database_from_class(class: &DatabaseClass) -> Database {
    let mut db = Database::new(
        "",
        DatabaseSpec {
            size: class.spec.size.clone(),
            ..Default::default()
        },
    );
    db.metadata.name = None;
    db
}

pub fn reference(kind: &str, namespace: Option<&str>, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: "test.managed-runtime.io/v1alpha1".to_string(),
        kind: kind.to_string(),
        namespace: namespace.map(str::to_string),
        name: name.to_string(),
        uid: None,
    }
}

/// Store operations, for failure injection and call accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    Conflict,
    Other,
}

type Key = (Option<String>, String);

struct Inner<K> {
    objects: BTreeMap<Key, K>,
    next_id: u64,
    failures: HashMap<Op, Failure>,
    calls: Vec<(Op, String)>,
}

/// In-memory [`Store`] with resource versions, generated names and the
/// deletion semantics of the API server: deleting an object that carries
/// finalizers only marks it, and it disappears once the last finalizer is
/// removed. Whole objects are stored, status included.
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K: Object> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> MemoryStore<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                next_id: 1,
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Arc<Self> {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        Arc::new(store)
    }

    /// Seed an object, assigning a UID and resource version when missing
    pub fn insert(&self, mut obj: K) -> K {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(|| format!("uid-{id}"));
        meta.resource_version.get_or_insert_with(|| "1".to_string());
        inner.objects.insert(key_of(&obj), obj.clone());
        obj
    }

    /// Current stored copy, bypassing failure injection and call accounting
    pub fn stored(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(namespace.map(str::to_string), name.to_string()))
            .cloned()
    }

    /// Every stored object, bypassing failure injection and call accounting
    pub fn all(&self) -> Vec<K> {
        self.inner.lock().unwrap().objects.values().cloned().collect()
    }

    /// Make every call of `op` fail until cleared
    pub fn fail(&self, op: Op, failure: Failure) {
        self.inner.lock().unwrap().failures.insert(op, failure);
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    pub fn calls(&self) -> Vec<(Op, String)> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .count()
    }

    fn record(inner: &mut Inner<K>, op: Op, name: &str) -> Result<()> {
        inner.calls.push((op, name.to_string()));
        match inner.failures.get(&op) {
            None => Ok(()),
            Some(Failure::NotFound) => Err(not_found::<K>(name)),
            Some(Failure::Conflict) => Err(conflict::<K>(name)),
            Some(Failure::Other) => Err(Error::External(anyhow::anyhow!(
                "injected {op:?} failure for {name}"
            ))),
        }
    }

    fn write(inner: &mut Inner<K>, op: Op, obj: &K) -> Result<K> {
        let name = obj.name_any();
        Self::record(inner, op, &name)?;
        let key = key_of(obj);
        let Some(current) = inner.objects.get(&key) else {
            return Err(not_found::<K>(&name));
        };
        if obj.resource_version().is_some() && obj.resource_version() != current.resource_version()
        {
            return Err(conflict::<K>(&name));
        }

        let mut next = obj.clone();
        next.meta_mut().uid = current.uid();
        next.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        next.meta_mut().resource_version = Some(bump(current.resource_version()));
        if next.meta().deletion_timestamp.is_some() && next.finalizers().is_empty() {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, next.clone());
        }
        Ok(next)
    }
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.namespace(), obj.name_any())
}

fn bump(version: Option<String>) -> String {
    let current: u64 = version.and_then(|v| v.parse().ok()).unwrap_or(0);
    (current + 1).to_string()
}

fn not_found<K: Object>(name: &str) -> Error {
    Error::NotFound {
        kind: K::kind(&()).to_string(),
        name: name.to_string(),
    }
}

fn conflict<K: Object>(name: &str) -> Error {
    Error::Conflict {
        kind: K::kind(&()).to_string(),
        name: name.to_string(),
    }
}

fn matches_selector<K: Resource>(obj: &K, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => obj.labels().get(k).is_some_and(|l| l == v),
            None => obj.labels().contains_key(term),
        })
}

#[async_trait]
impl<K: Object> Store<K> for MemoryStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, Op::Get, name)?;
        inner
            .objects
            .get(&(namespace.map(str::to_string), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found::<K>(name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, Op::List, label_selector)?;
        Ok(inner
            .objects
            .values()
            .filter(|o| namespace.is_none() || o.namespace().as_deref() == namespace)
            .filter(|o| matches_selector(*o, label_selector))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        let mut obj = obj.clone();
        let id = inner.next_id;
        inner.next_id += 1;
        if obj.meta().name.as_deref().unwrap_or_default().is_empty() {
            let prefix = obj.meta().generate_name.clone().unwrap_or_default();
            obj.meta_mut().name = Some(format!("{prefix}{id:05}"));
        }
        let name = obj.name_any();
        Self::record(&mut inner, Op::Create, &name)?;

        let key = key_of(&obj);
        if inner.objects.contains_key(&key) {
            return Err(conflict::<K>(&name));
        }
        obj.meta_mut().uid = Some(format!("uid-{id}"));
        obj.meta_mut().resource_version = Some("1".to_string());
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, Op::Update, obj)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let mut inner = self.inner.lock().unwrap();
        Self::write(&mut inner, Op::UpdateStatus, obj)
    }

    async fn delete(&self, obj: &K) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let name = obj.name_any();
        Self::record(&mut inner, Op::Delete, &name)?;
        let key = key_of(obj);
        let Some(current) = inner.objects.get_mut(&key) else {
            return Err(not_found::<K>(&name));
        };
        if current.finalizers().is_empty() {
            inner.objects.remove(&key);
        } else if current.meta().deletion_timestamp.is_none() {
            current.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
            current.meta_mut().resource_version = Some(bump(current.resource_version()));
        }
        Ok(())
    }
}

/// Mark a seeded object as deleted while finalizers hold it
pub fn mark_deleted<K: Resource>(obj: &mut K) {
    obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
}

/// External client that answers from a script and records every call.
/// Clones share the script and the call log.
#[derive(Clone, Default)]
pub struct FakeExternal {
    observation: Arc<Mutex<ExternalObservation>>,
    creation: Arc<Mutex<ExternalCreation>>,
    update: Arc<Mutex<ExternalUpdate>>,
    failing: Arc<Mutex<Option<&'static str>>>,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl FakeExternal {
    pub fn new(observation: ExternalObservation) -> Self {
        let fake = Self::default();
        fake.set_observation(observation);
        fake
    }

    pub fn set_observation(&self, observation: ExternalObservation) {
        *self.observation.lock().unwrap() = observation;
    }

    pub fn set_creation(&self, creation: ExternalCreation) {
        *self.creation.lock().unwrap() = creation;
    }

    pub fn set_update(&self, update: ExternalUpdate) {
        *self.update.lock().unwrap() = update;
    }

    /// Fail the named operation (`connect`, `observe`, `create`, `update` or `delete`)
    pub fn fail(&self, op: &'static str) {
        *self.failing.lock().unwrap() = Some(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    fn call(&self, op: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(op);
        if *self.failing.lock().unwrap() == Some(op) {
            return Err(Error::External(anyhow::anyhow!("external {op} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl<M: Managed> ExternalConnecter<M> for FakeExternal {
    async fn connect(&self, _mr: &M) -> Result<Box<dyn ExternalClient<M>>> {
        self.call("connect")?;
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl<M: Managed> ExternalClient<M> for FakeExternal {
    async fn observe(&self, _mr: &mut M) -> Result<ExternalObservation> {
        self.call("observe")?;
        Ok(self.observation.lock().unwrap().clone())
    }

    async fn create(&self, _mr: &mut M) -> Result<ExternalCreation> {
        self.call("create")?;
        Ok(self.creation.lock().unwrap().clone())
    }

    async fn update(&self, _mr: &mut M) -> Result<ExternalUpdate> {
        self.call("update")?;
        Ok(self.update.lock().unwrap().clone())
    }

    async fn delete(&self, _mr: &mut M) -> Result<()> {
        self.call("delete")
    }
}

/// Connection details from string pairs
pub fn details(pairs: &[(&str, &str)]) -> crate::resource::ConnectionDetails {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect()
}
