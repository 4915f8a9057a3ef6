//! Access to the control plane.
//!
//! The convergence engine and the build state machine only ever talk to an
//! [`ObjectStore`]. [`KubeStore`] is the API-server implementation;
//! [`MemoryStore`] keeps objects in memory and records every call.

use crate::crds::{HonseFarmCluster, HonseFarmClusterStatus};
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams,
};
use kube::core::ErrorResponse;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Typed objects the store can read and write
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome<K> {
    Created(K),
    /// Someone else created the object first
    AlreadyExists,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the object does not exist
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn create<K: StoreObject>(&self, object: &K) -> Result<CreateOutcome<K>>;

    /// Full update; `object` must carry the observed resource version
    async fn replace<K: StoreObject>(&self, object: &K) -> Result<K>;

    /// `Ok(false)` when there was nothing to delete
    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool>;

    async fn patch_cluster_status(&self, name: &str, status: &HonseFarmClusterStatus)
        -> Result<()>;
}

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn to_dynamic<K: StoreObject>(object: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

fn from_dynamic<K: StoreObject>(object: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        match self.api::<K>(namespace).get_opt(name).await? {
            Some(object) => Ok(Some(from_dynamic(object)?)),
            None => Ok(None),
        }
    }

    async fn create<K: StoreObject>(&self, object: &K) -> Result<CreateOutcome<K>> {
        let api = self.api::<K>(object.namespace().as_deref());
        match api.create(&PostParams::default(), &to_dynamic(object)?).await {
            Ok(created) => Ok(CreateOutcome::Created(from_dynamic(created)?)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(
                    kind = %K::kind(&()),
                    name = %object.name_any(),
                    "Create lost a race, object already exists"
                );
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace<K: StoreObject>(&self, object: &K) -> Result<K> {
        let api = self.api::<K>(object.namespace().as_deref());
        let replaced = api
            .replace(&object.name_any(), &PostParams::default(), &to_dynamic(object)?)
            .await?;
        from_dynamic(replaced)
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_cluster_status(
        &self,
        name: &str,
        status: &HonseFarmClusterStatus,
    ) -> Result<()> {
        let clusters: Api<HonseFarmCluster> = Api::all(self.client.clone());
        let patch = json!({ "status": status });
        clusters
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Store operation, as recorded by [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    Get,
    Create,
    Replace,
    Delete,
    PatchStatus,
}

impl Verb {
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

type ObjectKey = (String, Option<String>, String);

#[derive(Debug, Clone)]
struct Fault {
    verb: Verb,
    kind: String,
    code: u16,
}

/// In-memory object store with a call log and fault injection
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    calls: Mutex<Vec<StoreCall>>,
    faults: Mutex<Vec<Fault>>,
    revision: Mutex<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn api_error(code: u16, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: match code {
            404 => "NotFound",
            409 => "AlreadyExists",
            _ => "ServiceUnavailable",
        }
        .to_string(),
        code,
    }))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite an object without recording a call
    pub fn insert<K: StoreObject>(&self, object: &K) -> Result<()> {
        let key = (K::kind(&()).to_string(), object.namespace(), object.name_any());
        lock(&self.objects).insert(key, serde_json::to_value(object)?);
        Ok(())
    }

    /// Read an object without recording a call
    pub fn object<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = (
            K::kind(&()).to_string(),
            namespace.map(String::from),
            name.to_string(),
        );
        lock(&self.objects)
            .get(&key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn count<K: StoreObject>(&self) -> usize {
        let kind = K::kind(&());
        lock(&self.objects)
            .keys()
            .filter(|(k, _, _)| k.as_str() == kind)
            .count()
    }

    /// Fail every `verb` on `kind` with the given HTTP status until cleared.
    /// A 409 on create surfaces as a lost race.
    pub fn inject_fault(&self, verb: Verb, kind: &str, code: u16) {
        lock(&self.faults).push(Fault {
            verb,
            kind: kind.to_string(),
            code,
        });
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    pub fn mutating_calls(&self) -> Vec<StoreCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.verb.is_mutating())
            .cloned()
            .collect()
    }

    pub fn calls_for(&self, verb: Verb, kind: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, verb: Verb, kind: &str, namespace: Option<&str>, name: &str) -> Option<u16> {
        lock(&self.calls).push(StoreCall {
            verb,
            kind: kind.to_string(),
            namespace: namespace.map(String::from),
            name: name.to_string(),
        });
        lock(&self.faults)
            .iter()
            .find(|f| f.verb == verb && f.kind == kind)
            .map(|f| f.code)
    }

    fn next_revision(&self) -> String {
        let mut revision = lock(&self.revision);
        *revision += 1;
        revision.to_string()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let kind = K::kind(&());
        if let Some(code) = self.record(Verb::Get, &kind, namespace, name) {
            return Err(api_error(code, format!("get {kind} {name} failed")));
        }
        let key = (kind.to_string(), namespace.map(String::from), name.to_string());
        let stored = lock(&self.objects).get(&key).cloned();
        match stored {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn create<K: StoreObject>(&self, object: &K) -> Result<CreateOutcome<K>> {
        let kind = K::kind(&());
        let namespace = object.namespace();
        let name = object.name_any();
        match self.record(Verb::Create, &kind, namespace.as_deref(), &name) {
            Some(409) => return Ok(CreateOutcome::AlreadyExists),
            Some(code) => return Err(api_error(code, format!("create {kind} {name} failed"))),
            None => {}
        }

        let key = (kind.to_string(), namespace, name);
        let mut created = object.clone();
        created.meta_mut().resource_version = Some(self.next_revision());
        if created.meta().uid.is_none() {
            created.meta_mut().uid = Some(format!("uid-{}", key.2));
        }

        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        objects.insert(key, serde_json::to_value(&created)?);
        Ok(CreateOutcome::Created(created))
    }

    async fn replace<K: StoreObject>(&self, object: &K) -> Result<K> {
        let kind = K::kind(&());
        let namespace = object.namespace();
        let name = object.name_any();
        if let Some(code) = self.record(Verb::Replace, &kind, namespace.as_deref(), &name) {
            return Err(api_error(code, format!("replace {kind} {name} failed")));
        }

        let key = (kind.to_string(), namespace, name.clone());
        if !lock(&self.objects).contains_key(&key) {
            return Err(api_error(404, format!("{kind} {name} not found")));
        }
        let mut replaced = object.clone();
        replaced.meta_mut().resource_version = Some(self.next_revision());
        lock(&self.objects).insert(key, serde_json::to_value(&replaced)?);
        Ok(replaced)
    }

    async fn delete<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        let kind = K::kind(&());
        if let Some(code) = self.record(Verb::Delete, &kind, namespace, name) {
            return Err(api_error(code, format!("delete {kind} {name} failed")));
        }
        let key = (kind.to_string(), namespace.map(String::from), name.to_string());
        Ok(lock(&self.objects).remove(&key).is_some())
    }

    async fn patch_cluster_status(
        &self,
        name: &str,
        status: &HonseFarmClusterStatus,
    ) -> Result<()> {
        let kind = HonseFarmCluster::kind(&());
        if let Some(code) = self.record(Verb::PatchStatus, &kind, None, name) {
            return Err(api_error(code, format!("patch status of {name} failed")));
        }
        let key = (kind.to_string(), None, name.to_string());
        let mut objects = lock(&self.objects);
        let Some(stored) = objects.get_mut(&key) else {
            return Err(api_error(404, format!("{kind} {name} not found")));
        };
        json_patch::merge(stored, &json!({ "status": status }));
        Ok(())
    }
}
