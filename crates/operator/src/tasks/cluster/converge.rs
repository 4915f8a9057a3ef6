//! Convergence engine: make observed objects match rendered ones.
//!
//! Absent objects are created with a controller owner reference to the
//! cluster. Present objects only have their authoritative fields compared and
//! written, so fields set by the platform or other actors survive. Claims,
//! generated secrets, namespaces and jobs are never mutated once created.

use super::material::{MaterialGenerator, TlsMaterial};
use super::resources::{DesiredResource, SecretDescriptor, SecretMaterial};
use super::store::{CreateOutcome, ObjectStore, StoreObject};
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What applying one resource did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
    /// Create-once object already present, or a create lost a race
    AlreadyExists,
}

pub struct ConvergenceEngine<'a, S: ObjectStore, G: MaterialGenerator + ?Sized> {
    store: &'a S,
    generator: &'a G,
    owner: OwnerReference,
    cancel: CancellationToken,
}

impl<'a, S: ObjectStore, G: MaterialGenerator + ?Sized> ConvergenceEngine<'a, S, G> {
    pub fn new(
        store: &'a S,
        generator: &'a G,
        owner: OwnerReference,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            generator,
            owner,
            cancel,
        }
    }

    /// Apply one resource
    pub async fn apply(&self, desired: &DesiredResource) -> Result<Applied> {
        let applied = match desired {
            DesiredResource::Namespace(ns) => self.ensure_present(ns, false).await?,
            DesiredResource::Secret(descriptor) => self.ensure_secret(descriptor).await?,
            DesiredResource::ConfigMap(cm) => self.upsert(cm, patch_config_map).await?,
            DesiredResource::Deployment(deployment) => {
                self.upsert(deployment, patch_deployment).await?
            }
            DesiredResource::Service(service) => self.upsert(service, patch_service).await?,
            DesiredResource::PersistentVolumeClaim(pvc) => self.ensure_present(pvc, true).await?,
            DesiredResource::Job(job) => self.ensure_present(job, true).await?,
        };

        match applied {
            Applied::Created | Applied::Updated => info!("{desired}: {applied:?}"),
            Applied::Unchanged | Applied::AlreadyExists => debug!("{desired}: {applied:?}"),
        }
        Ok(applied)
    }

    /// Apply resources in order, stopping at the first failure
    pub async fn apply_all<'r>(
        &self,
        resources: impl IntoIterator<Item = &'r DesiredResource>,
    ) -> Result<Vec<Applied>> {
        let mut applied = Vec::new();
        for resource in resources {
            applied.push(self.apply(resource).await?);
        }
        Ok(applied)
    }

    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        cancellable(&self.cancel, call).await
    }

    /// Read an object the pass does not render, such as the observed build job
    pub async fn observe<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        self.guarded(self.store.get(namespace, name)).await
    }

    pub async fn remove<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        self.guarded(self.store.delete::<K>(namespace, name)).await
    }

    fn owned<K: StoreObject>(&self, desired: &K) -> K {
        let mut object = desired.clone();
        object.meta_mut().owner_references = Some(vec![self.owner.clone()]);
        object
    }

    async fn create<K: StoreObject>(&self, object: &K) -> Result<Applied> {
        match self.guarded(self.store.create(object)).await? {
            CreateOutcome::Created(_) => Ok(Applied::Created),
            CreateOutcome::AlreadyExists => Ok(Applied::AlreadyExists),
        }
    }

    /// Create-once objects
    async fn ensure_present<K: StoreObject>(
        &self,
        desired: &K,
        with_owner: bool,
    ) -> Result<Applied> {
        let namespace = desired.namespace();
        let existing: Option<K> = self
            .guarded(self.store.get(namespace.as_deref(), &desired.name_any()))
            .await?;
        if existing.is_some() {
            return Ok(Applied::AlreadyExists);
        }

        if with_owner {
            self.create(&self.owned(desired)).await
        } else {
            self.create(desired).await
        }
    }

    async fn upsert<K: StoreObject>(
        &self,
        desired: &K,
        patch: fn(&mut K, &K) -> bool,
    ) -> Result<Applied> {
        let namespace = desired.namespace();
        let existing: Option<K> = self
            .guarded(self.store.get(namespace.as_deref(), &desired.name_any()))
            .await?;

        let Some(mut observed) = existing else {
            return self.create(&self.owned(desired)).await;
        };
        if !patch(&mut observed, desired) {
            return Ok(Applied::Unchanged);
        }
        self.guarded(self.store.replace(&observed)).await?;
        Ok(Applied::Updated)
    }

    /// Material is generated only after the secret is observed absent
    async fn ensure_secret(&self, descriptor: &SecretDescriptor) -> Result<Applied> {
        let existing: Option<Secret> = self
            .guarded(
                self.store
                    .get(Some(descriptor.namespace.as_str()), &descriptor.name),
            )
            .await?;
        if existing.is_some() {
            return Ok(Applied::AlreadyExists);
        }

        let (secret_type, data) = match &descriptor.material {
            SecretMaterial::Core => ("Opaque", self.generator.core_secret_data()?),
            SecretMaterial::SelfSignedTls {
                common_name,
                dns_names,
            } => {
                let TlsMaterial { cert_pem, key_pem } = self
                    .generator
                    .self_signed(common_name.as_deref().unwrap_or_default(), dns_names)?;
                let mut data = BTreeMap::new();
                data.insert("tls.crt".to_string(), cert_pem);
                data.insert("tls.key".to_string(), key_pem);
                ("kubernetes.io/tls", data)
            }
        };

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(descriptor.name.clone()),
                namespace: Some(descriptor.namespace.clone()),
                labels: Some(descriptor.labels.clone()),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            type_: Some(secret_type.to_string()),
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v.into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.create(&secret).await
    }
}

/// Run a store call unless `cancel` fires first
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = call => result,
    }
}

/// ConfigMap data is authoritative
fn patch_config_map(observed: &mut ConfigMap, desired: &ConfigMap) -> bool {
    if observed.data == desired.data {
        return false;
    }
    observed.data = desired.data.clone();
    true
}

/// Replica count and the first container's image are authoritative
fn patch_deployment(observed: &mut Deployment, desired: &Deployment) -> bool {
    let (Some(observed_spec), Some(desired_spec)) = (observed.spec.as_mut(), desired.spec.as_ref())
    else {
        return false;
    };

    let mut changed = false;
    if observed_spec.replicas != desired_spec.replicas {
        observed_spec.replicas = desired_spec.replicas;
        changed = true;
    }

    let desired_image = desired_spec
        .template
        .spec
        .as_ref()
        .and_then(|pod| pod.containers.first())
        .and_then(|c| c.image.clone());
    let observed_container = observed_spec
        .template
        .spec
        .as_mut()
        .and_then(|pod| pod.containers.first_mut());
    if let (Some(container), Some(image)) = (observed_container, desired_image) {
        if container.image.as_deref() != Some(image.as_str()) {
            container.image = Some(image);
            changed = true;
        }
    }

    changed
}

fn port_key(port: &ServicePort) -> (Option<&str>, i32, Option<String>, &str) {
    (
        port.name.as_deref(),
        port.port,
        port.target_port.as_ref().map(|t| match t {
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(i) => i.to_string(),
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s) => s.clone(),
        }),
        port.protocol.as_deref().unwrap_or("TCP"),
    )
}

/// Selector and ports are authoritative; assigned node ports are kept
fn patch_service(observed: &mut Service, desired: &Service) -> bool {
    let (Some(observed_spec), Some(desired_spec)) = (observed.spec.as_mut(), desired.spec.as_ref())
    else {
        return false;
    };

    let mut changed = false;
    if observed_spec.selector != desired_spec.selector {
        observed_spec.selector = desired_spec.selector.clone();
        changed = true;
    }

    let observed_ports = observed_spec.ports.clone().unwrap_or_default();
    let desired_ports = desired_spec.ports.clone().unwrap_or_default();
    let same_ports = observed_ports.len() == desired_ports.len()
        && observed_ports
            .iter()
            .zip(&desired_ports)
            .all(|(o, d)| port_key(o) == port_key(d));
    if !same_ports {
        let merged = desired_ports
            .into_iter()
            .map(|mut port| {
                port.node_port = observed_ports
                    .iter()
                    .find(|o| o.name == port.name)
                    .and_then(|o| o.node_port);
                port
            })
            .collect();
        observed_spec.ports = Some(merged);
        changed = true;
    }

    changed
}
