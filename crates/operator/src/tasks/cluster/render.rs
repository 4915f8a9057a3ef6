//! Desired state of a cluster.
//!
//! Rendering is pure: the same cluster object always yields the same
//! resources in the same order. Secret data is not rendered; secrets are
//! described by the material they hold and generated on first creation.

use super::appsettings;
use super::build::{build_job, registry_image};
use super::naming::{
    ComponentKind, ResourceNaming, CONFIG_BUNDLE_NAME, CORE_SECRET_NAME, TLS_SECRET_NAME,
};
use super::resources::{DesiredResource, SecretDescriptor, SecretMaterial};
use super::tunnel::render_tunnel;
use crate::crds::{ComponentSpec, HonseFarmCluster, ShardSpec, StorageSpec};
use crate::tasks::config::OperatorConfig;
use crate::tasks::types::{
    Error, Result, COMPONENT_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, NAME_LABEL, PVC_LABEL,
    SHARD_LABEL,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

const CONFIG_MOUNT_PATH: &str = "/app/config";
const DATA_MOUNT_PATH: &str = "/data";
const SELF_SIGNED_MODE: &str = "selfsigned";

/// When a rendered resource may be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Applied on every pass
    Core,
    /// Workloads running images the build job produces; applied once built
    Runtime,
    /// cloudflared; failures are reported on the tunnel status only
    Tunnel,
    /// The build job; created by the build state machine
    Build,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub stage: Stage,
    pub resource: DesiredResource,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPlan {
    pub resources: Vec<Rendered>,
    /// Set when the tunnel could not be rendered; the rest of the plan stands
    pub tunnel_error: Option<String>,
}

impl RenderPlan {
    pub fn stage(&self, stage: Stage) -> impl Iterator<Item = &DesiredResource> {
        self.resources
            .iter()
            .filter(move |r| r.stage == stage)
            .map(|r| &r.resource)
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        self.resources.iter().any(|r| r.stage == stage)
    }
}

/// Every resource the cluster should contain, in apply order
pub fn render(cluster: &HonseFarmCluster, config: &OperatorConfig) -> Result<Vec<DesiredResource>> {
    Ok(render_plan(cluster, config)?
        .resources
        .into_iter()
        .map(|r| r.resource)
        .collect())
}

/// One enabled workload: a component or one shard
struct Workload<'a> {
    kind: ComponentKind,
    shard: Option<&'a str>,
    replicas: Option<i32>,
    storage: Option<&'a StorageSpec>,
}

impl<'a> Workload<'a> {
    fn component(kind: ComponentKind, spec: &'a ComponentSpec) -> Self {
        Self {
            kind,
            shard: None,
            replicas: spec.replicas,
            storage: spec.storage.as_ref(),
        }
    }

    fn shard(spec: &'a ShardSpec) -> Self {
        Self {
            kind: ComponentKind::ShardFileserver,
            shard: Some(spec.name.as_str()),
            replicas: spec.replicas,
            storage: spec.storage.as_ref(),
        }
    }

    /// Storage with a size; anything else means no claim
    fn storage(&self) -> Option<&'a StorageSpec> {
        self.storage.filter(|s| !s.size.trim().is_empty())
    }
}

fn enabled_workloads(cluster: &HonseFarmCluster) -> Result<Vec<Workload<'_>>> {
    let mut workloads = Vec::new();
    let Some(components) = cluster.spec.components.as_ref() else {
        return Ok(workloads);
    };

    if let Some(server) = components.server.as_ref() {
        workloads.push(Workload::component(ComponentKind::Server, server));
    }
    if let Some(admin) = components.admin_panel.as_ref() {
        workloads.push(Workload::component(ComponentKind::AdminPanel, admin));
    }
    if let Some(fileservers) = components.fileservers.as_ref() {
        if let Some(main) = fileservers.main.as_ref() {
            workloads.push(Workload::component(ComponentKind::MainFileserver, main));
        }
        let mut seen = BTreeSet::new();
        for (index, shard) in fileservers.shards.iter().enumerate() {
            let field = format!("spec.components.fileservers.shards[{index}].name");
            if shard.name.trim().is_empty() {
                return Err(Error::ConfigError(format!("{field} must be set")));
            }
            if !ResourceNaming::is_valid_shard_name(&shard.name) {
                return Err(Error::ConfigError(format!(
                    "{field} {:?} must be a lowercase DNS label of at most 47 characters",
                    shard.name
                )));
            }
            if !seen.insert(shard.name.as_str()) {
                return Err(Error::ConfigError(format!(
                    "{field} {:?} is used by more than one shard",
                    shard.name
                )));
            }
            workloads.push(Workload::shard(shard));
        }
    }

    Ok(workloads)
}

/// Image for a component and whether the build job produces it
fn resolve_image(cluster: &HonseFarmCluster, kind: ComponentKind) -> Result<(String, bool)> {
    let images = cluster.spec.images.as_ref();
    let explicit = match kind {
        ComponentKind::Server => images.and_then(|i| i.server.as_ref()),
        ComponentKind::AdminPanel => images.and_then(|i| i.admin_panel.as_ref()),
        ComponentKind::MainFileserver => images.and_then(|i| i.main_fileserver.as_ref()),
        ComponentKind::ShardFileserver => images.and_then(|i| i.shard_fileserver.as_ref()),
    };
    if let Some(image) = explicit.map(|i| i.trim()).filter(|i| !i.is_empty()) {
        return Ok((image.to_string(), false));
    }

    if cluster.is_build_mode() {
        let built = cluster
            .spec
            .build
            .as_ref()
            .and_then(|b| b.components.iter().find(|c| c.name == kind.id()));
        let registry = cluster
            .spec
            .registry
            .as_ref()
            .filter(|r| !r.host.trim().is_empty());
        if let (Some(built), Some(registry)) = (built, registry) {
            let image = format!(
                "{}:{}",
                registry_image(registry, &built.name),
                cluster.build_identifier()
            );
            return Ok((image, true));
        }
    }

    Err(Error::ConfigError(format!("{} must be set", kind.image_field())))
}

fn pod_labels(workload: &Workload<'_>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), workload.kind.id().to_string());
    if let Some(shard) = workload.shard {
        labels.insert(SHARD_LABEL.to_string(), shard.to_string());
    }
    labels
}

fn render_pvc(
    workload: &Workload<'_>,
    storage: &StorageSpec,
    namespace: &str,
) -> Result<DesiredResource> {
    let name = ResourceNaming::pvc_name(workload.kind, workload.shard);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(PVC_LABEL.to_string(), name.clone());

    let access_modes = if storage.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        storage.access_modes.clone()
    };

    let mut spec = json!({
        "accessModes": access_modes,
        "resources": { "requests": { "storage": storage.size.trim() } }
    });
    if let Some(storage_class) = storage
        .storage_class_name
        .as_ref()
        .filter(|s| !s.trim().is_empty())
    {
        spec["storageClassName"] = json!(storage_class);
    }

    let pvc = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": spec
    });
    Ok(DesiredResource::PersistentVolumeClaim(serde_json::from_value(pvc)?))
}

fn render_deployment(
    workload: &Workload<'_>,
    image: &str,
    namespace: &str,
) -> Result<DesiredResource> {
    let labels = pod_labels(workload);
    let kind = workload.kind;

    let mut volumes = vec![json!({
        "name": "config",
        "configMap": { "name": CONFIG_BUNDLE_NAME }
    })];
    let mut volume_mounts = vec![json!({
        "name": "config",
        "mountPath": CONFIG_MOUNT_PATH,
        "readOnly": true
    })];
    if workload.storage().is_some() {
        volumes.push(json!({
            "name": "data",
            "persistentVolumeClaim": {
                "claimName": ResourceNaming::pvc_name(kind, workload.shard)
            }
        }));
        volume_mounts.push(json!({ "name": "data", "mountPath": DATA_MOUNT_PATH }));
    }

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": ResourceNaming::deployment_name(kind, workload.shard),
            "namespace": namespace,
            "labels": labels
        },
        "spec": {
            "replicas": workload.replicas.unwrap_or(1),
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": kind.id(),
                        "image": image,
                        "ports": [{ "containerPort": kind.port() }],
                        "volumeMounts": volume_mounts
                    }],
                    "volumes": volumes
                }
            }
        }
    });
    Ok(DesiredResource::Deployment(serde_json::from_value(deployment)?))
}

fn render_service(workload: &Workload<'_>, namespace: &str) -> Result<DesiredResource> {
    let kind = workload.kind;
    let name = ResourceNaming::service_name(kind, workload.shard);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(NAME_LABEL.to_string(), name.clone());

    let mut selector = BTreeMap::new();
    selector.insert(COMPONENT_LABEL.to_string(), kind.id().to_string());
    if let Some(shard) = workload.shard {
        selector.insert(SHARD_LABEL.to_string(), shard.to_string());
    }

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": {
            "selector": selector,
            "ports": [{
                "name": "http",
                "port": kind.port(),
                "targetPort": kind.port(),
                "protocol": "TCP"
            }]
        }
    });
    Ok(DesiredResource::Service(serde_json::from_value(service)?))
}

fn managed_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Self-signed TLS material is rendered for mode `SelfSigned`, or when no
/// mode is given but DNS names are
fn render_tls(cluster: &HonseFarmCluster, namespace: &str) -> Result<Option<DesiredResource>> {
    let Some(certs) = cluster.spec.certificates.as_ref() else {
        return Ok(None);
    };
    let mode = certs.mode.as_deref().map(str::trim).unwrap_or_default();
    let self_signed = if mode.is_empty() {
        !certs.dns_names.is_empty()
    } else {
        mode.eq_ignore_ascii_case(SELF_SIGNED_MODE)
    };
    if !self_signed {
        return Ok(None);
    }

    let mut dns_names: Vec<String> = certs
        .dns_names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if dns_names.is_empty() && !cluster.spec.api_domain.trim().is_empty() {
        dns_names.push(cluster.spec.api_domain.trim().to_string());
    }
    let common_name = certs
        .common_name
        .as_ref()
        .map(|cn| cn.trim().to_string())
        .filter(|cn| !cn.is_empty());
    if common_name.is_none() && dns_names.is_empty() {
        return Err(Error::ConfigError(
            "spec.certificates needs dnsNames, commonName or spec.apiDomain".into(),
        ));
    }

    Ok(Some(DesiredResource::Secret(SecretDescriptor {
        name: TLS_SECRET_NAME.to_string(),
        namespace: namespace.to_string(),
        labels: managed_labels(),
        material: SecretMaterial::SelfSignedTls {
            common_name,
            dns_names,
        },
    })))
}

/// Render the full plan, tagging every resource with its stage
pub fn render_plan(cluster: &HonseFarmCluster, config: &OperatorConfig) -> Result<RenderPlan> {
    let namespace = cluster.target_namespace();
    let bundle_data = appsettings::build_config_bundle(&cluster.spec)?;
    let mut plan = RenderPlan::default();
    let mut tunnel_error = None;
    let mut push = |stage: Stage, resource: DesiredResource| {
        plan.resources.push(Rendered { stage, resource });
    };

    let ns = json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": namespace, "labels": managed_labels() }
    });
    push(Stage::Core, DesiredResource::Namespace(serde_json::from_value(ns)?));

    push(
        Stage::Core,
        DesiredResource::Secret(SecretDescriptor {
            name: CORE_SECRET_NAME.to_string(),
            namespace: namespace.to_string(),
            labels: managed_labels(),
            material: SecretMaterial::Core,
        }),
    );

    if let Some(tls) = render_tls(cluster, namespace)? {
        push(Stage::Core, tls);
    }

    let bundle = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": CONFIG_BUNDLE_NAME,
            "namespace": namespace,
            "labels": managed_labels()
        },
        "data": bundle_data
    });
    push(
        Stage::Core,
        DesiredResource::ConfigMap(serde_json::from_value(bundle)?),
    );

    // Resolve every image before emitting any workload so that a missing
    // image fails the whole component set
    let workloads = enabled_workloads(cluster)?;
    let images = workloads
        .iter()
        .map(|w| resolve_image(cluster, w.kind))
        .collect::<Result<Vec<_>>>()?;

    for (workload, (image, built)) in workloads.iter().zip(&images) {
        if let Some(storage) = workload.storage() {
            push(Stage::Core, render_pvc(workload, storage, namespace)?);
        }
        let stage = if *built { Stage::Runtime } else { Stage::Core };
        push(stage, render_deployment(workload, image, namespace)?);
    }

    for workload in &workloads {
        push(Stage::Core, render_service(workload, namespace)?);
    }

    match render_tunnel(cluster, &config.tunnel) {
        Ok(resources) => {
            for resource in resources {
                push(Stage::Tunnel, resource);
            }
        }
        Err(e) => tunnel_error = Some(e.to_string()),
    }

    if cluster.is_build_mode() {
        push(Stage::Build, DesiredResource::Job(build_job(cluster, &config.build)?));
    }

    plan.tunnel_error = tunnel_error;
    Ok(plan)
}
