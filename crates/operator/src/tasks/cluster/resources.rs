use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Service};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Which generated material a secret holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretMaterial {
    /// JWT signing secret and service passwords
    Core,
    /// `kubernetes.io/tls` secret with a fresh self-signed certificate
    SelfSignedTls {
        common_name: Option<String>,
        dns_names: Vec<String>,
    },
}

/// A secret whose data is generated on first creation only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretDescriptor {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub material: SecretMaterial,
}

/// One object the cluster should contain
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredResource {
    Namespace(Namespace),
    Secret(SecretDescriptor),
    ConfigMap(ConfigMap),
    Deployment(Deployment),
    Service(Service),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Job(Job),
}

impl DesiredResource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Namespace(_) => "Namespace",
            Self::Secret(_) => "Secret",
            Self::ConfigMap(_) => "ConfigMap",
            Self::Deployment(_) => "Deployment",
            Self::Service(_) => "Service",
            Self::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            Self::Job(_) => "Job",
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Namespace(o) => o.name_any(),
            Self::Secret(s) => s.name.clone(),
            Self::ConfigMap(o) => o.name_any(),
            Self::Deployment(o) => o.name_any(),
            Self::Service(o) => o.name_any(),
            Self::PersistentVolumeClaim(o) => o.name_any(),
            Self::Job(o) => o.name_any(),
        }
    }

    /// `None` for cluster-scoped objects
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Namespace(_) => None,
            Self::Secret(s) => Some(s.namespace.clone()),
            Self::ConfigMap(o) => o.namespace(),
            Self::Deployment(o) => o.namespace(),
            Self::Service(o) => o.namespace(),
            Self::PersistentVolumeClaim(o) => o.namespace(),
            Self::Job(o) => o.namespace(),
        }
    }
}

impl std::fmt::Display for DesiredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind(), self.name()),
            None => write!(f, "{} {}", self.kind(), self.name()),
        }
    }
}
