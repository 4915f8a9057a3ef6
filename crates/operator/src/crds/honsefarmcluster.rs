//! `HonseFarmCluster` Custom Resource Definition

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace used when `spec.namespace` is empty
pub const DEFAULT_TARGET_NAMESPACE: &str = "honsefarm";

/// Build identifier used when neither `spec.version` nor `spec.source.ref` is set
pub const LATEST_BUILD_ID: &str = "latest";

/// Schema for free-form override documents
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject::default();
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schema
        .extensions
        .insert("nullable".to_string(), serde_json::Value::Bool(true));
    Schema::Object(schema)
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "clusters.honse.farm", version = "v1alpha1", kind = "HonseFarmCluster")]
#[kube(status = "HonseFarmClusterStatus")]
#[kube(shortname = "hfc")]
#[kube(printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.namespace"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Build","type":"string","jsonPath":".status.lastBuildCommit"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct HonseFarmClusterSpec {
    /// Namespace the cluster's workloads live in (defaults to `honsefarm`)
    #[serde(default)]
    pub namespace: String,

    /// Public API domain
    #[serde(default)]
    pub api_domain: String,

    /// Explicit build identifier, takes precedence over `source.ref`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Source repository; its presence switches the cluster into build mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<HostsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalConfig>,

    /// Pre-built image references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<ImagesSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudflared: Option<CloudflaredSpec>,
}

/// Source repository for build mode
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub repo_url: String,

    /// Git ref to clone (defaults to `main`)
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    /// Directory inside the repository that component contexts are relative to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_base_dir: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Image builder: `buildah` (default) or `kaniko`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    #[serde(default)]
    pub components: Vec<BuildComponentSpec>,
}

/// One image produced by the build job
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildComponentSpec {
    pub name: String,
    #[serde(default)]
    pub context_dir: String,
    #[serde(default)]
    pub dockerfile: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_prefix: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    /// Name of a `kubernetes.io/dockerconfigjson` secret in the target namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn: Option<String>,
    #[serde(default)]
    pub shards: Vec<HostShard>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HostShard {
    pub name: String,
    #[serde(default)]
    pub host: String,
}

/// Settings shared by every component's appsettings document
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<GlobalLogging>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<GlobalDatabase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<GlobalRedis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<GlobalJwt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<GlobalTelemetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<GlobalFederation>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalLogging {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microsoft_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asp_net_core_level: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GlobalDatabase {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRedis {
    #[serde(default)]
    pub connection_string: String,
    #[serde(default)]
    pub pool: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GlobalJwt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTelemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_endpoint: Option<String>,
    #[serde(default)]
    pub analytics_opt_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics_connection_string: Option<String>,
}

/// Federation identity rendered into the server document
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalFederation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_discord_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_join_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_base_url: Option<String>,
    #[serde(default)]
    pub use_dns_bootstrap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_bootstrap_hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_uid_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImagesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_panel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_fileserver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_fileserver: Option<String>,
}

/// A component is enabled by the presence of its sub-spec
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_panel: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fileservers: Option<FileserversSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Top-level keys replace the generated appsettings keys of the same name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config_overrides: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default)]
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub access_modes: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FileserversSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<ComponentSpec>,
    #[serde(default)]
    pub shards: Vec<ShardSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    pub name: String,

    /// Informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_profile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config_overrides: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesSpec {
    /// `SelfSigned` is the only mode the operator issues itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_ref: Option<IssuerRef>,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct IssuerRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudflaredSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_name: Option<String>,
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<SecretRef>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub ingress: Vec<CloudflaredIngressRule>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretRef {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Maps a public hostname either to an explicit service address, to one of
/// the operator's own components, or to a cloudflared special service
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudflaredIngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_service: Option<String>,
}

/// Lifecycle phase of a `HonseFarmCluster`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Building,
    BuildFailed,
    Built,
    Ready,
    /// The cluster cannot be rendered; waits for an edit
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Pending => "Pending",
            Self::Building => "Building",
            Self::BuildFailed => "BuildFailed",
            Self::Built => "Built",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

/// Status of the `HonseFarmCluster`
///
/// Fields are always serialized so that a merge patch clears stale values.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HonseFarmClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Build identifier of the last successful build
    #[serde(default)]
    pub last_build_commit: Option<String>,

    /// RFC3339 time the last successful build was recorded
    #[serde(default)]
    pub last_build_time: Option<String>,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default)]
    pub cloudflared_status: Option<CloudflaredStatus>,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudflaredStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Condition for the `HonseFarmCluster`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HonseFarmCluster {
    /// Namespace all child resources are rendered into
    pub fn target_namespace(&self) -> &str {
        let ns = self.spec.namespace.trim();
        if ns.is_empty() {
            DEFAULT_TARGET_NAMESPACE
        } else {
            ns
        }
    }

    /// Build mode is selected by a source repository
    pub fn is_build_mode(&self) -> bool {
        self.spec
            .source
            .as_ref()
            .is_some_and(|source| !source.repo_url.trim().is_empty())
    }

    /// `version`, else `source.ref`, else `latest`
    pub fn build_identifier(&self) -> String {
        let version = self.spec.version.as_deref().map(str::trim);
        let git_ref = self
            .spec
            .source
            .as_ref()
            .and_then(|source| source.git_ref.as_deref())
            .map(str::trim);

        version
            .filter(|v| !v.is_empty())
            .or(git_ref.filter(|r| !r.is_empty()))
            .unwrap_or(LATEST_BUILD_ID)
            .to_string()
    }

    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
