//! Build pipeline: the build job, its script, and the phase it implies.

use super::naming::ResourceNaming;
use crate::crds::{ClusterPhase, HonseFarmCluster, HonseFarmClusterStatus, RegistrySpec};
use crate::tasks::config::{BuildJobConfig, RequeueConfig};
use crate::tasks::types::{
    Error, Result, BUILD_ID_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE, NAME_LABEL,
};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

pub const STRATEGY_BUILDAH: &str = "buildah";
pub const STRATEGY_KANIKO: &str = "kaniko";

const BUILD_ID_LABEL: &str = "honsefarm-build-id";
const DEFAULT_GIT_REF: &str = "main";
const SOURCE_DIR: &str = "/workspace/src";
const REGISTRY_AUTH_DIR: &str = "/registry-auth";

/// `<host>/<prefix>/<name>`, prefix omitted when empty
pub fn registry_image(registry: &RegistrySpec, name: &str) -> String {
    let host = registry.host.trim().trim_end_matches('/');
    match registry
        .repository_prefix
        .as_deref()
        .map(|p| p.trim().trim_matches('/'))
        .filter(|p| !p.is_empty())
    {
        Some(prefix) => format!("{host}/{prefix}/{name}"),
        None => format!("{host}/{name}"),
    }
}

fn strategy(cluster: &HonseFarmCluster) -> Result<&str> {
    let strategy = cluster
        .spec
        .build
        .as_ref()
        .and_then(|b| b.strategy.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(STRATEGY_BUILDAH);
    match strategy {
        STRATEGY_BUILDAH | STRATEGY_KANIKO => Ok(strategy),
        other => Err(Error::ConfigError(format!(
            "spec.build.strategy '{other}' is not one of buildah, kaniko"
        ))),
    }
}

fn build_registry(cluster: &HonseFarmCluster) -> Result<&RegistrySpec> {
    cluster
        .spec
        .registry
        .as_ref()
        .filter(|r| !r.host.trim().is_empty())
        .ok_or_else(|| Error::ConfigError("spec.registry.host must be set in build mode".into()))
}

/// Quote for a POSIX shell single-quoted word
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    let value = value.trim();
    if value.is_empty() {
        default
    } else {
        value
    }
}

/// Shell script that checks out the source at the requested ref and builds and pushes every build
/// component in declaration order. The first failing command fails the job.
pub fn render_build_script(cluster: &HonseFarmCluster) -> Result<String> {
    let source = cluster
        .spec
        .source
        .as_ref()
        .ok_or_else(|| Error::ConfigError("spec.source.repoUrl must be set".into()))?;
    let registry = build_registry(cluster)?;
    let strategy = strategy(cluster)?;
    let build_id = cluster.build_identifier();

    let git_ref = non_empty_or(source.git_ref.as_deref().unwrap_or(""), DEFAULT_GIT_REF);
    let base_dir = non_empty_or(source.context_base_dir.as_deref().unwrap_or(""), ".");

    let mut lines = vec![
        "set -eu".to_string(),
        format!("git init -q {SOURCE_DIR}"),
        format!("cd {SOURCE_DIR}"),
        format!("git remote add origin {}", shell_quote(source.repo_url.trim())),
        // Fetching by ref accepts branches, tags and commit SHAs alike
        format!("git fetch -q --depth 1 origin {}", shell_quote(git_ref)),
        "git checkout -q FETCH_HEAD".to_string(),
        format!("cd {}", shell_quote(base_dir)),
    ];

    let components = cluster
        .spec
        .build
        .as_ref()
        .map(|b| b.components.as_slice())
        .unwrap_or_default();

    for component in components {
        let image = format!("{}:{build_id}", registry_image(registry, &component.name));
        let context = shell_quote(non_empty_or(&component.context_dir, "."));
        let dockerfile = shell_quote(non_empty_or(&component.dockerfile, "Dockerfile"));
        let image = shell_quote(&image);

        lines.push(format!("echo \"building {}\"", component.name));
        let step = if strategy == STRATEGY_KANIKO {
            let insecure = if registry.insecure {
                " --insecure --skip-tls-verify"
            } else {
                ""
            };
            format!(
                "( cd {context} && /kaniko/executor --context \"dir://$PWD\" --dockerfile {dockerfile} --destination {image}{insecure} )"
            )
        } else {
            let tls = if registry.insecure {
                " --tls-verify=false"
            } else {
                ""
            };
            format!(
                "( cd {context} && buildah bud --layers -f {dockerfile} -t {image} . && buildah push{tls} {image} )"
            )
        };
        lines.push(step);
    }

    Ok(lines.join("\n"))
}

/// The single build job for a cluster, named from the cluster identity only
pub fn build_job(cluster: &HonseFarmCluster, config: &BuildJobConfig) -> Result<Job> {
    let components = cluster
        .spec
        .build
        .as_ref()
        .map(|b| b.components.as_slice())
        .unwrap_or_default();
    if components.is_empty() {
        return Err(Error::ConfigError(
            "spec.build.components must list at least one component".into(),
        ));
    }
    if let Some(unnamed) = components.iter().position(|c| c.name.trim().is_empty()) {
        return Err(Error::ConfigError(format!(
            "spec.build.components[{unnamed}].name must be set"
        )));
    }

    let script = render_build_script(cluster)?;
    let strategy = strategy(cluster)?;
    let registry = build_registry(cluster)?;
    let build_id = cluster.build_identifier();
    let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
    let job_name = ResourceNaming::build_job_name(cluster_name);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(NAME_LABEL.to_string(), job_name.clone());
    labels.insert(
        BUILD_ID_LABEL.to_string(),
        ResourceNaming::sanitize_label_value(&build_id),
    );

    let image = if strategy == STRATEGY_KANIKO {
        config.kaniko_image.clone()
    } else {
        config.builder_image.clone()
    };

    let mut env = vec![json!({ "name": "BUILD_ID", "value": build_id })];
    let mut volumes = vec![json!({ "name": "workspace", "emptyDir": {} })];
    let mut volume_mounts = vec![json!({ "name": "workspace", "mountPath": "/workspace" })];

    if let Some(secret) = registry
        .secret_ref
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        volumes.push(json!({
            "name": "registry-auth",
            "secret": {
                "secretName": secret,
                "items": [{ "key": ".dockerconfigjson", "path": "config.json" }]
            }
        }));
        volume_mounts.push(json!({
            "name": "registry-auth",
            "mountPath": REGISTRY_AUTH_DIR,
            "readOnly": true
        }));
        env.push(json!({ "name": "DOCKER_CONFIG", "value": REGISTRY_AUTH_DIR }));
        env.push(json!({
            "name": "REGISTRY_AUTH_FILE",
            "value": format!("{REGISTRY_AUTH_DIR}/config.json")
        }));
        if strategy == STRATEGY_KANIKO {
            // kaniko reads credentials from /kaniko/.docker
            volume_mounts.push(json!({
                "name": "registry-auth",
                "mountPath": "/kaniko/.docker",
                "readOnly": true
            }));
        }
    }

    let mut container = json!({
        "name": "build",
        "image": image,
        "command": ["/bin/sh", "-c", script],
        "env": env,
        "volumeMounts": volume_mounts
    });
    if strategy == STRATEGY_BUILDAH {
        container["securityContext"] = json!({ "privileged": true });
    }

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": [container],
        "volumes": volumes
    });
    if let Some(sa_name) = config
        .service_account_name
        .as_ref()
        .filter(|s| !s.trim().is_empty())
    {
        pod_spec["serviceAccountName"] = json!(sa_name);
    }

    let job_spec = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name,
            "namespace": cluster.target_namespace(),
            "labels": labels,
            "annotations": { BUILD_ID_ANNOTATION: build_id }
        },
        "spec": {
            "backoffLimit": config.backoff_limit,
            "activeDeadlineSeconds": config.active_deadline_seconds,
            "template": {
                "metadata": { "labels": labels },
                "spec": pod_spec
            }
        }
    });

    Ok(serde_json::from_value(job_spec)?)
}

/// Build identifier recorded on an existing job
pub fn job_build_id(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(BUILD_ID_ANNOTATION))
        .map(String::as_str)
}

/// What the observed build job says about the build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildObservation {
    Absent,
    Running,
    Failed,
    Succeeded,
}

impl BuildObservation {
    pub fn from_job(job: Option<&Job>) -> Self {
        match job {
            None => Self::Absent,
            Some(job) => Self::from_status(job.status.as_ref()),
        }
    }

    /// Success wins over failure; a terminal `Failed` condition counts as a
    /// failure even before the failed pod count is updated
    pub fn from_status(status: Option<&JobStatus>) -> Self {
        let Some(status) = status else {
            return Self::Running;
        };

        let condition_true = |kind: &str| {
            status.conditions.as_ref().is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == kind && c.status == "True")
            })
        };

        if status.succeeded.unwrap_or(0) > 0 || condition_true("Complete") {
            Self::Succeeded
        } else if status.failed.unwrap_or(0) > 0 || condition_true("Failed") {
            Self::Failed
        } else {
            Self::Running
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded)
    }
}

/// Build identifier and time to record for a newly finished build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub commit: String,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDecision {
    pub phase: ClusterPhase,
    pub create_job: bool,
    pub record: Option<BuildRecord>,
    /// `None` once the build is done and runtime resources can be applied
    pub requeue_after: Option<Duration>,
}

/// Phase transition for one pass over the build job.
pub fn advance_build(
    observation: BuildObservation,
    previous: Option<&HonseFarmClusterStatus>,
    build_id: &str,
    now: DateTime<Utc>,
    requeue: &RequeueConfig,
) -> BuildDecision {
    match observation {
        BuildObservation::Absent => BuildDecision {
            phase: ClusterPhase::Building,
            create_job: true,
            record: None,
            requeue_after: Some(requeue.building()),
        },
        BuildObservation::Running => BuildDecision {
            phase: ClusterPhase::Building,
            create_job: false,
            record: None,
            requeue_after: Some(requeue.building()),
        },
        BuildObservation::Failed => BuildDecision {
            phase: ClusterPhase::BuildFailed,
            create_job: false,
            record: None,
            requeue_after: Some(requeue.build_failed()),
        },
        BuildObservation::Succeeded => {
            let recorded = previous.and_then(|s| s.last_build_commit.as_deref());
            let record = (recorded != Some(build_id)).then(|| BuildRecord {
                commit: build_id.to_string(),
                time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            });
            BuildDecision {
                phase: ClusterPhase::Built,
                create_job: false,
                record,
                requeue_after: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{BuildComponentSpec, BuildSpec, HonseFarmClusterSpec, SourceSpec};
    use chrono::TimeZone;
    use k8s_openapi::api::batch::v1::JobCondition;

    fn build_cluster(strategy: Option<&str>, insecure: bool) -> HonseFarmCluster {
        let mut cluster = HonseFarmCluster::new(
            "forest",
            HonseFarmClusterSpec {
                namespace: "forest".into(),
                version: Some("1.4.0".into()),
                source: Some(SourceSpec {
                    repo_url: "https://git.example/honse.git".into(),
                    git_ref: Some("release-7".into()),
                    context_base_dir: Some("src".into()),
                }),
                build: Some(BuildSpec {
                    strategy: strategy.map(String::from),
                    components: vec![
                        BuildComponentSpec {
                            name: "server".into(),
                            context_dir: "Server".into(),
                            dockerfile: "Dockerfile.release".into(),
                        },
                        BuildComponentSpec {
                            name: "main-fileserver".into(),
                            context_dir: "Files".into(),
                            dockerfile: String::new(),
                        },
                    ],
                }),
                registry: Some(RegistrySpec {
                    host: "registry.local:5000/".into(),
                    repository_prefix: Some("honse".into()),
                    insecure,
                    secret_ref: Some("registry-creds".into()),
                }),
                ..Default::default()
            },
        );
        cluster.metadata.uid = Some("uid-1".into());
        cluster
    }

    fn job_with_status(succeeded: i32, failed: i32) -> Job {
        Job {
            status: Some(JobStatus {
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn registry_image_omits_empty_prefix() {
        let mut registry = RegistrySpec {
            host: "registry.local".into(),
            repository_prefix: Some("/honse/".into()),
            ..Default::default()
        };
        assert_eq!(
            registry_image(&registry, "server"),
            "registry.local/honse/server"
        );
        registry.repository_prefix = Some(String::new());
        assert_eq!(registry_image(&registry, "server"), "registry.local/server");
    }

    #[test]
    fn buildah_script_builds_components_in_order() {
        let script = render_build_script(&build_cluster(None, true)).unwrap();
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(
            &lines[..7],
            &[
                "set -eu",
                "git init -q /workspace/src",
                "cd /workspace/src",
                "git remote add origin 'https://git.example/honse.git'",
                "git fetch -q --depth 1 origin 'release-7'",
                "git checkout -q FETCH_HEAD",
                "cd 'src'",
            ]
        );

        let server = script
            .find("registry.local:5000/honse/server:1.4.0")
            .unwrap();
        let files = script
            .find("registry.local:5000/honse/main-fileserver:1.4.0")
            .unwrap();
        assert!(server < files);
        assert!(script.contains(
            "( cd 'Server' && buildah bud --layers -f 'Dockerfile.release' -t 'registry.local:5000/honse/server:1.4.0' . && buildah push --tls-verify=false 'registry.local:5000/honse/server:1.4.0' )"
        ));
        assert!(script.contains("-f 'Dockerfile'"));
    }

    #[test]
    fn kaniko_script_uses_executor() {
        let script = render_build_script(&build_cluster(Some("kaniko"), false)).unwrap();
        assert!(script.contains(
            "/kaniko/executor --context \"dir://$PWD\" --dockerfile 'Dockerfile.release' --destination 'registry.local:5000/honse/server:1.4.0' )"
        ));
        assert!(!script.contains("--insecure"));
        assert!(!script.contains("buildah"));
    }

    #[test]
    fn script_defaults_ref_and_base_dir() {
        let mut cluster = build_cluster(None, false);
        if let Some(source) = cluster.spec.source.as_mut() {
            source.git_ref = None;
            source.context_base_dir = None;
        }
        cluster.spec.version = None;

        let script = render_build_script(&cluster).unwrap();
        assert!(script.contains("git fetch -q --depth 1 origin 'main'"));
        assert!(script.contains("\ncd '.'\n"));
        assert!(script.contains("registry.local:5000/honse/server:latest"));
    }

    #[test]
    fn commit_sha_ref_is_fetched_directly() {
        let sha = "8f32a548c1d0e6b7a9f3e2d4c5b6a7f8e9d0c1b2";
        let mut cluster = build_cluster(None, false);
        if let Some(source) = cluster.spec.source.as_mut() {
            source.git_ref = Some(sha.into());
        }

        let script = render_build_script(&cluster).unwrap();
        let fetch = format!("git fetch -q --depth 1 origin '{sha}'");
        let fetch_at = script.find(&fetch).unwrap();
        let checkout_at = script.find("git checkout -q FETCH_HEAD").unwrap();
        assert!(fetch_at < checkout_at);
        assert!(!script.contains("--branch"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn unknown_strategy_is_a_config_error() {
        let err = render_build_script(&build_cluster(Some("docker"), false)).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn build_job_shape() {
        let job = build_job(&build_cluster(None, false), &BuildJobConfig::default()).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("forest-build"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("forest"));
        assert_eq!(job_build_id(&job), Some("1.4.0"));

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(3600));

        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.command.as_ref().unwrap()[..2], ["/bin/sh", "-c"]);
        assert!(container
            .security_context
            .as_ref()
            .and_then(|s| s.privileged)
            .unwrap_or(false));

        let env = container.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "DOCKER_CONFIG" && e.value.as_deref() == Some("/registry-auth")));
        assert!(env.iter().any(|e| e.name == "REGISTRY_AUTH_FILE"
            && e.value.as_deref() == Some("/registry-auth/config.json")));

        let auth = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "registry-auth")
            .unwrap();
        let secret = auth.secret.as_ref().unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("registry-creds"));
        assert_eq!(secret.items.as_ref().unwrap()[0].path, "config.json");
    }

    #[test]
    fn build_job_requires_components() {
        let mut cluster = build_cluster(None, false);
        cluster.spec.build = None;
        let err = build_job(&cluster, &BuildJobConfig::default()).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn observation_from_job_status() {
        assert_eq!(BuildObservation::from_job(None), BuildObservation::Absent);
        assert_eq!(
            BuildObservation::from_job(Some(&Job::default())),
            BuildObservation::Running
        );
        assert_eq!(
            BuildObservation::from_job(Some(&job_with_status(0, 0))),
            BuildObservation::Running
        );
        assert_eq!(
            BuildObservation::from_job(Some(&job_with_status(0, 1))),
            BuildObservation::Failed
        );
        assert_eq!(
            BuildObservation::from_job(Some(&job_with_status(1, 2))),
            BuildObservation::Succeeded
        );

        let deadline_exceeded = JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                reason: Some("DeadlineExceeded".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(
            BuildObservation::from_status(Some(&deadline_exceeded)),
            BuildObservation::Failed
        );
    }

    #[test]
    fn phase_transitions() {
        let requeue = RequeueConfig::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let absent = advance_build(BuildObservation::Absent, None, "1.4.0", now, &requeue);
        assert_eq!(absent.phase, ClusterPhase::Building);
        assert!(absent.create_job);
        assert_eq!(absent.requeue_after, Some(Duration::from_secs(30)));

        let running = advance_build(BuildObservation::Running, None, "1.4.0", now, &requeue);
        assert_eq!(running.phase, ClusterPhase::Building);
        assert!(!running.create_job);

        let failed = advance_build(BuildObservation::Failed, None, "1.4.0", now, &requeue);
        assert_eq!(failed.phase, ClusterPhase::BuildFailed);
        assert_eq!(failed.requeue_after, Some(Duration::from_secs(60)));

        let built = advance_build(BuildObservation::Succeeded, None, "1.4.0", now, &requeue);
        assert_eq!(built.phase, ClusterPhase::Built);
        assert_eq!(built.requeue_after, None);
        assert_eq!(
            built.record,
            Some(BuildRecord {
                commit: "1.4.0".into(),
                time: "2026-03-01T12:00:00Z".into(),
            })
        );
    }

    #[test]
    fn success_for_recorded_build_does_not_rerecord() {
        let previous = HonseFarmClusterStatus {
            phase: ClusterPhase::Ready,
            last_build_commit: Some("1.4.0".into()),
            last_build_time: Some("2026-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let decision = advance_build(
            BuildObservation::Succeeded,
            Some(&previous),
            "1.4.0",
            Utc::now(),
            &RequeueConfig::default(),
        );
        assert_eq!(decision.phase, ClusterPhase::Built);
        assert_eq!(decision.record, None);
    }
}
