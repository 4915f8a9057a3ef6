//! Reconcile Pass Tests
//!
//! Drives full reconcile passes against the in-memory store:
//! 1. A server-only cluster converges with one create per object and then
//!    reaches a fixed point
//! 2. Build mode walks Building -> BuildFailed / Built -> Ready
//! 3. Invalid specs and tunnel errors land in the cluster status
//! 4. Recovery from any of those failures settles into a pass that writes
//!    nothing

use honsefarm_operator::crds::{
    BuildComponentSpec, BuildSpec, CloudflaredSpec, ClusterPhase, ComponentSpec, ComponentsSpec,
    HonseFarmCluster, HonseFarmClusterSpec, ImagesSpec, RegistrySpec, SourceSpec,
};
use honsefarm_operator::tasks::cluster::material::{MaterialGenerator, TlsMaterial};
use honsefarm_operator::tasks::cluster::naming::ResourceNaming;
use honsefarm_operator::tasks::cluster::run_pass;
use honsefarm_operator::tasks::cluster::store::{MemoryStore, Verb};
use honsefarm_operator::tasks::config::OperatorConfig;
use honsefarm_operator::tasks::types::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::runtime::controller::Action;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Deterministic material that counts how often it was asked for
#[derive(Default)]
struct FixedMaterial {
    core_calls: AtomicUsize,
}

impl MaterialGenerator for FixedMaterial {
    fn core_secret_data(&self) -> Result<BTreeMap<String, String>> {
        self.core_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BTreeMap::from([
            ("jwtSecret".to_string(), "fixed-jwt".to_string()),
            ("databasePassword".to_string(), "fixed-db".to_string()),
            ("redisPassword".to_string(), "fixed-redis".to_string()),
        ]))
    }

    fn self_signed(&self, _common_name: &str, _dns_names: &[String]) -> Result<TlsMaterial> {
        Ok(TlsMaterial {
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
        })
    }
}

struct Harness {
    store: MemoryStore,
    generator: FixedMaterial,
    config: OperatorConfig,
    cancel: CancellationToken,
}

impl Harness {
    fn new(cluster: &HonseFarmCluster) -> Self {
        let store = MemoryStore::new();
        store.insert(cluster).unwrap();
        Self {
            store,
            generator: FixedMaterial::default(),
            config: OperatorConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Run a pass against the cluster as currently stored
    async fn pass(&self) -> Result<Action> {
        let cluster = self.cluster();
        run_pass(&cluster, &self.store, &self.generator, &self.config, &self.cancel).await
    }

    fn cluster(&self) -> HonseFarmCluster {
        self.store.object(None, "forest").unwrap()
    }

    fn update_spec(&self, edit: impl FnOnce(&mut HonseFarmClusterSpec)) {
        let mut cluster = self.cluster();
        edit(&mut cluster.spec);
        cluster.metadata.generation = cluster.metadata.generation.map(|g| g + 1);
        self.store.insert(&cluster).unwrap();
    }

    fn build_job(&self) -> Option<Job> {
        self.store
            .object(Some("forest"), &ResourceNaming::build_job_name("forest"))
    }

    fn finish_build_job(&self, succeeded: bool) {
        let mut job = self.build_job().unwrap();
        job.status = Some(JobStatus {
            succeeded: succeeded.then_some(1),
            failed: (!succeeded).then_some(1),
            ..Default::default()
        });
        self.store.insert(&job).unwrap();
    }
}

fn cluster(spec: HonseFarmClusterSpec) -> HonseFarmCluster {
    let mut cluster = HonseFarmCluster::new("forest", spec);
    cluster.metadata.uid = Some("uid-forest".to_string());
    cluster.metadata.generation = Some(1);
    cluster
}

fn server_only(replicas: i32) -> HonseFarmClusterSpec {
    HonseFarmClusterSpec {
        namespace: "forest".to_string(),
        images: Some(ImagesSpec {
            server: Some("registry.local/server:1.0".to_string()),
            ..Default::default()
        }),
        components: Some(ComponentsSpec {
            server: Some(ComponentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_mode() -> HonseFarmClusterSpec {
    HonseFarmClusterSpec {
        namespace: "forest".to_string(),
        version: Some("1.4.0".to_string()),
        source: Some(SourceSpec {
            repo_url: "https://git.example/honse.git".to_string(),
            git_ref: None,
            context_base_dir: None,
        }),
        build: Some(BuildSpec {
            strategy: None,
            components: vec![BuildComponentSpec {
                name: "server".to_string(),
                context_dir: "Server".to_string(),
                dockerfile: "Dockerfile".to_string(),
            }],
        }),
        registry: Some(RegistrySpec {
            host: "registry.local".to_string(),
            repository_prefix: Some("honse".to_string()),
            insecure: true,
            secret_ref: None,
        }),
        components: Some(ComponentsSpec {
            server: Some(ComponentSpec::default()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_server_only_cluster_creates_one_deployment_and_one_service() {
    let harness = Harness::new(&cluster(server_only(2)));

    let action = harness.pass().await.unwrap();
    assert_eq!(action, Action::requeue(harness.config.requeue.ready()));

    assert_eq!(harness.store.calls_for(Verb::Create, "Deployment"), 1);
    assert_eq!(harness.store.calls_for(Verb::Create, "Service"), 1);
    assert_eq!(harness.store.count::<PersistentVolumeClaim>(), 0);

    let deployment: Deployment = harness
        .store
        .object(Some("forest"), "honsefarm-server")
        .unwrap();
    let spec = deployment.spec.unwrap();
    assert_eq!(spec.replicas, Some(2));
    let service: Service = harness.store.object(Some("forest"), "server-svc").unwrap();
    assert_eq!(service.spec.unwrap().ports.unwrap()[0].port, 5000);

    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.cloudflared_status.is_none());
}

#[tokio::test]
async fn test_second_pass_is_a_fixed_point() {
    let harness = Harness::new(&cluster(server_only(2)));
    harness.pass().await.unwrap();
    harness.store.clear_calls();

    harness.pass().await.unwrap();
    assert_eq!(harness.store.mutating_calls(), vec![]);
    assert_eq!(harness.generator.core_calls.load(Ordering::SeqCst), 1);
    assert!(harness.store.object::<Secret>(Some("forest"), "honsefarm-secrets").is_some());
}

#[tokio::test]
async fn test_replica_change_updates_deployment_in_place() {
    let harness = Harness::new(&cluster(server_only(2)));
    harness.pass().await.unwrap();
    harness.store.clear_calls();

    harness.update_spec(|spec| {
        if let Some(server) = spec.components.as_mut().and_then(|c| c.server.as_mut()) {
            server.replicas = Some(3);
        }
    });
    harness.pass().await.unwrap();

    assert_eq!(harness.store.calls_for(Verb::Replace, "Deployment"), 1);
    assert_eq!(harness.store.calls_for(Verb::Create, "Deployment"), 0);
    let deployment: Deployment = harness
        .store
        .object(Some("forest"), "honsefarm-server")
        .unwrap();
    assert_eq!(deployment.spec.unwrap().replicas, Some(3));
    assert_eq!(harness.cluster().status.unwrap().observed_generation, Some(2));
}

#[tokio::test]
async fn test_missing_image_marks_cluster_failed() {
    let mut spec = server_only(1);
    spec.images = None;
    let harness = Harness::new(&cluster(spec));

    let action = harness.pass().await.unwrap();
    assert_eq!(action, Action::await_change());

    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Failed);
    let invalid = status
        .conditions
        .iter()
        .find(|c| c.condition_type == "ConfigInvalid")
        .unwrap();
    assert_eq!(invalid.status, "True");
    assert!(invalid.message.as_deref().unwrap().contains("spec.images.server"));
    assert_eq!(harness.store.calls_for(Verb::Create, "Namespace"), 0);
}

#[tokio::test]
async fn test_tunnel_error_does_not_block_core_resources() {
    let mut spec = server_only(1);
    spec.cloudflared = Some(CloudflaredSpec {
        enabled: true,
        ..Default::default()
    });
    let harness = Harness::new(&cluster(spec));

    harness.pass().await.unwrap();

    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    let tunnel = status.cloudflared_status.unwrap();
    assert!(!tunnel.ready);
    assert!(tunnel.last_error.unwrap().contains("tunnelId"));
    assert_eq!(harness.store.calls_for(Verb::Create, "Deployment"), 1);
}

#[tokio::test]
async fn test_recovered_tunnel_clears_last_error_and_settles() {
    let mut spec = server_only(1);
    spec.cloudflared = Some(CloudflaredSpec {
        enabled: true,
        ..Default::default()
    });
    let harness = Harness::new(&cluster(spec));
    harness.pass().await.unwrap();
    assert!(harness.cluster().status.unwrap().cloudflared_status.unwrap().last_error.is_some());

    harness.update_spec(|spec| {
        if let Some(tunnel) = spec.cloudflared.as_mut() {
            tunnel.tunnel_id = "6ff42ae2".to_string();
        }
    });
    harness.pass().await.unwrap();

    let status = harness.cluster().status.unwrap();
    let tunnel = status.cloudflared_status.unwrap();
    assert!(tunnel.ready);
    assert_eq!(tunnel.last_error, None);
    let condition = status
        .conditions
        .iter()
        .find(|c| c.condition_type == "TunnelReady")
        .unwrap();
    assert_eq!(condition.status, "True");

    harness.store.clear_calls();
    harness.pass().await.unwrap();
    assert_eq!(harness.store.calls_for(Verb::PatchStatus, "HonseFarmCluster"), 0);
    assert_eq!(harness.store.mutating_calls(), vec![]);
}

#[tokio::test]
async fn test_fixed_spec_recovers_from_failed_and_settles() {
    let mut spec = server_only(1);
    spec.images = None;
    let harness = Harness::new(&cluster(spec));
    harness.pass().await.unwrap();
    assert_eq!(harness.cluster().phase(), ClusterPhase::Failed);

    harness.update_spec(|spec| spec.images = server_only(1).images);
    let action = harness.pass().await.unwrap();
    assert_eq!(action, Action::requeue(harness.config.requeue.ready()));

    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    assert!(!status
        .conditions
        .iter()
        .any(|c| c.condition_type == "ConfigInvalid"));

    harness.store.clear_calls();
    harness.pass().await.unwrap();
    assert_eq!(harness.store.mutating_calls(), vec![]);
}

#[tokio::test]
async fn test_build_walks_from_building_to_ready() {
    let harness = Harness::new(&cluster(build_mode()));

    // No job yet: create it and hold back the workload it feeds
    let action = harness.pass().await.unwrap();
    assert_eq!(action, Action::requeue(harness.config.requeue.building()));
    assert_eq!(harness.cluster().phase(), ClusterPhase::Building);
    assert!(harness.build_job().is_some());
    assert_eq!(harness.store.count::<Deployment>(), 0);
    assert_eq!(harness.store.calls_for(Verb::Create, "Service"), 1);

    // Still running
    harness.store.clear_calls();
    harness.pass().await.unwrap();
    assert_eq!(harness.cluster().phase(), ClusterPhase::Building);
    assert_eq!(harness.store.calls_for(Verb::Create, "Job"), 0);

    harness.finish_build_job(true);
    let action = harness.pass().await.unwrap();
    assert_eq!(action, Action::requeue(harness.config.requeue.ready()));

    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    assert_eq!(status.last_build_commit.as_deref(), Some("1.4.0"));
    assert!(status.last_build_time.is_some());

    let deployment: Deployment = harness
        .store
        .object(Some("forest"), "honsefarm-server")
        .unwrap();
    let image = deployment.spec.unwrap().template.spec.unwrap().containers[0]
        .image
        .clone();
    assert_eq!(image.as_deref(), Some("registry.local/honse/server:1.4.0"));

    // A finished build is not recorded twice
    let recorded_at = status.last_build_time;
    harness.store.clear_calls();
    harness.pass().await.unwrap();
    assert_eq!(harness.cluster().status.unwrap().last_build_time, recorded_at);
    assert_eq!(harness.store.mutating_calls(), vec![]);
}

#[tokio::test]
async fn test_failed_build_keeps_runtime_workloads_back() {
    let harness = Harness::new(&cluster(build_mode()));
    harness.pass().await.unwrap();
    harness.finish_build_job(false);

    let action = harness.pass().await.unwrap();
    assert_eq!(action, Action::requeue(harness.config.requeue.build_failed()));
    assert_eq!(harness.cluster().phase(), ClusterPhase::BuildFailed);
    assert_eq!(harness.store.count::<Deployment>(), 0);
    assert!(harness.cluster().status.unwrap().last_build_commit.is_none());
}

#[tokio::test]
async fn test_build_record_survives_runtime_apply_failure() {
    let harness = Harness::new(&cluster(build_mode()));
    harness.pass().await.unwrap();
    harness.finish_build_job(true);

    harness.store.inject_fault(Verb::Create, "Deployment", 503);
    let err = harness.pass().await.unwrap_err();
    assert!(err.is_retryable());

    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Built);
    assert_eq!(status.last_build_commit.as_deref(), Some("1.4.0"));
    let recorded_at = status.last_build_time.clone();
    assert!(recorded_at.is_some());

    harness.store.clear_faults();
    harness.pass().await.unwrap();
    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    assert_eq!(status.last_build_time, recorded_at);
    assert_eq!(harness.store.count::<Deployment>(), 1);
}

#[tokio::test]
async fn test_failed_build_recovers_with_new_version_and_settles() {
    let mut harness = Harness::new(&cluster(build_mode()));
    harness.config.build.recreate_on_version_change = true;
    harness.pass().await.unwrap();
    harness.finish_build_job(false);
    harness.pass().await.unwrap();
    assert_eq!(harness.cluster().phase(), ClusterPhase::BuildFailed);

    harness.update_spec(|spec| spec.version = Some("1.5.0".to_string()));
    harness.pass().await.unwrap();
    harness.pass().await.unwrap();
    harness.finish_build_job(true);
    harness.pass().await.unwrap();

    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    assert_eq!(status.last_build_commit.as_deref(), Some("1.5.0"));
    let built = status
        .conditions
        .iter()
        .find(|c| c.condition_type == "BuildSucceeded")
        .unwrap();
    assert_eq!(built.status, "True");
    assert!(!status.conditions.iter().any(|c| c.condition_type == "BuildStale"));

    harness.store.clear_calls();
    harness.pass().await.unwrap();
    assert_eq!(harness.store.mutating_calls(), vec![]);
}

#[tokio::test]
async fn test_version_change_leaves_finished_job_in_place_by_default() {
    let harness = Harness::new(&cluster(build_mode()));
    harness.pass().await.unwrap();
    harness.finish_build_job(true);
    harness.pass().await.unwrap();

    harness.update_spec(|spec| spec.version = Some("1.5.0".to_string()));
    harness.store.clear_calls();
    harness.pass().await.unwrap();

    assert_eq!(harness.store.calls_for(Verb::Delete, "Job"), 0);
    assert_eq!(harness.store.calls_for(Verb::Replace, "Deployment"), 0);
    let status = harness.cluster().status.unwrap();
    assert_eq!(status.phase, ClusterPhase::Ready);
    let stale = status
        .conditions
        .iter()
        .find(|c| c.condition_type == "BuildStale")
        .unwrap();
    assert_eq!(stale.status, "True");
}

#[tokio::test]
async fn test_version_change_recreates_job_when_configured() {
    let mut harness = Harness::new(&cluster(build_mode()));
    harness.config.build.recreate_on_version_change = true;
    harness.pass().await.unwrap();
    harness.finish_build_job(true);
    harness.pass().await.unwrap();

    harness.update_spec(|spec| spec.version = Some("1.5.0".to_string()));
    harness.pass().await.unwrap();
    assert_eq!(harness.store.calls_for(Verb::Delete, "Job"), 1);
    assert!(harness.build_job().is_none());
    assert_eq!(harness.cluster().phase(), ClusterPhase::Building);

    harness.pass().await.unwrap();
    let job = harness.build_job().unwrap();
    assert_eq!(
        job.metadata.annotations.unwrap()["clusters.honse.farm/build-id"],
        "1.5.0"
    );
}

#[tokio::test]
async fn test_cancelled_pass_writes_nothing() {
    let harness = Harness::new(&cluster(server_only(1)));
    harness.cancel.cancel();

    let err = harness.pass().await.unwrap_err();
    assert!(matches!(err, honsefarm_operator::Error::Cancelled));
    assert_eq!(harness.store.mutating_calls(), vec![]);
    assert!(harness.cluster().status.is_none());
}
