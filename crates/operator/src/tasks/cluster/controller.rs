use super::build::{advance_build, job_build_id, BuildObservation};
use super::converge::{cancellable, ConvergenceEngine};
use super::material::{MaterialGenerator, SystemMaterialGenerator};
use super::render::{render_plan, RenderPlan, Stage};
use super::resources::DesiredResource;
use super::status::{
    remove_condition, set_condition, CONDITION_BUILD_STALE, CONDITION_BUILD_SUCCEEDED,
    CONDITION_CONFIG_INVALID, CONDITION_READY, CONDITION_TUNNEL_READY,
};
use super::store::{KubeStore, ObjectStore};
use crate::crds::{ClusterPhase, CloudflaredStatus, HonseFarmCluster, HonseFarmClusterStatus};
use crate::tasks::config::OperatorConfig;
use crate::tasks::types::{Context, Error, Result};
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile_cluster(
    cluster: Arc<HonseFarmCluster>,
    ctx: Arc<Context>,
) -> Result<Action> {
    info!("🎯 Reconciling HonseFarmCluster {}", cluster.name_any());

    let store = KubeStore::new(ctx.client.clone());
    let action = run_pass(
        &cluster,
        &store,
        &SystemMaterialGenerator,
        &ctx.config,
        &ctx.cancel,
    )
    .await?;

    debug!("Reconcile finished with {:?}", action);
    Ok(action)
}

/// Requeue transient failures; everything else waits for the next change
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub fn error_policy(cluster: Arc<HonseFarmCluster>, err: &Error, ctx: Arc<Context>) -> Action {
    if err.is_retryable() {
        warn!(error = %err, "Reconcile failed, retrying");
        Action::requeue(ctx.config.requeue.error())
    } else {
        error!(error = %err, "Reconcile failed, waiting for a spec change");
        Action::await_change()
    }
}

/// One reconcile pass over a cluster against any store.
///
/// Core resources are applied first, then the tunnel, then either the build
/// state machine or the runtime workloads. The status is written only when it
/// changed.
pub async fn run_pass<S, G>(
    cluster: &HonseFarmCluster,
    store: &S,
    generator: &G,
    config: &OperatorConfig,
    cancel: &CancellationToken,
) -> Result<Action>
where
    S: ObjectStore,
    G: MaterialGenerator + ?Sized,
{
    let name = cluster.metadata.name.clone().ok_or(Error::MissingObjectKey)?;
    let owner = cluster
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey)?;
    let now = Utc::now();
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    let previous = cluster.status.as_ref();
    let mut status = previous.cloned().unwrap_or_default();
    status.observed_generation = cluster.metadata.generation;

    let plan = match render_plan(cluster, config) {
        Ok(plan) => plan,
        Err(Error::ConfigError(message)) => {
            warn!("Cluster spec is invalid: {}", message);
            status.phase = ClusterPhase::Failed;
            let conditions = &mut status.conditions;
            let reason = "InvalidSpec";
            set_condition(
                conditions,
                CONDITION_CONFIG_INVALID,
                true,
                reason,
                message.as_str(),
                &timestamp,
            );
            set_condition(conditions, CONDITION_READY, false, reason, message, &timestamp);
            write_status(store, cancel, &name, previous, &status).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    remove_condition(&mut status.conditions, CONDITION_CONFIG_INVALID);

    let engine = ConvergenceEngine::new(store, generator, owner, cancel.clone());
    engine.apply_all(plan.stage(Stage::Core)).await?;

    converge_tunnel(&engine, &plan, &mut status, &timestamp).await?;

    if let Some(job) = plan.stage(Stage::Build).find_map(|r| match r {
        DesiredResource::Job(job) => Some(job),
        _ => None,
    }) {
        let build_id = cluster.build_identifier();
        let observed: Option<Job> = engine
            .observe(job.metadata.namespace.as_deref(), &job.name_any())
            .await?;

        if let Some(observed) = observed.as_ref() {
            let recorded = job_build_id(observed);
            if recorded != Some(build_id.as_str()) {
                let action =
                    handle_stale_job(&engine, observed, &build_id, config, &mut status, &timestamp)
                        .await?;
                write_status(store, cancel, &name, previous, &status).await?;
                return Ok(action);
            }
        }
        remove_condition(&mut status.conditions, CONDITION_BUILD_STALE);

        let observation = BuildObservation::from_job(observed.as_ref());
        let decision = advance_build(observation, previous, &build_id, now, &config.requeue);
        if decision.create_job {
            info!("🔨 Starting build {} for cluster {}", build_id, name);
            engine.apply_all(plan.stage(Stage::Build)).await?;
        }
        let recorded = decision.record.is_some();
        if let Some(record) = decision.record {
            info!("✅ Build {} succeeded", record.commit);
            status.last_build_commit = Some(record.commit);
            status.last_build_time = Some(record.time);
        }
        let (succeeded, reason, message) = match observation {
            BuildObservation::Succeeded => {
                (true, "JobComplete", format!("Build {build_id} succeeded"))
            }
            BuildObservation::Failed => (false, "JobFailed", format!("Build {build_id} failed")),
            BuildObservation::Absent | BuildObservation::Running => {
                (false, "Building", format!("Building {build_id}"))
            }
        };
        set_condition(
            &mut status.conditions,
            CONDITION_BUILD_SUCCEEDED,
            succeeded,
            reason,
            message,
            &timestamp,
        );
        status.phase = decision.phase;

        if let Some(requeue_after) = decision.requeue_after {
            set_condition(
                &mut status.conditions,
                CONDITION_READY,
                false,
                "BuildPending",
                format!("Waiting for build {build_id}"),
                &timestamp,
            );
            write_status(store, cancel, &name, previous, &status).await?;
            return Ok(Action::requeue(requeue_after));
        }
        if recorded {
            // A failing runtime apply must not lose the build record
            write_status(store, cancel, &name, previous, &status).await?;
        }
    }

    engine.apply_all(plan.stage(Stage::Runtime)).await?;
    status.phase = ClusterPhase::Ready;
    set_condition(
        &mut status.conditions,
        CONDITION_READY,
        true,
        "Converged",
        "All resources converged",
        &timestamp,
    );
    write_status(store, cancel, &name, previous, &status).await?;

    Ok(Action::requeue(config.requeue.ready()))
}

/// Tunnel failures are reported on the tunnel status and never fail the pass
async fn converge_tunnel<S: ObjectStore, G: MaterialGenerator + ?Sized>(
    engine: &ConvergenceEngine<'_, S, G>,
    plan: &RenderPlan,
    status: &mut HonseFarmClusterStatus,
    timestamp: &str,
) -> Result<()> {
    let outcome = match &plan.tunnel_error {
        Some(message) => Err(message.clone()),
        None if !plan.has_stage(Stage::Tunnel) => {
            status.cloudflared_status = None;
            remove_condition(&mut status.conditions, CONDITION_TUNNEL_READY);
            return Ok(());
        }
        None => match engine.apply_all(plan.stage(Stage::Tunnel)).await {
            Ok(_) => Ok(()),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => Err(e.to_string()),
        },
    };

    match outcome {
        Ok(()) => {
            status.cloudflared_status = Some(CloudflaredStatus {
                ready: true,
                last_error: None,
            });
            set_condition(
                &mut status.conditions,
                CONDITION_TUNNEL_READY,
                true,
                "Converged",
                "Tunnel resources converged",
                timestamp,
            );
        }
        Err(message) => {
            warn!("Tunnel not converged: {}", message);
            set_condition(
                &mut status.conditions,
                CONDITION_TUNNEL_READY,
                false,
                "TunnelError",
                message.as_str(),
                timestamp,
            );
            status.cloudflared_status = Some(CloudflaredStatus {
                ready: false,
                last_error: Some(message),
            });
        }
    }
    Ok(())
}

/// The build job was created for a different build identifier. It is only
/// replaced when the operator is configured to, and only once it finished.
async fn handle_stale_job<S: ObjectStore, G: MaterialGenerator + ?Sized>(
    engine: &ConvergenceEngine<'_, S, G>,
    observed: &Job,
    build_id: &str,
    config: &OperatorConfig,
    status: &mut HonseFarmClusterStatus,
    timestamp: &str,
) -> Result<Action> {
    let job_name = observed.name_any();
    let recorded = job_build_id(observed).unwrap_or("unknown");
    let finished = BuildObservation::from_job(Some(observed)).is_finished();

    if config.build.recreate_on_version_change && finished {
        info!("♻️ Replacing build job {} ({} -> {})", job_name, recorded, build_id);
        engine
            .remove::<Job>(observed.metadata.namespace.as_deref(), &job_name)
            .await?;
        remove_condition(&mut status.conditions, CONDITION_BUILD_STALE);
        status.phase = ClusterPhase::Building;
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            false,
            "BuildPending",
            format!("Waiting for build {build_id}"),
            timestamp,
        );
        return Ok(Action::requeue(config.requeue.building()));
    }

    let message = if config.build.recreate_on_version_change {
        format!(
            "Build job {job_name} for {recorded} is still running; {build_id} starts once it finishes"
        )
    } else {
        format!(
            "Build job {job_name} was created for {recorded}, not {build_id}; delete it to rebuild"
        )
    };
    warn!("{}", message);
    set_condition(
        &mut status.conditions,
        CONDITION_BUILD_STALE,
        true,
        "BuildIdMismatch",
        message,
        timestamp,
    );

    let requeue_after = if finished {
        config.requeue.build_failed()
    } else {
        config.requeue.building()
    };
    Ok(Action::requeue(requeue_after))
}

async fn write_status<S: ObjectStore>(
    store: &S,
    cancel: &CancellationToken,
    name: &str,
    previous: Option<&HonseFarmClusterStatus>,
    status: &HonseFarmClusterStatus,
) -> Result<()> {
    if previous == Some(status) {
        debug!("Status unchanged, skipping write");
        return Ok(());
    }
    info!("📝 Cluster {} is {}", name, status.phase);
    cancellable(cancel, store.patch_cluster_status(name, status)).await
}
