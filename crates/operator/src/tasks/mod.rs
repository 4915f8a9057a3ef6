use crate::crds::HonseFarmCluster;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, Instrument};

pub mod cluster;
pub mod config;
pub mod types;

// Re-export commonly used items
pub use cluster::{error_policy, reconcile_cluster};
pub use config::OperatorConfig;
pub use types::{Context, Error, Result};

use types::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// The cluster that controls a child object, if any
fn owning_cluster<K: Resource>(object: K) -> Option<ObjectRef<HonseFarmCluster>> {
    let kind = HonseFarmCluster::kind(&());
    let api_version = HonseFarmCluster::api_version(&());
    object
        .owner_references()
        .iter()
        .find(|owner| {
            owner.controller == Some(true)
                && owner.kind == kind
                && owner.api_version == api_version
        })
        .map(|owner| ObjectRef::new(&owner.name))
}

/// Run the HonseFarmCluster controller until `cancel` fires
#[instrument(skip(client, config, cancel))]
pub async fn run_cluster_controller(
    client: Client,
    config: OperatorConfig,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Starting HonseFarmCluster controller");

    let context = Arc::new(Context {
        client: client.clone(),
        config: Arc::new(config),
        cancel: cancel.clone(),
    });

    let clusters: Api<HonseFarmCluster> = Api::all(client.clone());
    let watcher_config = Config::default().any_semantic();
    // Children are watched cluster-wide, narrowed to what this operator manages
    let children_config = Config::default()
        .labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"))
        .any_semantic();

    Controller::new(clusters, watcher_config)
        .watches(
            Api::<Deployment>::all(client.clone()),
            children_config.clone(),
            owning_cluster::<Deployment>,
        )
        .watches(
            Api::<Service>::all(client.clone()),
            children_config.clone(),
            owning_cluster::<Service>,
        )
        .watches(
            Api::<ConfigMap>::all(client.clone()),
            children_config.clone(),
            owning_cluster::<ConfigMap>,
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            children_config.clone(),
            owning_cluster::<Secret>,
        )
        .watches(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            children_config.clone(),
            owning_cluster::<PersistentVolumeClaim>,
        )
        .watches(
            Api::<Job>::all(client.clone()),
            children_config,
            owning_cluster::<Job>,
        )
        .graceful_shutdown_on(async move { cancel.cancelled().await })
        .run(reconcile_cluster, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("cluster_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((cluster, action)) => {
                        info!(
                            cluster = %cluster.name,
                            ?action,
                            "HonseFarmCluster reconciliation successful"
                        );
                    }
                    Err(reconciliation_err) => {
                        error!(
                            error = ?reconciliation_err,
                            "HonseFarmCluster reconciliation error"
                        );
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("HonseFarmCluster controller shutting down");
    Ok(())
}
