/*
 * HonseFarm Operator - Kubernetes operator for HonseFarm clusters
 * Copyright (C) 2025 The HonseFarm Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! HonseFarm operator service
//!
//! Watches `HonseFarmCluster` resources and converges each one into its
//! namespace, secrets, configuration bundle, workloads, tunnel and build job.
//! Serves health and readiness endpoints alongside the controller.

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use honsefarm_operator::tasks::config::{OperatorConfig, DEFAULT_CONFIG_PATH};
use honsefarm_operator::tasks::run_cluster_controller;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone)]
struct AppState {
    controller_running: Arc<AtomicBool>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,honsefarm_operator=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!(
        "Starting HonseFarm operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_operator_config();
    config.validate()?;
    let bind_address = config.server.bind_address.clone();

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let controller_running = Arc::new(AtomicBool::new(true));

    let controller_handle = {
        let cancel = cancel.clone();
        let running = controller_running.clone();
        tokio::spawn(async move {
            if let Err(e) = run_cluster_controller(client, config, cancel).await {
                error!("Controller error: {}", e);
            }
            running.store(false, Ordering::SeqCst);
        })
    };

    let state = AppState { controller_running };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(30),
                )),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Operator HTTP server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // The controller finishes in-flight passes before returning
    cancel.cancel();
    if let Err(e) = controller_handle.await {
        error!("Controller task join error: {:?}", e);
    }
    info!("HonseFarm operator stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "honsefarm-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    if !state.controller_running.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "honsefarm-operator",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn metrics() -> Json<Value> {
    Json(json!({
        "service": "honsefarm-operator",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

fn load_operator_config() -> OperatorConfig {
    let override_path = std::env::var("OPERATOR_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    match OperatorConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded operator configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            OperatorConfig::default()
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM, or when the controller is cancelled
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
        () = cancel.cancelled() => {
            info!("Controller cancelled, shutting down");
        },
    }
    cancel.cancel();
}
