pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod interpreter;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod sandbox;
pub mod service;
pub mod store;
pub mod throttle;
pub mod workspace;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    admission::AdmissionGuard, api::routes, config::EngineConfig, metrics::MetricsRegistry,
    sandbox::{ContainerExecutor, DockerEngine}, service::SubmissionEngine, store::SubmissionStore,
    workspace::WorkspaceBuilder,
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let docker = Arc::new(
        DockerEngine::connect(config.docker_socket.as_deref())
            .context("container engine init failed")?,
    );
    if !config.prepull_images.is_empty() {
        let docker = docker.clone();
        let images = config.prepull_images.clone();
        tokio::spawn(async move { docker.ensure_images(&images).await });
    }

    let executor = ContainerExecutor::new(docker.clone(), config.sandbox.executor_limits());
    let engine = Arc::new(SubmissionEngine::new(
        SubmissionStore::new(config.persistence_path.clone()),
        AdmissionGuard::new(docker, config.sandbox.user_label.clone()),
        WorkspaceBuilder::new(config.workspace_root.clone()),
        executor,
        Arc::new(MetricsRegistry::new()),
        config.max_concurrent_evaluations,
    ));

    let app: Router = routes(engine);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(
        bind = %local,
        workspace_root = %config.workspace_root.display(),
        memory_mb = config.sandbox.memory_mb,
        timeout_secs = config.sandbox.timeout_secs,
        "submission grader ready"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
