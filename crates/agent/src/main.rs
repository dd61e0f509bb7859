//! Pod Billing Agent - records pod resource requests for billing
//!
//! Runs as a single long-lived deployment per cluster, listing and watching
//! pods and appending one billing record per billing-relevant change.

use anyhow::{anyhow, Context, Result};
use billing_agent::{
    api,
    config::{AgentConfig, Cli, SinkKind},
};
use billing_lib::{
    cluster::{init_kube_client, KubeClusterApi},
    health::{components, HealthRegistry},
    observability::{StructuredLogger, WatcherMetrics},
    sink::{BillingSink, JsonlSink, MemorySink},
    supervisor::Supervisor,
};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = AgentConfig::load(&cli)?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(fmt::layer().json())
        .init();

    let scopes = config.scopes();
    let logger = StructuredLogger::new(&config.cluster_name);
    let scope_labels: Vec<String> = scopes.iter().map(|s| s.label().to_string()).collect();
    logger.log_startup(AGENT_VERSION, &scope_labels);

    // Initialize health registry and metrics
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SINK).await;
    let metrics = WatcherMetrics::new();

    let sink: Arc<dyn BillingSink> = match config.sink.kind {
        SinkKind::Jsonl => Arc::new(
            JsonlSink::open(&config.sink.path)
                .await
                .with_context(|| format!("failed to open billing sink {}", config.sink.path.display()))?,
        ),
        SinkKind::Memory => {
            info!("Using in-memory billing sink, records are not persisted");
            Arc::new(MemorySink::new())
        }
    };

    let client = init_kube_client(config.kubeconfig.clone())
        .await
        .context("failed to create cluster client")?;
    let cluster = KubeClusterApi::new(client).with_watch_timeout(config.watch.timeout_secs);
    cluster.probe().await.context("cluster API unreachable")?;

    let cancel = CancellationToken::new();

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, cancel.clone()));

    let supervisor = Supervisor::new(
        scopes,
        Arc::new(cluster),
        sink,
        config.normalizer(),
        config.supervisor_config(),
    )
    .with_health(health_registry.clone())
    .with_logger(logger.clone());
    let mut supervisor_handle = tokio::spawn(supervisor.run(cancel.clone()));

    let outcome = tokio::select! {
        reason = shutdown_signal() => {
            logger.log_shutdown(reason);
            cancel.cancel();
            supervisor_handle.await
        }
        finished = &mut supervisor_handle => {
            cancel.cancel();
            finished
        }
    };

    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            logger.log_shutdown("watch supervision failed");
            Err(e.into())
        }
        Err(e) => Err(anyhow!("supervisor task failed: {}", e)),
    }
}

/// Resolves on SIGINT or SIGTERM, returning which one arrived
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
