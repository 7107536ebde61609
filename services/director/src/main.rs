//! quay director
//!
//! Tracks dynamic services on a Docker Swarm: creates their sidecar/proxy
//! stacks, reconciles observed against desired state on a periodic sweep,
//! and serves the REST control surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quay_director::api::{self, AppState};
use quay_director::config::Settings;
use quay_director::docker::HttpDockerEngine;
use quay_director::scheduler::Scheduler;
use quay_director::sidecar::SidecarClient;
use quay_director::tasks::TaskRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting quay director");

    let settings = Settings::from_env()?;
    info!(
        listen_addr = %settings.listen_addr,
        engine_endpoint = %settings.engine_endpoint,
        swarm_stack_name = %settings.swarm_stack_name,
        sweep_interval_secs = settings.sweep_interval.as_secs(),
        "Configuration loaded"
    );

    let engine = Arc::new(
        HttpDockerEngine::new(&settings.engine_endpoint, &settings.timeouts)
            .context("building docker engine client")?,
    );
    let sidecar = Arc::new(
        SidecarClient::new(settings.timeouts.clone()).context("building sidecar client")?,
    );

    let scheduler = Scheduler::new(engine, sidecar, settings.clone());
    scheduler
        .start()
        .await
        .context("recovering tracked services and starting the sweep")?;

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        tasks: TaskRegistry::new(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    info!(listen_addr = %settings.listen_addr, "REST API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
        .context("serving REST API")?;

    scheduler.shutdown().await;
    info!("Director shutdown complete");
    Ok(())
}
