//! Director configuration, loaded from `QUAY_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Per-operation timeout tiers for the external systems the director talks
/// to. The long tiers cover state save/restore of large studies; the short
/// tier keeps the sweep loop responsive when a sidecar is gone.
#[derive(Debug, Clone)]
pub struct TimeoutTiers {
    /// Plain Docker Engine API requests.
    pub engine_request: Duration,

    /// TCP connect to either the engine or a sidecar.
    pub connect: Duration,

    /// Sidecar health probe. Deliberately short; an unhealthy sidecar must
    /// not stall the whole sweep.
    pub health_check: Duration,

    /// Creating or tearing down the user containers.
    pub container_lifecycle: Duration,

    /// Saving or restoring service state and ports.
    pub state_save_restore: Duration,

    /// Restarting the user containers in place.
    pub restart_containers: Duration,

    /// Attaching or detaching a container to a project network.
    pub network_attach_detach: Duration,
}

impl Default for TimeoutTiers {
    fn default() -> Self {
        Self {
            engine_request: Duration::from_secs(30),
            connect: Duration::from_secs(5),
            health_check: Duration::from_secs(1),
            container_lifecycle: Duration::from_secs(60 * 60),
            state_save_restore: Duration::from_secs(60 * 60),
            restart_containers: Duration::from_secs(60),
            network_attach_detach: Duration::from_secs(30),
        }
    }
}

/// Director settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the REST API listens on.
    pub listen_addr: SocketAddr,

    /// Docker Engine API endpoint (e.g. `http://localhost:2375`).
    pub engine_endpoint: String,

    /// Swarm stack name stamped on every service the director creates.
    pub swarm_stack_name: String,

    /// Port the sidecar API listens on inside its container.
    pub sidecar_port: u16,

    /// Image used for the sidecar service.
    pub sidecar_image: String,

    /// Image used for the proxy service.
    pub proxy_image: String,

    /// Delay between observation sweeps.
    pub sweep_interval: Duration,

    /// How long a service may stay in a pre-running state before it is
    /// marked failed.
    pub startup_timeout: Duration,

    /// Grace period for in-flight observations during shutdown.
    pub shutdown_grace: Duration,

    /// Failed save/push attempts allowed per service; recording the last
    /// one parks the service for manual intervention.
    pub manual_intervention_max_attempts: u32,

    /// Window over which the failure budget is counted.
    pub manual_intervention_window: Duration,

    pub timeouts: TimeoutTiers,
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("QUAY_DIRECTOR_LISTEN_ADDR", "0.0.0.0:8080")
            .parse()
            .context("invalid QUAY_DIRECTOR_LISTEN_ADDR")?;

        Ok(Self {
            listen_addr,
            engine_endpoint: env_or("QUAY_DOCKER_ENGINE_ENDPOINT", "http://localhost:2375"),
            swarm_stack_name: env_or("QUAY_SWARM_STACK_NAME", "quay"),
            sidecar_port: env_parse("QUAY_SIDECAR_PORT", 8000)?,
            sidecar_image: env_or("QUAY_SIDECAR_IMAGE", "quay/dynamic-sidecar:latest"),
            proxy_image: env_or("QUAY_PROXY_IMAGE", "caddy:2.7"),
            sweep_interval: env_secs("QUAY_SWEEP_INTERVAL_SECS", 5)?,
            startup_timeout: env_secs("QUAY_STARTUP_TIMEOUT_SECS", 60 * 60)?,
            shutdown_grace: env_secs("QUAY_SHUTDOWN_GRACE_SECS", 5)?,
            manual_intervention_max_attempts: env_parse(
                "QUAY_MANUAL_INTERVENTION_MAX_ATTEMPTS",
                quay_retry::DEFAULT_MAX_ATTEMPTS,
            )?,
            manual_intervention_window: env_secs(
                "QUAY_MANUAL_INTERVENTION_WINDOW_SECS",
                10 * 60,
            )?,
            timeouts: TimeoutTiers::default(),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("valid literal"),
            engine_endpoint: "http://localhost:2375".to_string(),
            swarm_stack_name: "quay".to_string(),
            sidecar_port: 8000,
            sidecar_image: "quay/dynamic-sidecar:latest".to_string(),
            proxy_image: "caddy:2.7".to_string(),
            sweep_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60 * 60),
            shutdown_grace: Duration::from_secs(5),
            manual_intervention_max_attempts: quay_retry::DEFAULT_MAX_ATTEMPTS,
            manual_intervention_window: quay_retry::DEFAULT_BUDGET_WINDOW,
            timeouts: TimeoutTiers::default(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}
