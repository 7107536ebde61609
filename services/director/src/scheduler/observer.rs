//! Per-service observation cycle.
//!
//! One call to [`observe_service`] performs at most one reconciliation pass
//! for one tracked service. The caller already holds the entry's mutex, so
//! everything here may mutate the `SchedulerData` freely.
//!
//! Transition sketch (one pass each sweep):
//!
//! ```text
//! paused ............... no side effects
//! marked for removal ... save state / push outputs -> remove resources
//! not created .......... create networks + sidecar/proxy services
//! created, not ready ... watch swarm task, probe health, submit compose
//! compose submitted .... attach the user containers to project networks
//! running .............. poll status, surface it
//! ```
//!
//! Failures saving state or pushing outputs during teardown consume a
//! windowed failure budget; exhaustion parks the entry for an operator
//! instead of silently discarding user data. Resource removal failures are
//! retried on every subsequent sweep until confirmed gone.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use quay_retry::RetryBudget;

use crate::config::Settings;
use crate::docker::engine::{
    ContainerSpec, DockerEngine, NetworkAttachment, ServiceSpec, TaskTemplate,
};
use crate::docker::{api as docker_api, NetworkSpec};
use crate::error::{SchedulerError, SidecarError};
use crate::models::{RequestedState, SchedulerData, ServiceState};
use crate::sidecar::SidecarClient;

/// Progress reporting hook threaded through multi-step operations.
pub type ProgressCallback = Arc<dyn Fn(&str, f32) + Send + Sync>;

fn report(progress: Option<&ProgressCallback>, message: &str, percent: f32) {
    if let Some(cb) = progress {
        cb(message, percent);
    }
}

/// What one observation pass did to the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationOutcome {
    /// Nothing changed (paused, still waiting, or parked).
    Unchanged,

    /// The entry advanced; its label should be re-persisted.
    Progressed,

    /// Removal is confirmed; the entry must be dropped from the store.
    RemoveEntry,

    /// The failure budget is exhausted; the entry is parked.
    ManualIntervention,
}

/// Shared collaborators of every observation pass.
pub struct ObserverContext {
    pub engine: Arc<dyn DockerEngine>,
    pub sidecar: Arc<SidecarClient>,
    pub settings: Settings,
    pub budget: Mutex<RetryBudget>,
}

/// Run one reconciliation pass. The caller holds the entry mutex.
pub async fn observe_service(
    ctx: &ObserverContext,
    data: &mut SchedulerData,
    progress: Option<&ProgressCallback>,
) -> ObservationOutcome {
    if data.paused {
        debug!(node_uuid = %data.node_uuid, "Observation paused, skipping");
        return ObservationOutcome::Unchanged;
    }

    if data.requested_state == RequestedState::Stopped
        || data.dynamic_sidecar.removal_state.can_remove
    {
        return teardown(ctx, data, progress).await;
    }

    if data.dynamic_sidecar.wait_for_manual_intervention {
        return ObservationOutcome::Unchanged;
    }

    if !data.dynamic_sidecar.were_containers_created {
        return match prepare_resources(ctx, data).await {
            Ok(()) => ObservationOutcome::Progressed,
            Err(e) => {
                warn!(node_uuid = %data.node_uuid, error = %e, "Resource creation failed");
                data.dynamic_sidecar.status.update_failing(e.to_string());
                ObservationOutcome::Unchanged
            }
        };
    }

    if !data.dynamic_sidecar.was_compose_spec_submitted {
        return progress_startup(ctx, data).await;
    }

    if !data.dynamic_sidecar.is_project_network_attached {
        if data.project_networks.is_empty() {
            data.dynamic_sidecar.is_project_network_attached = true;
        } else {
            return attach_project_networks(ctx, data).await;
        }
    }

    observe_running(ctx, data).await
}

// =============================================================================
// Startup path
// =============================================================================

/// Create the project networks, the per-service network, and the
/// sidecar/proxy Swarm services.
pub async fn prepare_resources(
    ctx: &ObserverContext,
    data: &mut SchedulerData,
) -> Result<(), SchedulerError> {
    let stack = &ctx.settings.swarm_stack_name;
    let engine = ctx.engine.as_ref();

    let service_network = data.network_name(stack);
    docker_api::create_network(engine, &NetworkSpec::overlay(&service_network)).await?;
    docker_api::get_or_create_networks_ids(engine, &data.project_networks, &data.project_id)
        .await?;

    let sidecar_spec = swarm_service_spec(
        data,
        &data.service_name.to_string(),
        &ctx.settings.sidecar_image,
        &service_network,
        stack,
    );
    docker_api::create_service_and_get_id(engine, &sidecar_spec).await?;

    let proxy_spec = swarm_service_spec(
        data,
        &data.proxy_service_name.to_string(),
        &ctx.settings.proxy_image,
        &service_network,
        stack,
    );
    docker_api::create_service_and_get_id(engine, &proxy_spec).await?;

    data.dynamic_sidecar.were_containers_created = true;
    data.started_at = Some(Utc::now());
    data.current_state = ServiceState::Pending;
    data.current_state_info = "sidecar and proxy services created".to_string();

    info!(
        node_uuid = %data.node_uuid,
        service_name = %data.service_name,
        "Dynamic-service resources created"
    );
    Ok(())
}

fn swarm_service_spec(
    data: &SchedulerData,
    name: &str,
    image: &str,
    service_network: &str,
    stack: &str,
) -> ServiceSpec {
    let mut labels = data.service_labels(stack);
    labels.insert(
        crate::models::SCHEDULER_DATA_LABEL.to_string(),
        data.to_label(),
    );
    ServiceSpec {
        name: name.to_string(),
        labels,
        task_template: TaskTemplate {
            container_spec: ContainerSpec {
                image: image.to_string(),
                env: vec![
                    format!("QUAY_NODE_UUID={}", data.node_uuid),
                    format!("QUAY_SERVICE_PORT={}", data.service_port),
                ],
                labels: Default::default(),
            },
            placement: Default::default(),
            networks: vec![NetworkAttachment {
                target: service_network.to_string(),
            }],
        },
    }
}

/// Drive the entry from "services created" to "user containers running".
async fn progress_startup(
    ctx: &ObserverContext,
    data: &mut SchedulerData,
) -> ObservationOutcome {
    let engine = ctx.engine.as_ref();
    let service_name = data.service_name.to_string();

    let (swarm_state, message) = match docker_api::get_sidecar_state(engine, &service_name).await
    {
        Ok(observed) => observed,
        Err(e) => {
            warn!(node_uuid = %data.node_uuid, error = %e, "Sidecar state inspection failed");
            data.dynamic_sidecar.status.update_failing(e.to_string());
            return ObservationOutcome::Unchanged;
        }
    };

    match swarm_state {
        ServiceState::Failed | ServiceState::Complete => {
            data.current_state = ServiceState::Failed;
            data.current_state_info = message;
            return ObservationOutcome::Progressed;
        }
        ServiceState::Pending | ServiceState::Pulling | ServiceState::Starting => {
            // Capacity shortages and image pulls resolve on their own; only
            // the overall startup deadline bounds the wait.
            if startup_deadline_passed(ctx, data) {
                data.current_state = ServiceState::Failed;
                data.current_state_info = "startup deadline exceeded".to_string();
                return ObservationOutcome::Progressed;
            }
            data.current_state = swarm_state;
            data.current_state_info = message;
            return ObservationOutcome::Unchanged;
        }
        ServiceState::Running => {}
    }

    if startup_deadline_passed(ctx, data) {
        data.current_state = ServiceState::Failed;
        data.current_state_info = "startup deadline exceeded".to_string();
        return ObservationOutcome::Progressed;
    }

    let endpoint = data.dynamic_sidecar.endpoint();
    if !ctx.sidecar.is_healthy(&endpoint).await {
        data.current_state = ServiceState::Starting;
        data.current_state_info = "waiting for sidecar health".to_string();
        data.dynamic_sidecar
            .status
            .update_failing("sidecar not answering health probes yet");
        return ObservationOutcome::Unchanged;
    }
    data.dynamic_sidecar.status.update_ok();

    if !data.dynamic_sidecar.is_ready {
        data.dynamic_sidecar.is_ready = true;

        match docker_api::get_sidecar_placement(engine, &service_name).await {
            Ok(node_id) => {
                // The proxy must share the sidecar's node to reach it over
                // the service network without swarm routing surprises.
                if let Err(e) = docker_api::constrain_service_to_node(
                    engine,
                    &data.proxy_service_name.to_string(),
                    &node_id,
                )
                .await
                {
                    warn!(node_uuid = %data.node_uuid, error = %e, "Proxy placement pinning failed");
                }
                data.dynamic_sidecar.docker_node_id = Some(node_id);
            }
            Err(e) => {
                warn!(node_uuid = %data.node_uuid, error = %e, "Sidecar placement not resolved");
            }
        }
    }

    if let Err(e) = prepare_service_environment(ctx, data, &endpoint).await {
        warn!(node_uuid = %data.node_uuid, error = %e, "Environment preparation failed");
        data.dynamic_sidecar.status.update_failing(e.to_string());
        return ObservationOutcome::Unchanged;
    }

    if let Err(e) = ctx.sidecar.create_containers(&endpoint, &data.compose_spec).await {
        warn!(node_uuid = %data.node_uuid, error = %e, "Compose spec submission failed");
        data.dynamic_sidecar.status.update_failing(e.to_string());
        return ObservationOutcome::Unchanged;
    }

    data.dynamic_sidecar.was_compose_spec_submitted = true;
    data.current_state = ServiceState::Starting;
    data.current_state_info = "user containers starting".to_string();
    info!(node_uuid = %data.node_uuid, "Compose spec submitted to sidecar");
    ObservationOutcome::Progressed
}

/// Attach the user containers to the project networks requested at creation
/// time. Runs once per entry, after the compose spec is accepted.
async fn attach_project_networks(
    ctx: &ObserverContext,
    data: &mut SchedulerData,
) -> ObservationOutcome {
    let network_ids = match docker_api::get_or_create_networks_ids(
        ctx.engine.as_ref(),
        &data.project_networks,
        &data.project_id,
    )
    .await
    {
        Ok(ids) => ids,
        Err(e) => {
            warn!(node_uuid = %data.node_uuid, error = %e, "Project network resolution failed");
            data.dynamic_sidecar.status.update_failing(e.to_string());
            return ObservationOutcome::Unchanged;
        }
    };

    let endpoint = data.dynamic_sidecar.endpoint();
    let containers = match container_names(ctx, &endpoint).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!(node_uuid = %data.node_uuid, error = %e, "Container listing failed");
            return ObservationOutcome::Unchanged;
        }
    };
    if containers.is_empty() {
        // The compose spec was only just accepted; the containers show up on
        // a later sweep.
        return ObservationOutcome::Unchanged;
    }

    for (network_name, network_id) in &network_ids {
        for container in &containers {
            if let Err(e) = ctx
                .sidecar
                .attach_container_to_network(&endpoint, container, network_id, &[])
                .await
            {
                warn!(
                    node_uuid = %data.node_uuid,
                    network_name = %network_name,
                    container = %container,
                    error = %e,
                    "Project network attachment failed"
                );
                data.dynamic_sidecar.status.update_failing(e.to_string());
                return ObservationOutcome::Unchanged;
            }
        }
    }

    data.dynamic_sidecar.is_project_network_attached = true;
    info!(
        node_uuid = %data.node_uuid,
        networks = network_ids.len(),
        containers = containers.len(),
        "User containers attached to project networks"
    );
    ObservationOutcome::Progressed
}

/// Container names currently reported by the sidecar.
pub(crate) async fn container_names(
    ctx: &ObserverContext,
    endpoint: &str,
) -> Result<Vec<String>, SchedulerError> {
    let status = ctx.sidecar.containers_status(endpoint).await?;
    Ok(status
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default())
}

/// Restore prior state and pull port data before the user containers start.
async fn prepare_service_environment(
    ctx: &ObserverContext,
    data: &SchedulerData,
    endpoint: &str,
) -> Result<(), SidecarError> {
    if data.dynamic_sidecar.removal_state.can_save {
        ctx.sidecar.restore_state(endpoint).await?;
    }
    let pulled_in = ctx.sidecar.pull_input_ports(endpoint, None).await?;
    let pulled_out = ctx.sidecar.pull_output_ports(endpoint).await?;
    debug!(
        node_uuid = %data.node_uuid,
        input_bytes = pulled_in,
        output_bytes = pulled_out,
        "Port data pulled"
    );
    Ok(())
}

fn startup_deadline_passed(ctx: &ObserverContext, data: &SchedulerData) -> bool {
    let Some(started_at) = data.started_at else {
        return false;
    };
    let elapsed = Utc::now().signed_duration_since(started_at);
    matches!(elapsed.to_std(), Ok(e) if e > ctx.settings.startup_timeout)
}

// =============================================================================
// Steady state
// =============================================================================

/// Poll swarm and sidecar status for a running service.
async fn observe_running(ctx: &ObserverContext, data: &mut SchedulerData) -> ObservationOutcome {
    let engine = ctx.engine.as_ref();
    let service_name = data.service_name.to_string();

    // Someone removing the sidecar or proxy behind the director's back is a
    // failure of the whole stack, not a transient condition.
    match docker_api::are_sidecar_and_proxy_present(
        engine,
        &data.node_uuid,
        &ctx.settings.swarm_stack_name,
    )
    .await
    {
        Ok(true) => {}
        Ok(false) => {
            let previous = data.current_state;
            data.current_state = ServiceState::Failed;
            data.current_state_info =
                "sidecar or proxy service disappeared from the swarm".to_string();
            return if previous == ServiceState::Failed {
                ObservationOutcome::Unchanged
            } else {
                ObservationOutcome::Progressed
            };
        }
        Err(e) => {
            warn!(node_uuid = %data.node_uuid, error = %e, "Stack presence check failed");
            return ObservationOutcome::Unchanged;
        }
    }

    let (swarm_state, message) = match docker_api::get_sidecar_state(engine, &service_name).await
    {
        Ok(observed) => observed,
        Err(e) => {
            warn!(node_uuid = %data.node_uuid, error = %e, "Sidecar state inspection failed");
            return ObservationOutcome::Unchanged;
        }
    };

    let endpoint = data.dynamic_sidecar.endpoint();
    let healthy = ctx.sidecar.is_healthy(&endpoint).await;
    if healthy {
        data.dynamic_sidecar.status.update_ok();
    } else {
        data.dynamic_sidecar
            .status
            .update_failing("health probe failed");
    }

    let previous = data.current_state;
    data.current_state = if healthy {
        swarm_state.merge(ServiceState::Running)
    } else {
        swarm_state.merge(ServiceState::Starting)
    };
    data.current_state_info = message;

    if data.current_state == previous {
        ObservationOutcome::Unchanged
    } else {
        ObservationOutcome::Progressed
    }
}

// =============================================================================
// Teardown path
// =============================================================================

/// Drive a service marked for removal toward confirmed deletion.
async fn teardown(
    ctx: &ObserverContext,
    data: &mut SchedulerData,
    progress: Option<&ProgressCallback>,
) -> ObservationOutcome {
    let removal = data.dynamic_sidecar.removal_state.clone();

    let must_save = removal.can_save
        && !data.dynamic_sidecar.were_state_and_outputs_saved
        && data.dynamic_sidecar.was_compose_spec_submitted;

    let mut saved_this_pass = false;
    if must_save {
        if data.dynamic_sidecar.wait_for_manual_intervention {
            return ObservationOutcome::Unchanged;
        }
        match save_state_and_outputs(ctx, data, progress).await {
            Ok(()) => {
                data.dynamic_sidecar.were_state_and_outputs_saved = true;
                saved_this_pass = true;
                ctx.budget.lock().await.clear(&data.node_uuid.to_string());
            }
            Err(e) => {
                error!(node_uuid = %data.node_uuid, error = %e, "State save failed during teardown");
                let exhausted = ctx
                    .budget
                    .lock()
                    .await
                    .record_failure(&data.node_uuid.to_string());
                if exhausted {
                    data.dynamic_sidecar.wait_for_manual_intervention = true;
                    error!(
                        node_uuid = %data.node_uuid,
                        "Save budget exhausted, parking service for manual intervention"
                    );
                    return ObservationOutcome::ManualIntervention;
                }
                return ObservationOutcome::Unchanged;
            }
        }
    }

    match remove_docker_resources(ctx, data, progress).await {
        Ok(()) => ObservationOutcome::RemoveEntry,
        Err(e) => {
            // Leaked swarm resources are worse than a slow retry; the next
            // sweep tries again.
            warn!(node_uuid = %data.node_uuid, error = %e, "Resource removal failed, will retry");
            if saved_this_pass {
                // The saved flag must reach the label now, or a restart in
                // between would save the whole state again.
                ObservationOutcome::Progressed
            } else {
                ObservationOutcome::Unchanged
            }
        }
    }
}

/// Save the service state, then push its outputs.
pub async fn save_state_and_outputs(
    ctx: &ObserverContext,
    data: &SchedulerData,
    progress: Option<&ProgressCallback>,
) -> Result<(), SidecarError> {
    let endpoint = data.dynamic_sidecar.endpoint();

    report(progress, "saving service state", 0.1);
    ctx.sidecar.save_state(&endpoint).await?;

    report(progress, "pushing service outputs", 0.6);
    ctx.sidecar.push_output_ports(&endpoint).await?;

    report(progress, "state and outputs saved", 1.0);
    Ok(())
}

/// Stop the user containers. Invoked directly from the REST layer.
pub async fn remove_service_containers(
    ctx: &ObserverContext,
    data: &SchedulerData,
    progress: Option<&ProgressCallback>,
) -> Result<(), SidecarError> {
    report(progress, "stopping user containers", 0.1);
    ctx.sidecar
        .containers_down(&data.dynamic_sidecar.endpoint())
        .await?;
    report(progress, "user containers stopped", 1.0);
    Ok(())
}

/// Remove the swarm services and the per-service network.
pub async fn remove_docker_resources(
    ctx: &ObserverContext,
    data: &mut SchedulerData,
    progress: Option<&ProgressCallback>,
) -> Result<(), SchedulerError> {
    let engine = ctx.engine.as_ref();
    let stack = &ctx.settings.swarm_stack_name;

    if data.dynamic_sidecar.was_compose_spec_submitted
        && !data.dynamic_sidecar.were_state_and_outputs_saved
    {
        // Best-effort: the sidecar may already be gone.
        if let Err(e) = ctx
            .sidecar
            .containers_down(&data.dynamic_sidecar.endpoint())
            .await
        {
            debug!(node_uuid = %data.node_uuid, error = %e, "Containers-down skipped");
        }
    }

    report(progress, "removing swarm services", 0.3);
    let removed =
        docker_api::remove_sidecar_stack(engine, &data.node_uuid, stack).await?;

    report(progress, "removing service network", 0.7);
    let network_removed =
        docker_api::remove_network_if_present(engine, &data.network_name(stack)).await?;

    data.dynamic_sidecar.removal_state.mark_removed();
    report(progress, "docker resources removed", 1.0);
    info!(
        node_uuid = %data.node_uuid,
        services_removed = removed,
        network_removed,
        "Docker resources removed"
    );
    Ok(())
}
