//! High-level Docker operations used by the scheduler.
//!
//! Everything here is written against the [`DockerEngine`] trait and bakes
//! in the policies the observation cycle relies on: idempotent network
//! creation, best-effort removals, the out-of-sequence retry on label
//! updates, and bounded waits for placement.

use std::collections::BTreeMap;
use std::time::Duration;

use quay_ids::{NodeUuid, ProjectId};
use quay_retry::BackoffPolicy;
use tracing::{debug, warn};

use crate::docker::engine::{DockerEngine, NetworkSpec, ServiceSpec};
use crate::docker::states::extract_service_state;
use crate::error::DockerError;
use crate::models::{
    SchedulerData, ServiceState, NODE_UUID_LABEL, PROJECT_ID_LABEL, SCHEDULER_DATA_LABEL,
    STACK_NAME_LABEL,
};

/// Attempts for the out-of-sequence label-update retry.
const LABEL_UPDATE_ATTEMPTS: u32 = 3;

/// Attempts waiting for the sidecar task to be placed on a node.
const PLACEMENT_ATTEMPTS: u32 = 8;

/// Create an attachable overlay network, tolerating concurrent creation.
///
/// If a network with this name already exists (created by a parallel call
/// or a previous run), its id is returned instead of an error.
pub async fn create_network(
    engine: &dyn DockerEngine,
    spec: &NetworkSpec,
) -> Result<String, DockerError> {
    match engine.create_network(spec).await {
        Ok(id) => Ok(id),
        Err(DockerError::Engine { message, .. }) if message.contains("already exists") => {
            let existing = engine.list_networks(&spec.name).await?;
            existing
                .into_iter()
                .next()
                .map(|n| n.id)
                .ok_or_else(|| DockerError::Transport(format!(
                    "network {} reported as existing but not listed",
                    spec.name
                )))
        }
        Err(e) => Err(e),
    }
}

/// Create (or resolve) one project network, labeled with its project id.
pub async fn create_project_network(
    engine: &dyn DockerEngine,
    name: &str,
    project_id: &ProjectId,
) -> Result<String, DockerError> {
    let mut spec = NetworkSpec::overlay(name);
    spec.labels
        .insert(PROJECT_ID_LABEL.to_string(), project_id.to_string());
    create_network(engine, &spec).await
}

/// Resolve the ids of a project's networks, creating any that are missing.
///
/// Duplicate names collapse to a single entry in the returned map.
pub async fn get_or_create_networks_ids(
    engine: &dyn DockerEngine,
    network_names: &[String],
    project_id: &ProjectId,
) -> Result<BTreeMap<String, String>, DockerError> {
    let mut ids = BTreeMap::new();
    for name in network_names {
        if ids.contains_key(name) {
            continue;
        }
        let id = create_project_network(engine, name, project_id).await?;
        ids.insert(name.clone(), id);
    }
    Ok(ids)
}

/// Create a service and return its id.
pub async fn create_service_and_get_id(
    engine: &dyn DockerEngine,
    spec: &ServiceSpec,
) -> Result<String, DockerError> {
    let id = engine.create_service(spec).await?;
    debug!(service_name = %spec.name, service_id = %id, "Service created");
    Ok(id)
}

/// Observed state of the sidecar service, derived from its Swarm tasks.
///
/// A service with no tasks yet, or one the engine no longer knows, reports
/// `Pending`; the observation cycle treats both as "not there yet".
pub async fn get_sidecar_state(
    engine: &dyn DockerEngine,
    service_name: &str,
) -> Result<(ServiceState, String), DockerError> {
    match engine.list_tasks(service_name).await {
        Ok(tasks) => Ok(extract_service_state(&tasks)),
        Err(DockerError::ServiceNotFound(_)) => {
            Ok((ServiceState::Pending, "service not created yet".to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Wait for the sidecar task to be assigned to a Swarm node and return that
/// node's id. Bounded by `PLACEMENT_ATTEMPTS` with exponential backoff.
pub async fn get_sidecar_placement(
    engine: &dyn DockerEngine,
    service_name: &str,
) -> Result<String, DockerError> {
    let backoff = BackoffPolicy {
        base: Duration::from_millis(500),
        max: Duration::from_secs(10),
        jitter: 0.2,
    };

    for attempt in 0..PLACEMENT_ATTEMPTS {
        let tasks = engine.list_tasks(service_name).await?;
        if let Some(node_id) = tasks.first().and_then(|t| t.node_id.clone()) {
            if !node_id.is_empty() {
                return Ok(node_id);
            }
        }
        tokio::time::sleep(backoff.delay(attempt)).await;
    }

    Err(DockerError::Timeout(format!(
        "sidecar {service_name} was not placed on any node"
    )))
}

/// True if neither the sidecar nor the proxy service exists anymore.
pub async fn is_stack_missing(
    engine: &dyn DockerEngine,
    node_uuid: &NodeUuid,
    stack_name: &str,
) -> Result<bool, DockerError> {
    let services = engine
        .list_services(&[
            (STACK_NAME_LABEL.to_string(), stack_name.to_string()),
            (NODE_UUID_LABEL.to_string(), node_uuid.to_string()),
        ])
        .await?;
    Ok(services.is_empty())
}

/// True if both the sidecar and the proxy service exist.
pub async fn are_sidecar_and_proxy_present(
    engine: &dyn DockerEngine,
    node_uuid: &NodeUuid,
    stack_name: &str,
) -> Result<bool, DockerError> {
    let services = engine
        .list_services(&[
            (STACK_NAME_LABEL.to_string(), stack_name.to_string()),
            (NODE_UUID_LABEL.to_string(), node_uuid.to_string()),
        ])
        .await?;
    Ok(services.len() >= 2)
}

/// Remove the sidecar and proxy services of one node.
///
/// Best-effort: a service that is already gone does not fail the call.
/// Returns true if anything was actually removed.
pub async fn remove_sidecar_stack(
    engine: &dyn DockerEngine,
    node_uuid: &NodeUuid,
    stack_name: &str,
) -> Result<bool, DockerError> {
    let services = engine
        .list_services(&[
            (STACK_NAME_LABEL.to_string(), stack_name.to_string()),
            (NODE_UUID_LABEL.to_string(), node_uuid.to_string()),
        ])
        .await?;

    let mut removed_any = false;
    for service in services {
        match engine.remove_service(&service.id).await {
            Ok(()) => removed_any = true,
            Err(DockerError::ServiceNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed_any)
}

/// Remove a network, tolerating it being already gone.
///
/// Returns true if the network was actually removed.
pub async fn remove_network_if_present(
    engine: &dyn DockerEngine,
    network_name: &str,
) -> Result<bool, DockerError> {
    match engine.remove_network(network_name).await {
        Ok(()) => Ok(true),
        Err(DockerError::ServiceNotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Persist the scheduler data into the sidecar service's labels.
///
/// Concurrent spec updates make the engine reject with "out of sequence";
/// the inspect-then-update is retried a bounded number of times. A sidecar
/// service that no longer exists is a silent no-op: the entry is on its way
/// out and there is nothing left to persist on.
pub async fn update_scheduler_data_label(
    engine: &dyn DockerEngine,
    data: &SchedulerData,
) -> Result<(), DockerError> {
    let service_name = data.service_name.to_string();

    for attempt in 1..=LABEL_UPDATE_ATTEMPTS {
        let inspected = match engine.inspect_service(&service_name).await {
            Ok(inspected) => inspected,
            Err(DockerError::ServiceNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut spec = inspected.spec.clone();
        spec.labels
            .insert(SCHEDULER_DATA_LABEL.to_string(), data.to_label());

        match engine
            .update_service(&inspected.id, inspected.version.index, &spec)
            .await
        {
            Ok(()) => return Ok(()),
            Err(DockerError::ServiceNotFound(_)) => return Ok(()),
            Err(DockerError::Engine { message, .. })
                if message.contains("out of sequence") && attempt < LABEL_UPDATE_ATTEMPTS =>
            {
                debug!(
                    service_name = %service_name,
                    attempt,
                    "Label update raced a concurrent spec change, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }

    Err(DockerError::Engine {
        status: 500,
        message: format!("label update kept racing on {service_name}"),
    })
}

/// Pin a service to the Swarm node its sidecar runs on.
pub async fn constrain_service_to_node(
    engine: &dyn DockerEngine,
    service_name: &str,
    docker_node_id: &str,
) -> Result<(), DockerError> {
    let inspected = engine.inspect_service(service_name).await?;
    let mut spec = inspected.spec.clone();
    let constraint = format!("node.id=={docker_node_id}");
    if !spec.task_template.placement.constraints.contains(&constraint) {
        spec.task_template.placement.constraints.push(constraint);
    }
    engine
        .update_service(&inspected.id, inspected.version.index, &spec)
        .await
}

/// Recover the tracked services of this stack from their labels.
///
/// Entries whose label cannot be decoded are skipped with a warning; one
/// corrupt label must not block recovery of the rest.
pub async fn discover_tracked_services(
    engine: &dyn DockerEngine,
    stack_name: &str,
) -> Result<Vec<SchedulerData>, DockerError> {
    let services = engine
        .list_services(&[(STACK_NAME_LABEL.to_string(), stack_name.to_string())])
        .await?;

    let mut discovered = Vec::new();
    for service in services {
        let Some(label) = service.spec.labels.get(SCHEDULER_DATA_LABEL) else {
            continue;
        };
        match SchedulerData::from_label(label) {
            Ok(data) => discovered.push(data),
            Err(e) => {
                warn!(
                    service_name = %service.spec.name,
                    error = %e,
                    "Skipping service with undecodable scheduler-data label"
                );
            }
        }
    }
    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::engine::MockEngine;
    use quay_ids::{ProjectId, UserId};

    fn sample_data() -> SchedulerData {
        SchedulerData::new(
            NodeUuid::new(),
            ProjectId::new(),
            UserId::new(),
            None,
            "quay/services/sleeper".to_string(),
            "1.0.0".to_string(),
            String::new(),
            8080,
            8000,
            true,
        )
    }

    async fn create_sidecar_service(engine: &MockEngine, data: &SchedulerData) -> String {
        let mut spec = ServiceSpec {
            name: data.service_name.to_string(),
            labels: data.service_labels("quay"),
            ..Default::default()
        };
        spec.labels
            .insert(SCHEDULER_DATA_LABEL.to_string(), data.to_label());
        engine.create_service(&spec).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_network_is_idempotent() {
        let engine = MockEngine::new();
        let spec = NetworkSpec::overlay("prj-net");

        let first = create_network(&engine, &spec).await.unwrap();
        let second = create_network(&engine, &spec).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_project_networks_are_deduplicated_and_labeled() {
        let engine = MockEngine::new();
        let project_id = ProjectId::new();
        let names = vec![
            "prj-shared".to_string(),
            "prj-extra".to_string(),
            "prj-shared".to_string(),
        ];

        let ids = get_or_create_networks_ids(&engine, &names, &project_id)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains_key("prj-shared"));
        assert!(ids.contains_key("prj-extra"));

        let labels = engine.network_labels("prj-shared").await.unwrap();
        assert_eq!(labels[PROJECT_ID_LABEL], project_id.to_string());
    }

    #[tokio::test]
    async fn test_label_update_survives_out_of_sequence() {
        let engine = MockEngine::new();
        let mut data = sample_data();
        create_sidecar_service(&engine, &data).await;

        engine.fail_updates_out_of_sequence(2).await;
        data.current_state = ServiceState::Running;
        update_scheduler_data_label(&engine, &data).await.unwrap();

        // 2 rejected attempts + 1 success.
        assert_eq!(engine.update_calls().await, 3);
        let labels = engine
            .service_labels(&data.service_name.to_string())
            .await
            .unwrap();
        let stored = SchedulerData::from_label(&labels[SCHEDULER_DATA_LABEL]).unwrap();
        assert_eq!(stored.current_state, ServiceState::Running);
    }

    #[tokio::test]
    async fn test_label_update_on_missing_service_is_noop() {
        let engine = MockEngine::new();
        let data = sample_data();

        update_scheduler_data_label(&engine, &data).await.unwrap();
        assert_eq!(engine.update_calls().await, 0);
    }

    #[tokio::test]
    async fn test_remove_stack_reports_whether_anything_was_removed() {
        let engine = MockEngine::new();
        let data = sample_data();
        create_sidecar_service(&engine, &data).await;

        assert!(remove_sidecar_stack(&engine, &data.node_uuid, "quay")
            .await
            .unwrap());
        assert!(!remove_sidecar_stack(&engine, &data.node_uuid, "quay")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_stack_presence_checks() {
        let engine = MockEngine::new();
        let data = sample_data();

        assert!(is_stack_missing(&engine, &data.node_uuid, "quay")
            .await
            .unwrap());

        create_sidecar_service(&engine, &data).await;
        assert!(!is_stack_missing(&engine, &data.node_uuid, "quay")
            .await
            .unwrap());
        // Only the sidecar exists, not the proxy.
        assert!(!are_sidecar_and_proxy_present(&engine, &data.node_uuid, "quay")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sidecar_state_of_missing_service_is_pending() {
        let engine = MockEngine::new();
        let (state, _) = get_sidecar_state(&engine, "qy-sidecar_missing")
            .await
            .unwrap();
        assert_eq!(state, ServiceState::Pending);
    }

    #[tokio::test]
    async fn test_discovery_skips_corrupt_labels() {
        let engine = MockEngine::new();
        let data = sample_data();
        create_sidecar_service(&engine, &data).await;

        // A second service with a garbage label.
        let mut bad_labels = data.service_labels("quay");
        bad_labels.insert(SCHEDULER_DATA_LABEL.to_string(), "{broken".to_string());
        engine
            .create_service(&ServiceSpec {
                name: "qy-sidecar_corrupt".to_string(),
                labels: bad_labels,
                ..Default::default()
            })
            .await
            .unwrap();

        let discovered = discover_tracked_services(&engine, "quay").await.unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].node_uuid, data.node_uuid);
    }

    #[tokio::test]
    async fn test_constrain_service_to_node_adds_constraint_once() {
        let engine = MockEngine::new();
        let data = sample_data();
        let name = data.service_name.to_string();
        create_sidecar_service(&engine, &data).await;

        constrain_service_to_node(&engine, &name, "node-xyz")
            .await
            .unwrap();
        constrain_service_to_node(&engine, &name, "node-xyz")
            .await
            .unwrap();

        let svc = engine.inspect_service(&name).await.unwrap();
        assert_eq!(
            svc.spec.task_template.placement.constraints,
            vec!["node.id==node-xyz".to_string()]
        );
    }
}
