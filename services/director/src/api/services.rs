//! Handlers for the `/v1/services` surface.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use quay_ids::{NodeUuid, ProjectId, TaskId, UserId, WalletId};
use serde::{Deserialize, Serialize};

use crate::models::{RestartPolicy, RunningDynamicServiceDetails};
use crate::scheduler::core::AddServiceRequest;
use crate::scheduler::DynamicScheduler;

use super::{ApiError, AppState};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AddServiceBody {
    pub node_uuid: NodeUuid,
    pub project_id: ProjectId,
    pub user_id: UserId,
    #[serde(default)]
    pub wallet_id: Option<WalletId>,
    pub service_key: String,
    pub service_tag: String,
    pub compose_spec: String,
    pub service_port: u16,
    #[serde(default = "default_true")]
    pub can_save: bool,
    #[serde(default)]
    pub project_networks: Vec<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

pub async fn add_service(
    State(state): State<AppState>,
    Json(body): Json<AddServiceBody>,
) -> Result<StatusCode, ApiError> {
    if body.compose_spec.trim().is_empty() {
        return Err(ApiError::bad_request(
            "empty_compose_spec",
            "compose_spec must not be empty",
        ));
    }
    if body.service_key.trim().is_empty() {
        return Err(ApiError::bad_request(
            "empty_service_key",
            "service_key must not be empty",
        ));
    }
    state
        .scheduler
        .add_service(AddServiceRequest {
            node_uuid: body.node_uuid,
            project_id: body.project_id,
            user_id: body.user_id,
            wallet_id: body.wallet_id,
            service_key: body.service_key,
            service_tag: body.service_tag,
            compose_spec: body.compose_spec,
            service_port: body.service_port,
            can_save: body.can_save,
            project_networks: body.project_networks,
            restart_policy: body.restart_policy,
        })
        .await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
pub struct ListFilters {
    pub user_id: Option<UserId>,
    pub project_id: Option<ProjectId>,
}

pub async fn list_services(
    State(state): State<AppState>,
    Query(filters): Query<ListFilters>,
) -> Json<Vec<NodeUuid>> {
    Json(
        state
            .scheduler
            .list_services(filters.user_id, filters.project_id)
            .await,
    )
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
) -> Result<Json<RunningDynamicServiceDetails>, ApiError> {
    Ok(Json(state.scheduler.get_stack_status(&node_uuid).await?))
}

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    pub disable: bool,
}

pub async fn toggle_observation(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
    Json(body): Json<ToggleBody>,
) -> Result<StatusCode, ApiError> {
    if !state.scheduler.is_service_tracked(&node_uuid).await {
        return Err(ApiError::not_found(
            "service_not_found",
            format!("no tracked service for node {node_uuid}"),
        ));
    }
    if state.scheduler.toggle_observation(&node_uuid, body.disable).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::conflict(
            "observation_busy",
            format!("observation for node {node_uuid} is in flight, retry the toggle"),
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct RemovalFilters {
    #[serde(default = "default_true")]
    pub can_save: bool,
}

pub async fn mark_for_removal(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
    Query(filters): Query<RemovalFilters>,
) -> Result<StatusCode, ApiError> {
    state
        .scheduler
        .mark_service_for_removal(&node_uuid, filters.can_save)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
}

async fn require_tracked(state: &AppState, node_uuid: &NodeUuid) -> Result<(), ApiError> {
    if state.scheduler.is_service_tracked(node_uuid).await {
        Ok(())
    } else {
        Err(ApiError::not_found(
            "service_not_found",
            format!("no tracked service for node {node_uuid}"),
        ))
    }
}

pub async fn remove_containers(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    require_tracked(&state, &node_uuid).await?;
    let scheduler = Arc::clone(&state.scheduler);
    let task_id = state
        .tasks
        .submit(
            format!("remove_containers:{node_uuid}"),
            "remove_containers".to_string(),
            move |progress| async move {
                scheduler
                    .remove_service_containers(&node_uuid, Some(progress))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            },
        )
        .await;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

pub async fn remove_docker_resources(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    require_tracked(&state, &node_uuid).await?;
    let scheduler = Arc::clone(&state.scheduler);
    let task_id = state
        .tasks
        .submit(
            format!("remove_docker_resources:{node_uuid}"),
            "remove_docker_resources".to_string(),
            move |progress| async move {
                scheduler
                    .remove_service_docker_resources(&node_uuid, Some(progress))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            },
        )
        .await;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

pub async fn save_state(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    require_tracked(&state, &node_uuid).await?;
    let scheduler = Arc::clone(&state.scheduler);
    let task_id = state
        .tasks
        .submit(
            format!("save_state:{node_uuid}"),
            "save_state".to_string(),
            move |progress| async move {
                scheduler
                    .save_service_state(&node_uuid, Some(progress))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            },
        )
        .await;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

pub async fn push_outputs(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    require_tracked(&state, &node_uuid).await?;
    let scheduler = Arc::clone(&state.scheduler);
    let task_id = state
        .tasks
        .submit(
            format!("push_outputs:{node_uuid}"),
            "push_outputs".to_string(),
            move |progress| async move {
                scheduler
                    .push_service_outputs(&node_uuid, Some(progress))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            },
        )
        .await;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

#[derive(Debug, Deserialize)]
pub struct RetrieveInputsBody {
    #[serde(default)]
    pub port_keys: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct RetrieveInputsResponse {
    pub transferred_bytes: i64,
}

pub async fn retrieve_inputs(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
    Json(body): Json<RetrieveInputsBody>,
) -> Result<Json<RetrieveInputsResponse>, ApiError> {
    let transferred_bytes = state
        .scheduler
        .retrieve_service_inputs(&node_uuid, body.port_keys)
        .await?;
    Ok(Json(RetrieveInputsResponse { transferred_bytes }))
}

pub async fn restart_containers(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.restart_containers(&node_uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn free_reserved_disk_space(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.free_reserved_disk_space(&node_uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AttachNetworkBody {
    pub network_name: String,
    #[serde(default)]
    pub network_aliases: Vec<String>,
}

pub async fn attach_network(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
    Json(body): Json<AttachNetworkBody>,
) -> Result<StatusCode, ApiError> {
    state
        .scheduler
        .attach_project_network(&node_uuid, &body.network_name, &body.network_aliases)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DetachNetworkBody {
    pub network_name: String,
}

pub async fn detach_network(
    State(state): State<AppState>,
    Path(node_uuid): Path<NodeUuid>,
    Json(body): Json<DetachNetworkBody>,
) -> Result<StatusCode, ApiError> {
    state
        .scheduler
        .detach_project_network(&node_uuid, &body.network_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
