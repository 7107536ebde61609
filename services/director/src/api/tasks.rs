//! Handlers for the `/v1/tasks` surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use quay_ids::TaskId;

use crate::tasks::TaskStatus;

use super::{ApiError, AppState};

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<TaskStatus>, ApiError> {
    state
        .tasks
        .status(&task_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("task_not_found", format!("no task {task_id}")))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Result<StatusCode, ApiError> {
    if state.tasks.cancel(&task_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(
            "task_not_found",
            format!("no task {task_id}"),
        ))
    }
}
