//! REST boundary.
//!
//! Thin handlers over the scheduler's public contract; slow operations are
//! bridged through the task registry and return a task id to poll.

pub mod error;
pub mod services;
pub mod tasks;

use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};

use crate::scheduler::Scheduler;
use crate::tasks::TaskRegistry;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub tasks: Arc<TaskRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/services",
            post(services::add_service).get(services::list_services),
        )
        .route("/v1/services/{node_uuid}", delete(services::mark_for_removal))
        .route("/v1/services/{node_uuid}/state", get(services::get_state))
        .route(
            "/v1/services/{node_uuid}/observation",
            patch(services::toggle_observation),
        )
        .route(
            "/v1/services/{node_uuid}/containers",
            delete(services::remove_containers),
        )
        .route(
            "/v1/services/{node_uuid}/docker-resources",
            delete(services::remove_docker_resources),
        )
        .route(
            "/v1/services/{node_uuid}/state:save",
            post(services::save_state),
        )
        .route(
            "/v1/services/{node_uuid}/outputs:push",
            post(services::push_outputs),
        )
        .route(
            "/v1/services/{node_uuid}/inputs:retrieve",
            post(services::retrieve_inputs),
        )
        .route(
            "/v1/services/{node_uuid}/containers:restart",
            post(services::restart_containers),
        )
        .route(
            "/v1/services/{node_uuid}/disk/reserved:free",
            post(services::free_reserved_disk_space),
        )
        .route(
            "/v1/services/{node_uuid}/networks:attach",
            post(services::attach_network),
        )
        .route(
            "/v1/services/{node_uuid}/networks:detach",
            post(services::detach_network),
        )
        .route(
            "/v1/tasks/{task_id}",
            get(tasks::get_task).delete(tasks::cancel_task),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
