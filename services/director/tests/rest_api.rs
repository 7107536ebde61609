//! REST surface round-trips over an in-memory axum router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use quay_director::api::{router, AppState};
use quay_director::config::{Settings, TimeoutTiers};
use quay_director::docker::MockEngine;
use quay_director::scheduler::{DynamicScheduler, Scheduler};
use quay_director::sidecar::SidecarClient;
use quay_director::tasks::TaskRegistry;
use quay_ids::{NodeUuid, ProjectId, UserId};
use quay_retry::RetryPolicy;

struct Harness {
    app: axum::Router,
    scheduler: Arc<Scheduler>,
}

fn harness() -> Harness {
    let mut settings = Settings::default();
    settings.swarm_stack_name = "quay-test".to_string();

    let mut sidecar = SidecarClient::new(TimeoutTiers::default()).unwrap();
    sidecar.set_transient_retry(RetryPolicy::none());

    let scheduler = Scheduler::new(
        Arc::new(MockEngine::new()),
        Arc::new(sidecar),
        settings,
    );
    let app = router(AppState {
        scheduler: Arc::clone(&scheduler),
        tasks: TaskRegistry::new(),
    });
    Harness { app, scheduler }
}

fn add_body(node_uuid: &NodeUuid) -> Value {
    json!({
        "node_uuid": node_uuid.to_string(),
        "project_id": ProjectId::new().to_string(),
        "user_id": UserId::new().to_string(),
        "service_key": "quay/services/jupyter-lab",
        "service_tag": "2.1.0",
        "compose_spec": "services: {}",
        "service_port": 8888,
    })
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_add_list_state_roundtrip() {
    let h = harness();
    let node_uuid = NodeUuid::new();

    let (status, _) = send(&h.app, post_json("/v1/services", &add_body(&node_uuid))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &h.app,
        Request::get("/v1/services").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([node_uuid.to_string()]));

    let (status, body) = send(
        &h.app,
        Request::get(format!("/v1/services/{node_uuid}/state"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service_state"], "pending");
    assert_eq!(body["service_key"], "quay/services/jupyter-lab");
}

#[tokio::test]
async fn test_duplicate_add_conflicts_with_problem_details() {
    let h = harness();
    let node_uuid = NodeUuid::new();
    let body = add_body(&node_uuid);

    send(&h.app, post_json("/v1/services", &body)).await;
    let (status, problem) = send(&h.app, post_json("/v1/services", &body)).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["code"], "service_already_tracked");
    assert!(problem["detail"]
        .as_str()
        .unwrap()
        .contains(&node_uuid.to_string()));
}

#[tokio::test]
async fn test_list_filters_by_user() {
    let h = harness();
    let user = UserId::new();
    let node_uuid = NodeUuid::new();

    let mut body = add_body(&node_uuid);
    body["user_id"] = json!(user.to_string());
    send(&h.app, post_json("/v1/services", &body)).await;
    send(&h.app, post_json("/v1/services", &add_body(&NodeUuid::new()))).await;

    let (status, listed) = send(
        &h.app,
        Request::get(format!("/v1/services?user_id={user}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed, json!([node_uuid.to_string()]));
}

#[tokio::test]
async fn test_toggle_observation_roundtrip() {
    let h = harness();
    let node_uuid = NodeUuid::new();

    // Unknown service: 404.
    let (status, _) = send(
        &h.app,
        Request::patch(format!("/v1/services/{node_uuid}/observation"))
            .header("content-type", "application/json")
            .body(Body::from(json!({ "disable": true }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&h.app, post_json("/v1/services", &add_body(&node_uuid))).await;

    let (status, _) = send(
        &h.app,
        Request::patch(format!("/v1/services/{node_uuid}/observation"))
            .header("content-type", "application/json")
            .body(Body::from(json!({ "disable": true }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // A paused entry is skipped by the sweep.
    h.scheduler.sweep_once().await;
    let (_, body) = send(
        &h.app,
        Request::get(format!("/v1/services/{node_uuid}/state"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(body["service_state"], "pending");
}

#[tokio::test]
async fn test_mark_for_removal_then_sweep_untracks() {
    let h = harness();
    let node_uuid = NodeUuid::new();
    send(&h.app, post_json("/v1/services", &add_body(&node_uuid))).await;
    h.scheduler.sweep_once().await;

    let (status, _) = send(
        &h.app,
        Request::delete(format!("/v1/services/{node_uuid}?can_save=false"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    h.scheduler.sweep_once().await;
    assert!(!h.scheduler.is_service_tracked(&node_uuid).await);

    let (status, _) = send(
        &h.app,
        Request::get(format!("/v1/services/{node_uuid}/state"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_slow_operation_returns_pollable_task() {
    let h = harness();
    let node_uuid = NodeUuid::new();
    send(&h.app, post_json("/v1/services", &add_body(&node_uuid))).await;

    let (status, accepted) = send(
        &h.app,
        Request::delete(format!("/v1/services/{node_uuid}/containers"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = accepted["task_id"].as_str().unwrap().to_string();

    // Poll until terminal. The sidecar is unreachable, so the operation
    // fails, and the failure is carried by the task status.
    let final_status = loop {
        let (status, body) = send(
            &h.app,
            Request::get(format!("/v1/tasks/{task_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if body["state"] != "running" {
            break body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert_eq!(final_status["state"], "failed");
    assert!(final_status["error"].as_str().unwrap().contains("sidecar"));

    // Cancelling removes it from the registry.
    let (status, _) = send(
        &h.app,
        Request::delete(format!("/v1/tasks/{task_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(
        &h.app,
        Request::get(format!("/v1/tasks/{task_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_compose_spec_is_rejected() {
    let h = harness();
    let mut body = add_body(&NodeUuid::new());
    body["compose_spec"] = json!("   ");

    let (status, problem) = send(&h.app, post_json("/v1/services", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "empty_compose_spec");
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
