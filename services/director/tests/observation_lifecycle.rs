//! End-to-end observation cycle against a mocked swarm and a wiremock
//! sidecar: create resources, wait for health, submit the compose spec,
//! reach running, then tear down with state saving.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quay_director::config::{Settings, TimeoutTiers};
use quay_director::docker::MockEngine;
use quay_director::models::{SchedulerData, ServiceState};
use quay_director::scheduler::observer::{observe_service, ObservationOutcome, ObserverContext};
use quay_director::sidecar::SidecarClient;
use quay_ids::{NodeUuid, ProjectId, UserId};
use quay_retry::{RetryBudget, RetryPolicy};

fn context(engine: MockEngine) -> ObserverContext {
    let mut settings = Settings::default();
    settings.swarm_stack_name = "quay-test".to_string();

    let mut sidecar = SidecarClient::new(TimeoutTiers::default()).unwrap();
    sidecar.set_transient_retry(RetryPolicy::none());

    ObserverContext {
        engine: Arc::new(engine),
        sidecar: Arc::new(sidecar),
        settings,
        budget: Mutex::new(RetryBudget::new(3, Duration::from_secs(600))),
    }
}

fn tracked_service(sidecar_server: &MockServer) -> SchedulerData {
    let mut data = SchedulerData::new(
        NodeUuid::new(),
        ProjectId::new(),
        UserId::new(),
        None,
        "quay/services/jupyter-lab".to_string(),
        "2.1.0".to_string(),
        "services:\n  jupyter:\n    image: jupyter\n".to_string(),
        8888,
        8000,
        true,
    );

    // Point the sidecar endpoint at the wiremock server.
    let uri = sidecar_server.uri();
    let address = uri.strip_prefix("http://").unwrap();
    let (host, port) = address.split_once(':').unwrap();
    data.dynamic_sidecar.hostname = host.to_string();
    data.dynamic_sidecar.port = port.parse().unwrap();
    data
}

async fn mount_healthy_sidecar(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "is_healthy": true })),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/state:restore"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/ports/inputs:pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(0))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/ports/outputs:pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(0))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers"))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_service_reaches_running_through_full_startup() {
    let sidecar_server = MockServer::start().await;
    mount_healthy_sidecar(&sidecar_server).await;

    let engine = MockEngine::new();
    let ctx = context(engine.clone());
    let mut data = tracked_service(&sidecar_server);

    // Pass 1: resources created.
    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::Progressed
    );
    assert!(engine.service_exists(&data.service_name.to_string()).await);
    assert!(engine
        .service_exists(&data.proxy_service_name.to_string())
        .await);

    // Pass 2: swarm task still pending, keep waiting.
    engine
        .set_task_state(&data.service_name.to_string(), "pending", "")
        .await;
    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::Unchanged
    );
    assert_eq!(data.current_state, ServiceState::Pending);

    // Pass 3: task running, sidecar healthy, compose spec goes out.
    engine
        .set_task_state(&data.service_name.to_string(), "running", "")
        .await;
    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::Progressed
    );
    assert!(data.dynamic_sidecar.is_ready);
    assert!(data.dynamic_sidecar.was_compose_spec_submitted);
    assert_eq!(
        data.dynamic_sidecar.docker_node_id.as_deref(),
        Some("mock-node-1")
    );

    // The proxy was pinned to the sidecar's node.
    let proxy = engine
        .service_labels(&data.proxy_service_name.to_string())
        .await;
    assert!(proxy.is_some());

    // Pass 4: steady state reports running.
    observe_service(&ctx, &mut data, None).await;
    assert_eq!(data.current_state, ServiceState::Running);
}

#[tokio::test]
async fn test_project_networks_attached_after_containers_start() {
    let sidecar_server = MockServer::start().await;
    mount_healthy_sidecar(&sidecar_server).await;
    Mock::given(method("GET"))
        .and(path("/v1/containers"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "jupyter-1": { "Status": "running" } })),
        )
        .mount(&sidecar_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/jupyter-1/networks:attach"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&sidecar_server)
        .await;

    let engine = MockEngine::new();
    let ctx = context(engine.clone());
    let mut data = tracked_service(&sidecar_server);
    data.project_networks = vec!["prj-net-1".to_string()];

    // Drive to the compose spec being accepted.
    observe_service(&ctx, &mut data, None).await;
    engine
        .set_task_state(&data.service_name.to_string(), "running", "")
        .await;
    observe_service(&ctx, &mut data, None).await;
    assert!(data.dynamic_sidecar.was_compose_spec_submitted);
    assert!(!data.dynamic_sidecar.is_project_network_attached);

    // The next pass attaches the user containers to the project network.
    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::Progressed
    );
    assert!(data.dynamic_sidecar.is_project_network_attached);
    assert!(engine.network_exists("prj-net-1").await);
    let labels = engine.network_labels("prj-net-1").await.unwrap();
    assert_eq!(
        labels["io.quay.project-id"],
        data.project_id.to_string()
    );

    // Attachment happens once; later passes go back to plain polling.
    observe_service(&ctx, &mut data, None).await;
    assert_eq!(data.current_state, ServiceState::Running);
}

#[tokio::test]
async fn test_teardown_saves_state_then_removes_resources() {
    let sidecar_server = MockServer::start().await;
    mount_healthy_sidecar(&sidecar_server).await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/state:save"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&sidecar_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/ports/outputs:push"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&sidecar_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers:down"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sidecar_server)
        .await;

    let engine = MockEngine::new();
    let ctx = context(engine.clone());
    let mut data = tracked_service(&sidecar_server);

    // Drive to running.
    observe_service(&ctx, &mut data, None).await;
    engine
        .set_task_state(&data.service_name.to_string(), "running", "")
        .await;
    observe_service(&ctx, &mut data, None).await;
    assert!(data.dynamic_sidecar.was_compose_spec_submitted);

    data.dynamic_sidecar.removal_state.mark_to_remove(true);
    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::RemoveEntry
    );

    assert!(data.dynamic_sidecar.were_state_and_outputs_saved);
    assert!(data.dynamic_sidecar.removal_state.was_removed);
    assert!(!engine.service_exists(&data.service_name.to_string()).await);
    assert!(!engine
        .service_exists(&data.proxy_service_name.to_string())
        .await);
    assert!(!engine
        .network_exists(&data.network_name("quay-test"))
        .await);
}

#[tokio::test]
async fn test_saved_state_survives_a_failed_removal() {
    let sidecar_server = MockServer::start().await;
    mount_healthy_sidecar(&sidecar_server).await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/state:save"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&sidecar_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/containers/ports/outputs:push"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&sidecar_server)
        .await;

    let engine = MockEngine::new();
    let ctx = context(engine.clone());
    let mut data = tracked_service(&sidecar_server);

    // Drive to running.
    observe_service(&ctx, &mut data, None).await;
    engine
        .set_task_state(&data.service_name.to_string(), "running", "")
        .await;
    observe_service(&ctx, &mut data, None).await;
    assert!(data.dynamic_sidecar.was_compose_spec_submitted);

    engine.fail_service_removals(1).await;
    data.dynamic_sidecar.removal_state.mark_to_remove(true);

    // Save succeeds but removal fails: the pass still reports progress so
    // the freshly set saved flag reaches the persisted label.
    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::Progressed
    );
    assert!(data.dynamic_sidecar.were_state_and_outputs_saved);
    assert!(!data.dynamic_sidecar.removal_state.was_removed);
    assert!(engine.service_exists(&data.service_name.to_string()).await);

    // The next sweep removes everything without saving again; the wiremock
    // expectations enforce exactly one save and one push.
    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::RemoveEntry
    );
    assert!(data.dynamic_sidecar.removal_state.was_removed);
    assert!(!engine.service_exists(&data.service_name.to_string()).await);
}

#[tokio::test]
async fn test_unhealthy_sidecar_blocks_compose_submission() {
    let sidecar_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "is_healthy": false })),
        )
        .mount(&sidecar_server)
        .await;

    let engine = MockEngine::new();
    let ctx = context(engine.clone());
    let mut data = tracked_service(&sidecar_server);

    observe_service(&ctx, &mut data, None).await;
    engine
        .set_task_state(&data.service_name.to_string(), "running", "")
        .await;

    assert_eq!(
        observe_service(&ctx, &mut data, None).await,
        ObservationOutcome::Unchanged
    );
    assert!(!data.dynamic_sidecar.was_compose_spec_submitted);
    assert!(data.dynamic_sidecar.status.is_failing());
}
