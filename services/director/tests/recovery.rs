//! Crash-recovery behavior: a fresh scheduler re-hydrates its tracked
//! services from the scheduler-data labels left on the swarm services.

use std::sync::Arc;

use quay_director::config::{Settings, TimeoutTiers};
use quay_director::docker::{DockerEngine, MockEngine, ServiceSpec};
use quay_director::models::{SchedulerData, ServiceState, SCHEDULER_DATA_LABEL};
use quay_director::scheduler::{DynamicScheduler, Scheduler};
use quay_director::sidecar::SidecarClient;
use quay_ids::{NodeUuid, ProjectId, UserId};

fn scheduler(engine: MockEngine) -> Arc<Scheduler> {
    let mut settings = Settings::default();
    settings.swarm_stack_name = "quay-test".to_string();
    Scheduler::new(
        Arc::new(engine),
        Arc::new(SidecarClient::new(TimeoutTiers::default()).unwrap()),
        settings,
    )
}

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

async fn plant_labeled_service(engine: &MockEngine, data: &SchedulerData, label: String) {
    let mut labels = data.service_labels("quay-test");
    labels.insert(SCHEDULER_DATA_LABEL.to_string(), label);
    engine
        .create_service(&ServiceSpec {
            name: data.service_name.to_string(),
            labels,
            ..Default::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_restart_recovers_tracked_services() {
    let engine = MockEngine::new();

    let mut running = sample_data();
    running.current_state = ServiceState::Running;
    running.dynamic_sidecar.were_containers_created = true;
    running.dynamic_sidecar.was_compose_spec_submitted = true;
    plant_labeled_service(&engine, &running, running.to_label()).await;

    let director = scheduler(engine);
    director.start().await.unwrap();

    assert!(director.is_service_tracked(&running.node_uuid).await);
    let status = director.get_stack_status(&running.node_uuid).await.unwrap();
    assert_eq!(status.service_state, ServiceState::Running);
    assert_eq!(status.user_id, running.user_id);

    director.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_label_does_not_block_recovery_of_others() {
    let engine = MockEngine::new();

    let healthy = sample_data();
    plant_labeled_service(&engine, &healthy, healthy.to_label()).await;

    let corrupt = sample_data();
    plant_labeled_service(&engine, &corrupt, "{not json".to_string()).await;

    let mut old_version = sample_data();
    old_version.schema_version = 0;
    plant_labeled_service(&engine, &old_version, old_version.to_label()).await;

    let director = scheduler(engine);
    director.start().await.unwrap();

    assert!(director.is_service_tracked(&healthy.node_uuid).await);
    assert!(!director.is_service_tracked(&corrupt.node_uuid).await);
    assert!(!director.is_service_tracked(&old_version.node_uuid).await);

    director.shutdown().await;
}

#[tokio::test]
async fn test_unlabeled_services_are_ignored() {
    let engine = MockEngine::new();
    let data = sample_data();
    engine
        .create_service(&ServiceSpec {
            name: data.service_name.to_string(),
            labels: data.service_labels("quay-test"),
            ..Default::default()
        })
        .await
        .unwrap();

    let director = scheduler(engine);
    director.start().await.unwrap();
    assert!(!director.is_service_tracked(&data.node_uuid).await);
    director.shutdown().await;
}
