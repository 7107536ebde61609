//! Swarm task state mapping.

use crate::docker::engine::TaskInspect;
use crate::models::ServiceState;

/// Substring the engine puts in a task error when no node can host it.
const INSUFFICIENT_RESOURCES: &str = "insufficient resources";

/// Map a raw Swarm task state to the coarse service state.
pub fn task_state_to_service_state(state: &str) -> ServiceState {
    match state {
        "new" | "allocated" | "pending" | "assigned" | "accepted" => ServiceState::Pending,
        "preparing" => ServiceState::Pulling,
        "ready" | "starting" => ServiceState::Starting,
        "running" => ServiceState::Running,
        "complete" => ServiceState::Complete,
        // Shutdown/rejected/orphaned/removed tasks all count as failed; the
        // observation cycle decides whether that warrants teardown.
        _ => ServiceState::Failed,
    }
}

/// Derive the service state from the task list of a single-replica service.
///
/// Returns the state plus a human-readable message. A task stuck for lack
/// of cluster resources is reported as `Pending`, not `Failed`; capacity
/// shortages resolve themselves when other services stop.
pub fn extract_service_state(tasks: &[TaskInspect]) -> (ServiceState, String) {
    let Some(task) = tasks.first() else {
        return (ServiceState::Pending, "no task scheduled yet".to_string());
    };

    let message = if task.status.err.is_empty() {
        task.status.message.clone()
    } else {
        task.status.err.clone()
    };

    if task
        .status
        .err
        .to_lowercase()
        .contains(INSUFFICIENT_RESOURCES)
    {
        return (
            ServiceState::Pending,
            "waiting for cluster resources to free up".to_string(),
        );
    }

    (task_state_to_service_state(&task.status.state), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::engine::TaskStatus;
    use rstest::rstest;

    fn task(state: &str, err: &str) -> TaskInspect {
        TaskInspect {
            id: "t1".to_string(),
            service_id: "s1".to_string(),
            node_id: None,
            status: TaskStatus {
                state: state.to_string(),
                message: String::new(),
                err: err.to_string(),
            },
            desired_state: "running".to_string(),
        }
    }

    #[rstest]
    #[case("new", ServiceState::Pending)]
    #[case("pending", ServiceState::Pending)]
    #[case("preparing", ServiceState::Pulling)]
    #[case("starting", ServiceState::Starting)]
    #[case("running", ServiceState::Running)]
    #[case("complete", ServiceState::Complete)]
    #[case("failed", ServiceState::Failed)]
    #[case("rejected", ServiceState::Failed)]
    #[case("orphaned", ServiceState::Failed)]
    fn test_task_state_mapping(#[case] raw: &str, #[case] expected: ServiceState) {
        assert_eq!(task_state_to_service_state(raw), expected);
    }

    #[test]
    fn test_no_tasks_is_pending() {
        let (state, msg) = extract_service_state(&[]);
        assert_eq!(state, ServiceState::Pending);
        assert!(msg.contains("no task"));
    }

    #[test]
    fn test_insufficient_resources_is_pending_not_failed() {
        let tasks = vec![task("pending", "no suitable node (insufficient resources on 3 nodes)")];
        let (state, msg) = extract_service_state(&tasks);
        assert_eq!(state, ServiceState::Pending);
        assert!(msg.contains("cluster resources"));
    }

    #[test]
    fn test_failed_task_carries_error_message() {
        let tasks = vec![task("failed", "task: non-zero exit (137)")];
        let (state, msg) = extract_service_state(&tasks);
        assert_eq!(state, ServiceState::Failed);
        assert!(msg.contains("non-zero exit"));
    }
}
