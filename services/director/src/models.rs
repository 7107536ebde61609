//! Data model for tracked dynamic services.
//!
//! `SchedulerData` is the central record: one per tracked service, mutated
//! by the observation cycle on every sweep and mirrored into a Docker
//! service label so a director restart does not lose track of running
//! sidecars. The label format is versioned so old labels fail loudly at
//! discovery instead of misparsing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quay_ids::{NodeUuid, ProjectId, ServiceName, UserId, WalletId};
use serde::{Deserialize, Serialize};

use crate::error::DockerError;

/// Label key carrying the serialized `SchedulerData` on the sidecar service.
pub const SCHEDULER_DATA_LABEL: &str = "io.quay.scheduler-data";

/// Label key carrying the swarm stack name on every service quay creates.
pub const STACK_NAME_LABEL: &str = "io.quay.stack";

/// Label key carrying the node UUID on every service quay creates.
pub const NODE_UUID_LABEL: &str = "io.quay.node-uuid";

/// Label key carrying the project id on networks and services quay creates.
pub const PROJECT_ID_LABEL: &str = "io.quay.project-id";

/// Current schema version of the label payload.
pub const SCHEDULER_DATA_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// States
// =============================================================================

/// Observed state of a dynamic service, mirroring Docker Swarm task health.
///
/// Ordering follows lifecycle progression; `Failed` sorts last so merging
/// states can treat it as dominant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Pulling,
    Starting,
    Running,
    Complete,
    Failed,
}

impl ServiceState {
    /// Merge two observed states into the one to report.
    ///
    /// Any failure dominates; otherwise the least advanced state wins, so a
    /// stack is only `Running` once every part of it is.
    pub fn merge(self, other: ServiceState) -> ServiceState {
        if self == ServiceState::Failed || other == ServiceState::Failed {
            return ServiceState::Failed;
        }
        self.min(other)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Pending => "pending",
            ServiceState::Pulling => "pulling",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Complete => "complete",
            ServiceState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Desired state requested through the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedState {
    Running,
    Stopped,
}

/// Restart policy for the user containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    NoRestart,
    OnInputsDownloaded,
}

/// Health of the sidecar as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarHealth {
    Ok,
    Failing,
}

/// Sidecar health plus the message explaining it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarStatus {
    pub current: SidecarHealth,
    pub info: String,
}

impl SidecarStatus {
    pub fn ok() -> Self {
        Self {
            current: SidecarHealth::Ok,
            info: String::new(),
        }
    }

    pub fn update_ok(&mut self) {
        self.current = SidecarHealth::Ok;
        self.info.clear();
    }

    pub fn update_failing(&mut self, info: impl Into<String>) {
        self.current = SidecarHealth::Failing;
        self.info = info.into();
    }

    pub fn is_failing(&self) -> bool {
        self.current == SidecarHealth::Failing
    }
}

// =============================================================================
// Removal bookkeeping
// =============================================================================

/// Teardown bookkeeping for one tracked service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemovalState {
    /// The service was marked for removal; the next sweep drives teardown.
    pub can_remove: bool,

    /// State and outputs must be saved before the containers go away.
    pub can_save: bool,

    /// Docker resources are confirmed gone; the entry may be dropped.
    pub was_removed: bool,
}

impl RemovalState {
    pub fn mark_to_remove(&mut self, can_save: bool) {
        self.can_remove = true;
        self.can_save = can_save;
    }

    pub fn mark_removed(&mut self) {
        self.was_removed = true;
    }
}

// =============================================================================
// Sidecar record
// =============================================================================

/// Everything the scheduler knows about one sidecar instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarRecord {
    /// Hostname of the sidecar API (the sidecar Swarm service name).
    pub hostname: String,

    /// Port of the sidecar API.
    pub port: u16,

    /// Health check passed; the sidecar API is reachable.
    pub is_ready: bool,

    /// The Docker Control Adapter confirmed the sidecar/proxy services
    /// exist. Only set after creation succeeded.
    pub were_containers_created: bool,

    /// The compose spec was accepted by the sidecar.
    pub was_compose_spec_submitted: bool,

    /// The user containers were attached to the project networks.
    #[serde(default)]
    pub is_project_network_attached: bool,

    /// State and outputs were saved during teardown; prevents double-save.
    pub were_state_and_outputs_saved: bool,

    /// Saving state or pushing outputs failed past the retry budget; the
    /// entry is parked until an operator forces removal.
    pub wait_for_manual_intervention: bool,

    /// Last observed sidecar health.
    pub status: SidecarStatus,

    /// Teardown bookkeeping.
    pub removal_state: RemovalState,

    /// Swarm node the sidecar was placed on, once known.
    pub docker_node_id: Option<String>,
}

impl SidecarRecord {
    pub fn new(service_name: &ServiceName, port: u16) -> Self {
        Self {
            hostname: service_name.to_string(),
            port,
            is_ready: false,
            were_containers_created: false,
            was_compose_spec_submitted: false,
            is_project_network_attached: false,
            were_state_and_outputs_saved: false,
            wait_for_manual_intervention: false,
            status: SidecarStatus::ok(),
            removal_state: RemovalState::default(),
            docker_node_id: None,
        }
    }

    /// Base URL of the sidecar API.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

// =============================================================================
// SchedulerData
// =============================================================================

/// One tracked dynamic service, from creation to confirmed removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerData {
    /// Label payload schema version; bump when fields change incompatibly.
    pub schema_version: u32,

    pub node_uuid: NodeUuid,
    pub project_id: ProjectId,
    pub user_id: UserId,
    #[serde(default)]
    pub wallet_id: Option<WalletId>,

    /// Swarm-unique name of the sidecar service.
    pub service_name: ServiceName,

    /// Swarm-unique name of the proxy service.
    pub proxy_service_name: ServiceName,

    /// Image key of the user service (e.g. `quay/services/jupyter-lab`).
    pub service_key: String,

    /// Image tag of the user service.
    pub service_tag: String,

    /// docker-compose specification used to launch the user containers.
    pub compose_spec: String,

    /// Port the user service listens on behind the proxy.
    pub service_port: u16,

    pub requested_state: RequestedState,

    /// Last state reported by the observation cycle.
    pub current_state: ServiceState,

    /// Message accompanying `current_state` (e.g. why it is pending).
    #[serde(default)]
    pub current_state_info: String,

    /// Observation is temporarily disabled for this entry.
    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Project networks the user containers must be attached to.
    #[serde(default)]
    pub project_networks: Vec<String>,

    pub dynamic_sidecar: SidecarRecord,

    pub created_at: DateTime<Utc>,

    /// When resource creation was first attempted; bounds the startup wait.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl SchedulerData {
    /// Construct the initial record for a freshly added service.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_uuid: NodeUuid,
        project_id: ProjectId,
        user_id: UserId,
        wallet_id: Option<WalletId>,
        service_key: String,
        service_tag: String,
        compose_spec: String,
        service_port: u16,
        sidecar_port: u16,
        can_save: bool,
    ) -> Self {
        let service_name = ServiceName::sidecar(&node_uuid);
        let proxy_service_name = ServiceName::proxy(&node_uuid);
        let mut dynamic_sidecar = SidecarRecord::new(&service_name, sidecar_port);
        dynamic_sidecar.removal_state.can_save = can_save;

        Self {
            schema_version: SCHEDULER_DATA_SCHEMA_VERSION,
            node_uuid,
            project_id,
            user_id,
            wallet_id,
            service_name,
            proxy_service_name,
            service_key,
            service_tag,
            compose_spec,
            service_port,
            requested_state: RequestedState::Running,
            current_state: ServiceState::Pending,
            current_state_info: String::new(),
            paused: false,
            restart_policy: RestartPolicy::default(),
            project_networks: Vec::new(),
            dynamic_sidecar,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    /// Serialize for storage in the sidecar service's labels.
    pub fn to_label(&self) -> String {
        // SchedulerData contains no map with non-string keys, so this
        // serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deserialize from a label payload, rejecting unknown schema versions.
    pub fn from_label(label: &str) -> Result<Self, DockerError> {
        let data: SchedulerData = serde_json::from_str(label)
            .map_err(|e| DockerError::BadLabel(e.to_string()))?;

        if data.schema_version != SCHEDULER_DATA_SCHEMA_VERSION {
            return Err(DockerError::BadLabel(format!(
                "unsupported schema_version {} (expected {})",
                data.schema_version, SCHEDULER_DATA_SCHEMA_VERSION
            )));
        }

        Ok(data)
    }

    /// Name of the per-service overlay network joining sidecar and proxy.
    pub fn network_name(&self, stack_name: &str) -> String {
        format!("{stack_name}-net_{}", self.node_uuid)
    }

    /// Labels attached to the sidecar/proxy Swarm services.
    pub fn service_labels(&self, stack_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (STACK_NAME_LABEL.to_string(), stack_name.to_string()),
            (NODE_UUID_LABEL.to_string(), self.node_uuid.to_string()),
            ("io.quay.user-id".to_string(), self.user_id.to_string()),
            (PROJECT_ID_LABEL.to_string(), self.project_id.to_string()),
        ])
    }
}

// =============================================================================
// Public status view
// =============================================================================

/// Snapshot of a tracked service returned by `get_stack_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningDynamicServiceDetails {
    pub node_uuid: NodeUuid,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub service_key: String,
    pub service_tag: String,
    pub service_state: ServiceState,
    pub service_message: String,
    pub service_port: u16,
}

impl RunningDynamicServiceDetails {
    pub fn from_scheduler_data(data: &SchedulerData) -> Self {
        Self {
            node_uuid: data.node_uuid,
            project_id: data.project_id,
            user_id: data.user_id,
            service_key: data.service_key.clone(),
            service_tag: data.service_tag.clone(),
            service_state: data.current_state,
            service_message: data.current_state_info.clone(),
            service_port: data.service_port,
        }
    }
}
