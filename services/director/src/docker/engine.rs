//! Docker Engine API seam.
//!
//! `DockerEngine` is the only way the director touches the engine; the
//! scheduler and the high-level adapter operations are written against the
//! trait so tests can swap in [`MockEngine`].
//!
//! The HTTP implementation speaks the Engine REST API (v1.41+) over TCP.
//! Only the subset of the wire types the director needs is modeled.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::TimeoutTiers;
use crate::error::DockerError;

// =============================================================================
// Wire types
// =============================================================================

/// Overlay network creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub attachable: bool,
    pub internal: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// An attachable overlay network, the only kind the director creates.
    pub fn overlay(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: "overlay".to_string(),
            attachable: true,
            internal: false,
            labels: BTreeMap::new(),
        }
    }
}

/// Network as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInspect {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Container part of a service spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Task placement constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Placement {
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Network attachment in a task template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkAttachment {
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskTemplate {
    pub container_spec: ContainerSpec,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
}

/// Swarm service creation/update request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub task_template: TaskTemplate,
}

/// Service version used for optimistic-concurrency updates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceVersion {
    pub index: u64,
}

/// Service as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceInspect {
    #[serde(rename = "ID")]
    pub id: String,
    pub version: ServiceVersion,
    pub spec: ServiceSpec,
}

/// Task status as reported by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskStatus {
    pub state: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub err: String,
}

/// Task as reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskInspect {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(default, rename = "NodeID")]
    pub node_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub desired_state: String,
}

// =============================================================================
// Trait
// =============================================================================

/// The Docker Engine operations the director depends on.
#[async_trait]
pub trait DockerEngine: Send + Sync {
    /// Create a network; fails if one with the same name exists.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, DockerError>;

    /// List networks whose name matches exactly.
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInspect>, DockerError>;

    /// Remove a network by id or name.
    async fn remove_network(&self, id: &str) -> Result<(), DockerError>;

    /// Create a service and return its id.
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DockerError>;

    /// Inspect a service by id or name.
    async fn inspect_service(&self, name_or_id: &str) -> Result<ServiceInspect, DockerError>;

    /// List services matching all given label filters.
    async fn list_services(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ServiceInspect>, DockerError>;

    /// Update a service spec at the given version index.
    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), DockerError>;

    /// Remove a service by id or name.
    async fn remove_service(&self, name_or_id: &str) -> Result<(), DockerError>;

    /// List tasks belonging to a service.
    async fn list_tasks(&self, service_name: &str) -> Result<Vec<TaskInspect>, DockerError>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Docker Engine client over the REST API.
pub struct HttpDockerEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDockerEngine {
    pub fn new(endpoint: &str, timeouts: &TimeoutTiers) -> Result<Self, DockerError> {
        let client = reqwest::Client::builder()
            .timeout(timeouts.engine_request)
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| DockerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(
        &self,
        response: reqwest::Response,
        subject: &str,
    ) -> Result<reqwest::Response, DockerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DockerError::ServiceNotFound(subject.to_string()));
        }
        Err(DockerError::Engine {
            status: status.as_u16(),
            message: body,
        })
    }

    fn transport_err(e: reqwest::Error) -> DockerError {
        if e.is_timeout() {
            DockerError::Timeout(e.to_string())
        } else {
            DockerError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl DockerEngine for HttpDockerEngine {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, DockerError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Created {
            id: String,
        }

        let response = self
            .client
            .post(self.url("/networks/create"))
            .json(spec)
            .send()
            .await
            .map_err(Self::transport_err)?;
        let response = self.check(response, &spec.name).await?;
        let created: Created = response
            .json()
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))?;
        Ok(created.id)
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInspect>, DockerError> {
        let filters = serde_json::json!({ "name": [name] }).to_string();
        let response = self
            .client
            .get(self.url("/networks"))
            .query(&[("filters", filters)])
            .send()
            .await
            .map_err(Self::transport_err)?;
        let response = self.check(response, name).await?;
        let networks: Vec<NetworkInspect> = response
            .json()
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))?;
        // The engine filter is a substring match; callers want exact names.
        Ok(networks.into_iter().filter(|n| n.name == name).collect())
    }

    async fn remove_network(&self, id: &str) -> Result<(), DockerError> {
        let response = self
            .client
            .delete(self.url(&format!("/networks/{id}")))
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.check(response, id).await?;
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DockerError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Created {
            #[serde(rename = "ID")]
            id: String,
        }

        debug!(service_name = %spec.name, "Creating swarm service");
        let response = self
            .client
            .post(self.url("/services/create"))
            .json(spec)
            .send()
            .await
            .map_err(Self::transport_err)?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(DockerError::InvalidSpec(body));
        }
        let response = self.check(response, &spec.name).await?;
        let created: Created = response
            .json()
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))?;
        Ok(created.id)
    }

    async fn inspect_service(&self, name_or_id: &str) -> Result<ServiceInspect, DockerError> {
        let response = self
            .client
            .get(self.url(&format!("/services/{name_or_id}")))
            .send()
            .await
            .map_err(Self::transport_err)?;
        let response = self.check(response, name_or_id).await?;
        response
            .json()
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))
    }

    async fn list_services(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ServiceInspect>, DockerError> {
        let labels: Vec<String> = label_filters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let filters = serde_json::json!({ "label": labels }).to_string();

        let response = self
            .client
            .get(self.url("/services"))
            .query(&[("filters", filters)])
            .send()
            .await
            .map_err(Self::transport_err)?;
        let response = self.check(response, "services").await?;
        response
            .json()
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), DockerError> {
        let response = self
            .client
            .post(self.url(&format!("/services/{id}/update")))
            .query(&[("version", version.to_string())])
            .json(spec)
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.check(response, id).await?;
        Ok(())
    }

    async fn remove_service(&self, name_or_id: &str) -> Result<(), DockerError> {
        let response = self
            .client
            .delete(self.url(&format!("/services/{name_or_id}")))
            .send()
            .await
            .map_err(Self::transport_err)?;
        self.check(response, name_or_id).await?;
        Ok(())
    }

    async fn list_tasks(&self, service_name: &str) -> Result<Vec<TaskInspect>, DockerError> {
        let filters = serde_json::json!({ "service": [service_name] }).to_string();
        let response = self
            .client
            .get(self.url("/tasks"))
            .query(&[("filters", filters)])
            .send()
            .await
            .map_err(Self::transport_err)?;
        let response = self.check(response, service_name).await?;
        response
            .json()
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Default)]
struct MockState {
    networks: HashMap<String, NetworkInspect>,
    services: HashMap<String, ServiceInspect>,
    tasks: HashMap<String, Vec<TaskInspect>>,
    /// Remaining update calls to fail with an out-of-sequence error.
    out_of_sequence_remaining: u32,
    /// Remaining remove calls to fail with an engine error.
    failed_removals_remaining: u32,
    update_calls: u32,
    remove_service_calls: u32,
}

/// In-memory engine for tests.
///
/// Keeps networks, services, and tasks in maps; task states are scripted by
/// the test via [`MockEngine::set_task_state`]. Out-of-sequence update
/// failures can be injected to exercise the label-update retry path.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    next_id: Arc<AtomicU64>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n:04}")
    }

    /// Script the single task of a service.
    pub async fn set_task_state(&self, service_name: &str, state: &str, err: &str) {
        let mut inner = self.state.lock().await;
        let service_id = inner
            .services
            .get(service_name)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| "unknown".to_string());
        inner.tasks.insert(
            service_name.to_string(),
            vec![TaskInspect {
                id: format!("task-{service_name}"),
                service_id,
                node_id: Some("mock-node-1".to_string()),
                status: TaskStatus {
                    state: state.to_string(),
                    message: String::new(),
                    err: err.to_string(),
                },
                desired_state: "running".to_string(),
            }],
        );
    }

    /// Make the next `n` update calls fail with an out-of-sequence error.
    pub async fn fail_updates_out_of_sequence(&self, n: u32) {
        self.state.lock().await.out_of_sequence_remaining = n;
    }

    /// Make the next `n` service removals fail with an engine error.
    pub async fn fail_service_removals(&self, n: u32) {
        self.state.lock().await.failed_removals_remaining = n;
    }

    pub async fn update_calls(&self) -> u32 {
        self.state.lock().await.update_calls
    }

    pub async fn remove_service_calls(&self) -> u32 {
        self.state.lock().await.remove_service_calls
    }

    pub async fn service_exists(&self, name: &str) -> bool {
        self.state.lock().await.services.contains_key(name)
    }

    pub async fn network_exists(&self, name: &str) -> bool {
        self.state.lock().await.networks.contains_key(name)
    }

    /// Current labels of a network, if it exists.
    pub async fn network_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .await
            .networks
            .get(name)
            .map(|n| n.labels.clone())
    }

    /// Current labels of a service, if it exists.
    pub async fn service_labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .await
            .services
            .get(name)
            .map(|s| s.spec.labels.clone())
    }

    fn resolve_service(
        inner: &MockState,
        name_or_id: &str,
    ) -> Option<(String, ServiceInspect)> {
        inner
            .services
            .iter()
            .find(|(name, svc)| name.as_str() == name_or_id || svc.id == name_or_id)
            .map(|(name, svc)| (name.clone(), svc.clone()))
    }
}

#[async_trait]
impl DockerEngine for MockEngine {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, DockerError> {
        let mut inner = self.state.lock().await;
        if inner.networks.contains_key(&spec.name) {
            return Err(DockerError::Engine {
                status: 409,
                message: format!("network with name {} already exists", spec.name),
            });
        }
        let id = self.fresh_id("net");
        inner.networks.insert(
            spec.name.clone(),
            NetworkInspect {
                id: id.clone(),
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInspect>, DockerError> {
        let inner = self.state.lock().await;
        Ok(inner.networks.get(name).cloned().into_iter().collect())
    }

    async fn remove_network(&self, id: &str) -> Result<(), DockerError> {
        let mut inner = self.state.lock().await;
        let key = inner
            .networks
            .iter()
            .find(|(name, net)| name.as_str() == id || net.id == id)
            .map(|(name, _)| name.clone());
        match key {
            Some(key) => {
                inner.networks.remove(&key);
                Ok(())
            }
            None => Err(DockerError::ServiceNotFound(id.to_string())),
        }
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, DockerError> {
        let mut inner = self.state.lock().await;
        if inner.services.contains_key(&spec.name) {
            return Err(DockerError::Engine {
                status: 409,
                message: format!("name conflicts with an existing object: {}", spec.name),
            });
        }
        let id = self.fresh_id("svc");
        inner.services.insert(
            spec.name.clone(),
            ServiceInspect {
                id: id.clone(),
                version: ServiceVersion { index: 1 },
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    async fn inspect_service(&self, name_or_id: &str) -> Result<ServiceInspect, DockerError> {
        let inner = self.state.lock().await;
        Self::resolve_service(&inner, name_or_id)
            .map(|(_, svc)| svc)
            .ok_or_else(|| DockerError::ServiceNotFound(name_or_id.to_string()))
    }

    async fn list_services(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ServiceInspect>, DockerError> {
        let inner = self.state.lock().await;
        Ok(inner
            .services
            .values()
            .filter(|svc| {
                label_filters
                    .iter()
                    .all(|(k, v)| svc.spec.labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), DockerError> {
        let mut inner = self.state.lock().await;
        inner.update_calls += 1;

        if inner.out_of_sequence_remaining > 0 {
            inner.out_of_sequence_remaining -= 1;
            return Err(DockerError::Engine {
                status: 500,
                message: "rpc error: update out of sequence".to_string(),
            });
        }

        let Some((name, svc)) = Self::resolve_service(&inner, id) else {
            return Err(DockerError::ServiceNotFound(id.to_string()));
        };
        if svc.version.index != version {
            return Err(DockerError::Engine {
                status: 500,
                message: "rpc error: update out of sequence".to_string(),
            });
        }

        inner.services.insert(
            name,
            ServiceInspect {
                id: svc.id,
                version: ServiceVersion {
                    index: version + 1,
                },
                spec: spec.clone(),
            },
        );
        Ok(())
    }

    async fn remove_service(&self, name_or_id: &str) -> Result<(), DockerError> {
        let mut inner = self.state.lock().await;
        inner.remove_service_calls += 1;
        if inner.failed_removals_remaining > 0 {
            inner.failed_removals_remaining -= 1;
            return Err(DockerError::Engine {
                status: 500,
                message: "rpc error: failed to remove service".to_string(),
            });
        }
        let Some((name, _)) = Self::resolve_service(&inner, name_or_id) else {
            return Err(DockerError::ServiceNotFound(name_or_id.to_string()));
        };
        inner.services.remove(&name);
        inner.tasks.remove(&name);
        Ok(())
    }

    async fn list_tasks(&self, service_name: &str) -> Result<Vec<TaskInspect>, DockerError> {
        let inner = self.state.lock().await;
        Ok(inner.tasks.get(service_name).cloned().unwrap_or_default())
    }
}
