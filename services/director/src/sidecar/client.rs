//! Typed client for the sidecar REST API.
//!
//! One shared client serves all sidecars; each call takes the target
//! sidecar's endpoint. Timeouts are per operation, not per client: a health
//! probe gets one second while a state save may legitimately run for an
//! hour. Transport-level failures are retried on a bounded 1s/4s/8s
//! schedule; HTTP error statuses never are, a sidecar that answered is a
//! sidecar whose answer stands.

use std::time::Duration;

use quay_retry::{retry_transient, RetryPolicy};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::TimeoutTiers;
use crate::error::SidecarError;

pub struct SidecarClient {
    client: reqwest::Client,
    timeouts: TimeoutTiers,
    transient_retry: RetryPolicy,
}

impl SidecarClient {
    pub fn new(timeouts: TimeoutTiers) -> Result<Self, SidecarError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| SidecarError::Client(e.to_string()))?;

        Ok(Self {
            client,
            timeouts,
            transient_retry: RetryPolicy::transient_default(),
        })
    }

    /// Override the transport retry schedule (tests shrink it).
    pub fn set_transient_retry(&mut self, policy: RetryPolicy) {
        self.transient_retry = policy;
    }

    /// Single request with a per-call timeout and an expected status.
    async fn request_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
        expected: StatusCode,
    ) -> Result<reqwest::Response, SidecarError> {
        let mut builder = self.client.request(method, url).timeout(timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                SidecarError::Transport(e.to_string())
            } else {
                SidecarError::Client(e.to_string())
            }
        })?;

        let status = response.status();
        if status != expected {
            let body = response.text().await.unwrap_or_default();
            return Err(SidecarError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        Ok(response)
    }

    /// Request with the transient-error retry schedule applied.
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
        expected: StatusCode,
    ) -> Result<reqwest::Response, SidecarError> {
        retry_transient(&self.transient_retry, SidecarError::is_transient, || {
            self.request_once(method.clone(), url, body, timeout, expected)
        })
        .await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Probe the sidecar's health endpoint.
    ///
    /// Deliberately unretried and bounded to one second; any failure just
    /// means "not ready this sweep".
    pub async fn is_healthy(&self, endpoint: &str) -> bool {
        #[derive(Deserialize)]
        struct Health {
            is_healthy: bool,
        }

        let url = format!("{endpoint}/health");
        let result = self
            .request_once(Method::GET, &url, None, self.timeouts.health_check, StatusCode::OK)
            .await;

        match result {
            Ok(response) => response
                .json::<Health>()
                .await
                .map(|h| h.is_healthy)
                .unwrap_or(false),
            Err(e) => {
                debug!(endpoint, error = %e, "Sidecar health probe failed");
                false
            }
        }
    }

    /// Submit the compose spec and start the user containers.
    pub async fn create_containers(
        &self,
        endpoint: &str,
        compose_spec: &str,
    ) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers");
        self.request(
            Method::POST,
            &url,
            Some(&json!({ "docker_compose_yaml": compose_spec })),
            self.timeouts.container_lifecycle,
            StatusCode::ACCEPTED,
        )
        .await?;
        Ok(())
    }

    /// Stop and remove the user containers.
    pub async fn containers_down(&self, endpoint: &str) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers:down");
        self.request(
            Method::POST,
            &url,
            None,
            self.timeouts.container_lifecycle,
            StatusCode::OK,
        )
        .await?;
        Ok(())
    }

    /// Inspect data of all user containers, keyed by container name.
    pub async fn containers_status(
        &self,
        endpoint: &str,
    ) -> Result<serde_json::Value, SidecarError> {
        let url = format!("{endpoint}/v1/containers");
        let response = self
            .request(
                Method::GET,
                &url,
                None,
                self.timeouts.engine_request,
                StatusCode::OK,
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| SidecarError::Client(e.to_string()))
    }

    /// Persist the service state to storage.
    pub async fn save_state(&self, endpoint: &str) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers/state:save");
        self.request(
            Method::POST,
            &url,
            None,
            self.timeouts.state_save_restore,
            StatusCode::NO_CONTENT,
        )
        .await?;
        Ok(())
    }

    /// Restore previously saved service state.
    pub async fn restore_state(&self, endpoint: &str) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers/state:restore");
        self.request(
            Method::POST,
            &url,
            None,
            self.timeouts.state_save_restore,
            StatusCode::NO_CONTENT,
        )
        .await?;
        Ok(())
    }

    /// Download input port data. Returns the transferred size in bytes.
    ///
    /// `port_keys` of `None` pulls all inputs.
    pub async fn pull_input_ports(
        &self,
        endpoint: &str,
        port_keys: Option<&[String]>,
    ) -> Result<i64, SidecarError> {
        let url = format!("{endpoint}/v1/containers/ports/inputs:pull");
        let response = self
            .request(
                Method::POST,
                &url,
                Some(&json!({ "port_keys": port_keys })),
                self.timeouts.state_save_restore,
                StatusCode::OK,
            )
            .await?;
        parse_transferred_bytes(response).await
    }

    /// Download output port data. Returns the transferred size in bytes.
    pub async fn pull_output_ports(&self, endpoint: &str) -> Result<i64, SidecarError> {
        let url = format!("{endpoint}/v1/containers/ports/outputs:pull");
        let response = self
            .request(
                Method::POST,
                &url,
                None,
                self.timeouts.state_save_restore,
                StatusCode::OK,
            )
            .await?;
        parse_transferred_bytes(response).await
    }

    /// Upload output port data.
    pub async fn push_output_ports(&self, endpoint: &str) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers/ports/outputs:push");
        self.request(
            Method::POST,
            &url,
            None,
            self.timeouts.state_save_restore,
            StatusCode::NO_CONTENT,
        )
        .await?;
        Ok(())
    }

    /// Restart the user containers in place.
    pub async fn restart_containers(&self, endpoint: &str) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers:restart");
        self.request(
            Method::POST,
            &url,
            None,
            self.timeouts.restart_containers,
            StatusCode::NO_CONTENT,
        )
        .await?;
        Ok(())
    }

    /// Attach a user container to a project network.
    pub async fn attach_container_to_network(
        &self,
        endpoint: &str,
        container_id: &str,
        network_id: &str,
        network_aliases: &[String],
    ) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers/{container_id}/networks:attach");
        self.request(
            Method::POST,
            &url,
            Some(&json!({
                "network_id": network_id,
                "network_aliases": network_aliases,
            })),
            self.timeouts.network_attach_detach,
            StatusCode::NO_CONTENT,
        )
        .await?;
        Ok(())
    }

    /// Detach a user container from a project network.
    pub async fn detach_container_from_network(
        &self,
        endpoint: &str,
        container_id: &str,
        network_id: &str,
    ) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/containers/{container_id}/networks:detach");
        self.request(
            Method::POST,
            &url,
            Some(&json!({ "network_id": network_id })),
            self.timeouts.network_attach_detach,
            StatusCode::NO_CONTENT,
        )
        .await?;
        Ok(())
    }

    /// Release the disk space the sidecar reserved at startup.
    pub async fn free_reserved_disk_space(&self, endpoint: &str) -> Result<(), SidecarError> {
        let url = format!("{endpoint}/v1/disk/reserved:free");
        self.request(
            Method::POST,
            &url,
            None,
            self.timeouts.engine_request,
            StatusCode::NO_CONTENT,
        )
        .await?;
        Ok(())
    }
}

async fn parse_transferred_bytes(response: reqwest::Response) -> Result<i64, SidecarError> {
    response
        .json::<i64>()
        .await
        .map_err(|e| SidecarError::Client(e.to_string()))
}
