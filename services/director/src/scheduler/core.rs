//! Scheduler orchestrator.
//!
//! Owns the tracked-services store and the periodic sweep. Each sweep fans
//! out one observation per tracked service, awaits the whole round, then
//! sleeps; rounds never overlap, so a slow Docker Engine degrades cadence
//! instead of piling up work.
//!
//! On startup the store is re-hydrated from the scheduler-data labels on
//! the swarm services, so a director restart does not lose track of
//! already-running sidecars.

use std::sync::Arc;

use async_trait::async_trait;
use quay_ids::{NodeUuid, ProjectId, UserId, WalletId};
use quay_retry::RetryBudget;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::docker::api as docker_api;
use crate::docker::engine::DockerEngine;
use crate::error::SchedulerError;
use crate::models::{
    RequestedState, RestartPolicy, RunningDynamicServiceDetails, SchedulerData,
};
use crate::scheduler::observer::{self, ObservationOutcome, ObserverContext, ProgressCallback};
use crate::scheduler::store::ServiceStore;
use crate::sidecar::SidecarClient;

/// Everything needed to start tracking a new dynamic service.
#[derive(Debug, Clone)]
pub struct AddServiceRequest {
    pub node_uuid: NodeUuid,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub wallet_id: Option<WalletId>,
    pub service_key: String,
    pub service_tag: String,
    pub compose_spec: String,
    pub service_port: u16,
    pub can_save: bool,
    pub project_networks: Vec<String>,
    pub restart_policy: RestartPolicy,
}

/// Public contract of the scheduler, as consumed by the REST layer.
#[async_trait]
pub trait DynamicScheduler: Send + Sync {
    /// Start tracking a new service; the sweep drives it to running.
    async fn add_service(&self, request: AddServiceRequest) -> Result<(), SchedulerError>;

    /// Flip the desired state to stopped; the sweep drives teardown.
    async fn mark_service_for_removal(
        &self,
        node_uuid: &NodeUuid,
        can_save: bool,
    ) -> Result<(), SchedulerError>;

    /// Mark every service billed to the wallet for removal. Idempotent.
    async fn mark_all_services_in_wallet_for_removal(&self, wallet_id: WalletId);

    /// Pause or resume observation for one entry.
    ///
    /// Returns false when the entry is unknown or its observation is
    /// currently in flight; callers retry with backoff.
    async fn toggle_observation(&self, node_uuid: &NodeUuid, disable: bool) -> bool;

    async fn is_service_tracked(&self, node_uuid: &NodeUuid) -> bool;

    async fn list_services(
        &self,
        user_id: Option<UserId>,
        project_id: Option<ProjectId>,
    ) -> Vec<NodeUuid>;

    async fn get_stack_status(
        &self,
        node_uuid: &NodeUuid,
    ) -> Result<RunningDynamicServiceDetails, SchedulerError>;

    async fn is_service_awaiting_manual_intervention(
        &self,
        node_uuid: &NodeUuid,
    ) -> Result<bool, SchedulerError>;

    /// Persist service state to storage, outside the sweep cadence.
    async fn save_service_state(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError>;

    /// Upload output port data, outside the sweep cadence.
    async fn push_service_outputs(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError>;

    /// Stop the user containers without dropping the tracked entry.
    async fn remove_service_containers(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError>;

    /// Remove the swarm services and network, then drop the entry.
    async fn remove_service_docker_resources(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError>;

    /// Restart the user containers in place.
    async fn restart_containers(&self, node_uuid: &NodeUuid) -> Result<(), SchedulerError>;

    /// Attach the user containers to a project network.
    async fn attach_project_network(
        &self,
        node_uuid: &NodeUuid,
        network_name: &str,
        network_aliases: &[String],
    ) -> Result<(), SchedulerError>;

    /// Detach the user containers from a project network.
    async fn detach_project_network(
        &self,
        node_uuid: &NodeUuid,
        network_name: &str,
    ) -> Result<(), SchedulerError>;

    /// Release the disk space the sidecar reserved at startup.
    async fn free_reserved_disk_space(&self, node_uuid: &NodeUuid)
        -> Result<(), SchedulerError>;

    /// Pull input port data; honors the on-inputs-downloaded restart policy.
    async fn retrieve_service_inputs(
        &self,
        node_uuid: &NodeUuid,
        port_keys: Option<Vec<String>>,
    ) -> Result<i64, SchedulerError>;
}

pub struct Scheduler {
    store: ServiceStore,
    ctx: Arc<ObserverContext>,
    shutdown: watch::Sender<bool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<dyn DockerEngine>,
        sidecar: Arc<SidecarClient>,
        settings: Settings,
    ) -> Arc<Self> {
        let budget = RetryBudget::new(
            settings.manual_intervention_max_attempts,
            settings.manual_intervention_window,
        );
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store: ServiceStore::new(),
            ctx: Arc::new(ObserverContext {
                engine,
                sidecar,
                settings,
                budget: Mutex::new(budget),
            }),
            shutdown,
            sweep_handle: Mutex::new(None),
        })
    }

    /// Re-hydrate tracked services from swarm labels, then start sweeping.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        self.rehydrate().await?;

        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.ctx.settings.sweep_interval;

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Sweep loop started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        scheduler.sweep_once().await;
                    }
                }
            }
            info!("Sweep loop stopped");
        });

        *self.sweep_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn rehydrate(&self) -> Result<(), SchedulerError> {
        let discovered = docker_api::discover_tracked_services(
            self.ctx.engine.as_ref(),
            &self.ctx.settings.swarm_stack_name,
        )
        .await?;

        let count = discovered.len();
        for data in discovered {
            debug!(node_uuid = %data.node_uuid, "Recovered tracked service from label");
            self.store.insert_or_replace(data).await;
        }
        if count > 0 {
            info!(recovered = count, "Tracked services recovered from swarm labels");
        }
        Ok(())
    }

    /// One sweep round: observe every tracked service concurrently and wait
    /// for all of them before returning.
    pub async fn sweep_once(&self) {
        let entries = self.store.all().await;
        if entries.is_empty() {
            return;
        }

        let mut round: JoinSet<(NodeUuid, ObservationOutcome)> = JoinSet::new();
        for tracked in entries {
            let ctx = Arc::clone(&self.ctx);
            round.spawn(async move {
                let mut data = tracked.data.lock().await;
                let outcome = observer::observe_service(&ctx, &mut data, None).await;

                if matches!(
                    outcome,
                    ObservationOutcome::Progressed | ObservationOutcome::ManualIntervention
                ) {
                    if let Err(e) =
                        docker_api::update_scheduler_data_label(ctx.engine.as_ref(), &data).await
                    {
                        warn!(node_uuid = %data.node_uuid, error = %e, "Label persistence failed");
                    }
                }
                (data.node_uuid, outcome)
            });
        }

        while let Some(joined) = round.join_next().await {
            match joined {
                Ok((node_uuid, ObservationOutcome::RemoveEntry)) => {
                    info!(node_uuid = %node_uuid, "Service removal confirmed, dropping entry");
                    self.store.remove(&node_uuid).await;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Observation task panicked"),
            }
        }
    }

    /// Best-effort label write outside the sweep cadence.
    async fn persist_label(&self, data: &SchedulerData) {
        if let Err(e) =
            docker_api::update_scheduler_data_label(self.ctx.engine.as_ref(), data).await
        {
            warn!(node_uuid = %data.node_uuid, error = %e, "Label persistence failed");
        }
    }

    /// Stop the sweep loop, draining in-flight observations with a bounded
    /// grace period.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.ctx.settings.shutdown_grace, handle)
                .await
                .is_err()
            {
                warn!("Sweep did not drain within grace period, aborting");
                abort.abort();
            }
        }
    }

}

#[async_trait]
impl DynamicScheduler for Scheduler {
    async fn add_service(&self, request: AddServiceRequest) -> Result<(), SchedulerError> {
        if self.store.contains(&request.node_uuid).await {
            return Err(SchedulerError::AlreadyTracked(request.node_uuid));
        }

        // An untracked node whose services still exist in the swarm means a
        // previous life was not cleaned up; refuse rather than collide.
        let missing = docker_api::is_stack_missing(
            self.ctx.engine.as_ref(),
            &request.node_uuid,
            &self.ctx.settings.swarm_stack_name,
        )
        .await?;
        if !missing {
            return Err(SchedulerError::NodeCollision(request.node_uuid));
        }

        let mut data = SchedulerData::new(
            request.node_uuid,
            request.project_id,
            request.user_id,
            request.wallet_id,
            request.service_key,
            request.service_tag,
            request.compose_spec,
            request.service_port,
            self.ctx.settings.sidecar_port,
            request.can_save,
        );
        data.project_networks = request.project_networks;
        data.restart_policy = request.restart_policy;

        info!(node_uuid = %data.node_uuid, service_key = %data.service_key, "Service tracked");
        self.store.insert(data).await
    }

    async fn mark_service_for_removal(
        &self,
        node_uuid: &NodeUuid,
        can_save: bool,
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let mut data = tracked.data.lock().await;
        data.requested_state = RequestedState::Stopped;
        data.dynamic_sidecar.removal_state.mark_to_remove(can_save);
        info!(node_uuid = %node_uuid, can_save, "Service marked for removal");
        Ok(())
    }

    async fn mark_all_services_in_wallet_for_removal(&self, wallet_id: WalletId) {
        let entries = self.store.all().await;
        for tracked in entries {
            let mut data = tracked.data.lock().await;
            if data.wallet_id != Some(wallet_id) {
                continue;
            }
            if data.dynamic_sidecar.removal_state.can_remove {
                continue;
            }
            data.requested_state = RequestedState::Stopped;
            data.dynamic_sidecar.removal_state.mark_to_remove(true);
            info!(node_uuid = %data.node_uuid, wallet_id = %wallet_id, "Service marked for removal (wallet)");
        }
    }

    async fn toggle_observation(&self, node_uuid: &NodeUuid, disable: bool) -> bool {
        let Ok(tracked) = self.store.get(node_uuid).await else {
            return false;
        };
        // An in-flight observation holds the entry mutex; refusing here lets
        // the caller retry instead of blocking behind a slow cycle.
        let Ok(mut data) = tracked.data.try_lock() else {
            return false;
        };
        data.paused = disable;
        true
    }

    async fn is_service_tracked(&self, node_uuid: &NodeUuid) -> bool {
        self.store.contains(node_uuid).await
    }

    async fn list_services(
        &self,
        user_id: Option<UserId>,
        project_id: Option<ProjectId>,
    ) -> Vec<NodeUuid> {
        self.store.list(user_id, project_id).await
    }

    async fn get_stack_status(
        &self,
        node_uuid: &NodeUuid,
    ) -> Result<RunningDynamicServiceDetails, SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let data = tracked.data.lock().await;
        Ok(RunningDynamicServiceDetails::from_scheduler_data(&data))
    }

    async fn is_service_awaiting_manual_intervention(
        &self,
        node_uuid: &NodeUuid,
    ) -> Result<bool, SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let data = tracked.data.lock().await;
        Ok(data.dynamic_sidecar.wait_for_manual_intervention)
    }

    async fn save_service_state(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let mut data = tracked.data.lock().await;
        if data.dynamic_sidecar.wait_for_manual_intervention {
            return Err(SchedulerError::ManualInterventionRequired(*node_uuid));
        }
        self.ctx
            .sidecar
            .save_state(&data.dynamic_sidecar.endpoint())
            .await?;
        // A later teardown must not repeat this potentially hour-long save.
        data.dynamic_sidecar.were_state_and_outputs_saved = true;
        self.persist_label(&data).await;
        if let Some(cb) = progress.as_ref() {
            cb("service state saved", 1.0);
        }
        Ok(())
    }

    async fn push_service_outputs(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let mut data = tracked.data.lock().await;
        if data.dynamic_sidecar.wait_for_manual_intervention {
            return Err(SchedulerError::ManualInterventionRequired(*node_uuid));
        }
        self.ctx
            .sidecar
            .push_output_ports(&data.dynamic_sidecar.endpoint())
            .await?;
        data.dynamic_sidecar.were_state_and_outputs_saved = true;
        self.persist_label(&data).await;
        if let Some(cb) = progress.as_ref() {
            cb("service outputs pushed", 1.0);
        }
        Ok(())
    }

    async fn remove_service_containers(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let mut data = tracked.data.lock().await;
        observer::remove_service_containers(&self.ctx, &data, progress.as_ref()).await?;
        data.dynamic_sidecar.was_compose_spec_submitted = false;
        Ok(())
    }

    async fn remove_service_docker_resources(
        &self,
        node_uuid: &NodeUuid,
        progress: Option<ProgressCallback>,
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        {
            let mut data = tracked.data.lock().await;
            observer::remove_docker_resources(&self.ctx, &mut data, progress.as_ref()).await?;
        }
        self.store.remove(node_uuid).await;
        Ok(())
    }

    async fn restart_containers(&self, node_uuid: &NodeUuid) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let data = tracked.data.lock().await;
        self.ctx
            .sidecar
            .restart_containers(&data.dynamic_sidecar.endpoint())
            .await?;
        Ok(())
    }

    async fn attach_project_network(
        &self,
        node_uuid: &NodeUuid,
        network_name: &str,
        network_aliases: &[String],
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let mut data = tracked.data.lock().await;

        let network_id = docker_api::create_project_network(
            self.ctx.engine.as_ref(),
            network_name,
            &data.project_id,
        )
        .await?;

        let endpoint = data.dynamic_sidecar.endpoint();
        for container in observer::container_names(&self.ctx, &endpoint).await? {
            self.ctx
                .sidecar
                .attach_container_to_network(&endpoint, &container, &network_id, network_aliases)
                .await?;
        }

        if !data.project_networks.iter().any(|n| n == network_name) {
            data.project_networks.push(network_name.to_string());
        }
        Ok(())
    }

    async fn detach_project_network(
        &self,
        node_uuid: &NodeUuid,
        network_name: &str,
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let mut data = tracked.data.lock().await;

        let networks = self
            .ctx
            .engine
            .list_networks(network_name)
            .await?;
        let Some(network) = networks.into_iter().next() else {
            data.project_networks.retain(|n| n != network_name);
            return Ok(());
        };

        let endpoint = data.dynamic_sidecar.endpoint();
        for container in observer::container_names(&self.ctx, &endpoint).await? {
            self.ctx
                .sidecar
                .detach_container_from_network(&endpoint, &container, &network.id)
                .await?;
        }

        data.project_networks.retain(|n| n != network_name);
        Ok(())
    }

    async fn free_reserved_disk_space(
        &self,
        node_uuid: &NodeUuid,
    ) -> Result<(), SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let data = tracked.data.lock().await;
        self.ctx
            .sidecar
            .free_reserved_disk_space(&data.dynamic_sidecar.endpoint())
            .await?;
        Ok(())
    }

    async fn retrieve_service_inputs(
        &self,
        node_uuid: &NodeUuid,
        port_keys: Option<Vec<String>>,
    ) -> Result<i64, SchedulerError> {
        let tracked = self.store.get(node_uuid).await?;
        let data = tracked.data.lock().await;
        let endpoint = data.dynamic_sidecar.endpoint();

        let transferred = self
            .ctx
            .sidecar
            .pull_input_ports(&endpoint, port_keys.as_deref())
            .await?;

        if data.restart_policy == RestartPolicy::OnInputsDownloaded {
            self.ctx.sidecar.restart_containers(&endpoint).await?;
        }
        Ok(transferred)
    }
}
