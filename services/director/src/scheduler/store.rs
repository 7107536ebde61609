//! Tracked-services table.
//!
//! Two locking levels: the table `RwLock` covers structural mutation
//! (insert/remove keys), the per-entry `Mutex` serializes everything that
//! touches one service's `SchedulerData`. Observation cycles for different
//! services never contend with each other; two cycles for the same service
//! cannot overlap.

use std::collections::HashMap;
use std::sync::Arc;

use quay_ids::{NodeUuid, ProjectId, UserId};
use tokio::sync::{Mutex, RwLock};

use crate::error::SchedulerError;
use crate::models::SchedulerData;

/// One tracked entry; the mutex is the per-service serialization point.
pub struct Tracked {
    pub data: Mutex<SchedulerData>,
}

impl Tracked {
    fn new(data: SchedulerData) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
        })
    }
}

/// The tracked-services table.
#[derive(Default)]
pub struct ServiceStore {
    entries: RwLock<HashMap<NodeUuid, Arc<Tracked>>>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry; fails if the node is already tracked.
    pub async fn insert(&self, data: SchedulerData) -> Result<(), SchedulerError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&data.node_uuid) {
            return Err(SchedulerError::AlreadyTracked(data.node_uuid));
        }
        entries.insert(data.node_uuid, Tracked::new(data));
        Ok(())
    }

    /// Insert or replace an entry; used by label recovery at startup.
    pub async fn insert_or_replace(&self, data: SchedulerData) {
        let mut entries = self.entries.write().await;
        entries.insert(data.node_uuid, Tracked::new(data));
    }

    pub async fn get(&self, node_uuid: &NodeUuid) -> Result<Arc<Tracked>, SchedulerError> {
        let entries = self.entries.read().await;
        entries
            .get(node_uuid)
            .cloned()
            .ok_or(SchedulerError::NotFound(*node_uuid))
    }

    pub async fn contains(&self, node_uuid: &NodeUuid) -> bool {
        self.entries.read().await.contains_key(node_uuid)
    }

    /// Remove an entry; missing entries are a no-op.
    pub async fn remove(&self, node_uuid: &NodeUuid) {
        self.entries.write().await.remove(node_uuid);
    }

    /// Snapshot of all tracked entries.
    pub async fn all(&self) -> Vec<Arc<Tracked>> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Node uuids matching the given identity filters.
    pub async fn list(
        &self,
        user_id: Option<UserId>,
        project_id: Option<ProjectId>,
    ) -> Vec<NodeUuid> {
        let snapshot = self.all().await;
        let mut matching = Vec::new();
        for tracked in snapshot {
            let data = tracked.data.lock().await;
            let user_ok = user_id.is_none_or(|u| data.user_id == u);
            let project_ok = project_id.is_none_or(|p| data.project_id == p);
            if user_ok && project_ok {
                matching.push(data.node_uuid);
            }
        }
        matching
    }
}
