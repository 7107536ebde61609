//! Long-running-task registry.
//!
//! Slow scheduler operations (state save, output push, teardown) are
//! executed in background tasks; REST callers get a [`TaskId`] back and
//! poll for progress and result. Tasks are keyed by operation and node so
//! re-submitting an operation that is still in flight returns the existing
//! task id instead of starting a second one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use quay_ids::TaskId;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheduler::ProgressCallback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        self != TaskState::Running
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub message: String,
    pub percent: f32,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            message: "queued".to_string(),
            percent: 0.0,
        }
    }
}

/// Snapshot of one task, as returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub progress: TaskProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TaskRecord {
    status: Mutex<TaskStatus>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of in-flight and recently finished tasks.
///
/// Owned by the application state; holds no global statics.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<TaskRecord>>>,
    /// Uniqueness keys of tasks that are still running.
    unique_keys: RwLock<HashMap<String, TaskId>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Submit a uniquely keyed operation.
    ///
    /// If a task with the same key is still running, its id is returned and
    /// nothing new is spawned. The operation receives a progress callback
    /// wired to this task's status.
    pub async fn submit<F, Fut>(self: &Arc<Self>, key: String, name: String, op: F) -> TaskId
    where
        F: FnOnce(ProgressCallback) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        if let Some(existing) = self.running_task_for_key(&key).await {
            debug!(%key, task_id = %existing, "Operation already in flight, reusing task");
            return existing;
        }

        let task_id = TaskId::new();
        let record = Arc::new(TaskRecord {
            status: Mutex::new(TaskStatus {
                task_id,
                name: name.clone(),
                state: TaskState::Running,
                progress: TaskProgress::default(),
                result: None,
                error: None,
            }),
            handle: Mutex::new(None),
        });

        self.tasks.write().await.insert(task_id, Arc::clone(&record));
        self.unique_keys.write().await.insert(key.clone(), task_id);

        let progress_record = Arc::clone(&record);
        let progress: ProgressCallback = Arc::new(move |message: &str, percent: f32| {
            // The status mutex is only ever held briefly; a blocking lock
            // from the callback would deadlock inside the task itself, so
            // updates that lose the race are simply dropped.
            if let Ok(mut status) = progress_record.status.try_lock() {
                status.progress = TaskProgress {
                    message: message.to_string(),
                    percent,
                };
            }
        });

        let registry = Arc::clone(self);
        let task_record = Arc::clone(&record);
        let handle = tokio::spawn(async move {
            let outcome = op(progress).await;

            let mut status = task_record.status.lock().await;
            match outcome {
                Ok(result) => {
                    status.state = TaskState::Succeeded;
                    status.progress.percent = 1.0;
                    status.result = Some(result);
                }
                Err(error) => {
                    warn!(task_id = %status.task_id, %error, "Background task failed");
                    status.state = TaskState::Failed;
                    status.error = Some(error);
                }
            }
            drop(status);

            registry.unique_keys.write().await.remove(&key);
        });

        *record.handle.lock().await = Some(handle);
        info!(task_id = %task_id, %name, "Background task started");
        task_id
    }

    async fn running_task_for_key(&self, key: &str) -> Option<TaskId> {
        let task_id = *self.unique_keys.read().await.get(key)?;
        let record = self.tasks.read().await.get(&task_id).cloned()?;
        let status = record.status.lock().await;
        (status.state == TaskState::Running).then_some(task_id)
    }

    /// Current status of a task.
    pub async fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        let record = self.tasks.read().await.get(task_id).cloned()?;
        let status = record.status.lock().await;
        Some(status.clone())
    }

    /// Cancel a running task and forget it.
    ///
    /// Terminal tasks are just removed. Returns false for unknown ids.
    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        let Some(record) = self.tasks.write().await.remove(task_id) else {
            return false;
        };

        let mut status = record.status.lock().await;
        if status.state == TaskState::Running {
            if let Some(handle) = record.handle.lock().await.take() {
                handle.abort();
            }
            status.state = TaskState::Cancelled;
            info!(task_id = %task_id, "Background task cancelled");
        }

        let mut keys = self.unique_keys.write().await;
        keys.retain(|_, id| id != task_id);
        true
    }
}
