//! In-memory registry of tasks.
//!
//! Each task gets its own lock (`Arc<tokio::sync::Mutex<Task>>`), and the
//! registry itself is a [`DashMap`] so that looking up *different* tasks never
//! contends. This is the literal reading of §5's "guarded with per-entry
//! locking (one lock per connection, one per task)": the store's own map
//! operations use `DashMap`'s internal sharding, and holding a single task's
//! lock across the async model-adapter call inside its own control path never
//! blocks any other task's lookups.

use super::error::OrchestratorError;
use super::task::{HistoryEntry, PendingCall, Task, TaskStatus};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type TaskHandle = Arc<Mutex<Task>>;

/// Owns all [`Task`]s exclusively; every other component borrows tasks by id.
#[derive(Default)]
pub struct TaskStore {
    tasks: DashMap<String, TaskHandle>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self { tasks: DashMap::new() }
    }

    /// Create a new task in `queued`, seeded with a system message in history.
    pub fn create(
        &self,
        kind: String,
        client_id: String,
        prompt: String,
        allowed_tools: Vec<String>,
        system_prompt: &str,
        max_consecutive_errors: u32,
        step_budget: u32,
    ) -> TaskHandle {
        let task_id = Uuid::new_v4().to_string();
        let mut task = Task::new(
            task_id.clone(),
            kind.clone(),
            client_id.clone(),
            prompt,
            allowed_tools,
            max_consecutive_errors,
            step_budget,
        );
        task.append_history(HistoryEntry::system(system_prompt.to_string()));
        log::info!("task {} created (kind={}, client={})", task_id, kind, client_id);
        let handle = Arc::new(Mutex::new(task));
        self.tasks.insert(task_id, handle.clone());
        handle
    }

    pub fn get(&self, task_id: &str) -> Option<TaskHandle> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn require(&self, task_id: &str) -> Result<TaskHandle, OrchestratorError> {
        self.get(task_id).ok_or_else(|| OrchestratorError::UnknownTask { task_id: task_id.to_string() })
    }

    pub async fn set_status(&self, task_id: &str, status: TaskStatus) {
        if let Some(handle) = self.get(task_id) {
            let mut task = handle.lock().await;
            task.status = status;
            task.updated_at = chrono::Utc::now();
            log::info!("task {} status -> {:?}", task_id, status);
        }
    }

    pub async fn complete(&self, task_id: &str, result: Value) {
        if let Some(handle) = self.get(task_id) {
            let mut task = handle.lock().await;
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.updated_at = chrono::Utc::now();
            log::info!("task {} completed", task_id);
        }
    }

    pub async fn fail(&self, task_id: &str, error: impl Into<String>) {
        if let Some(handle) = self.get(task_id) {
            let mut task = handle.lock().await;
            let error = error.into();
            task.status = TaskStatus::Failed;
            task.error = Some(error.clone());
            task.updated_at = chrono::Utc::now();
            log::warn!("task {} failed: {}", task_id, error);
        }
    }

    pub async fn set_pending(&self, task_id: &str, call_id: String, tool_name: String, waiting_for_user: bool) {
        if let Some(handle) = self.get(task_id) {
            let mut task = handle.lock().await;
            task.pending_call = Some(PendingCall { call_id, tool_name });
            task.status = if waiting_for_user { TaskStatus::WaitingForUser } else { TaskStatus::WaitingForCommand };
            task.updated_at = chrono::Utc::now();
        }
    }

    pub async fn clear_pending(&self, task_id: &str) {
        if let Some(handle) = self.get(task_id) {
            let mut task = handle.lock().await;
            task.pending_call = None;
            task.status = TaskStatus::Running;
            task.updated_at = chrono::Utc::now();
        }
    }

    pub async fn append_history(&self, task_id: &str, entry: HistoryEntry) {
        if let Some(handle) = self.get(task_id) {
            let mut task = handle.lock().await;
            task.append_history(entry);
        }
    }

    /// All tasks whose `client_id` matches, regardless of status.
    pub fn tasks_by_client(&self, client_id: &str) -> Vec<TaskHandle> {
        self.tasks
            .iter()
            .filter(|entry| {
                // Best-effort snapshot check; callers needing certainty should
                // re-check client_id under the task's own lock.
                entry.value().try_lock().map(|t| t.client_id == client_id).unwrap_or(false)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}
