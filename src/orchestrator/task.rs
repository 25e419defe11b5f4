//! The Task data model: the central entity the whole control plane revolves around.
//!
//! A [`Task`] is created once from an inbound `create-task` frame and lives in
//! the [`crate::orchestrator::task_store::TaskStore`] until the process exits.
//! It moves through the states of [`TaskStatus`] under its own control path
//! (see [`crate::orchestrator::control_graph`]); nothing outside that path
//! mutates it directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle states a [`Task`] passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    WaitingForCommand,
    WaitingForUser,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// A task in one of these states is no longer making progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// A task in one of these states has a live, awaited waiter.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::WaitingForCommand | TaskStatus::WaitingForUser)
    }
}

/// A single dialog turn appended to a task's `history`. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// `(tool_name, arguments)` produced by the Executor model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// An outstanding remote or user-question call a task is blocked on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: String,
    pub tool_name: String,
}

/// A single step in a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    pub details: String,
    #[serde(default)]
    pub expected_tools: Vec<String>,
}

/// Structured output of the Planner. Created once per task, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

/// Structured output of the Executor on each control-graph tick.
///
/// A discriminated union over `continue`/`need_user`/`complete`; see
/// [`ExecutorStep::status`] for the tag actually carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStep {
    pub status: ExecutorStatus,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub final_message: Option<String>,
    pub user_question: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Continue,
    NeedUser,
    Complete,
}

impl ExecutorStep {
    /// Validate the shape invariants §3 promises for each variant.
    ///
    /// Called immediately after a Model Adapter parses raw model text into an
    /// `ExecutorStep`; a structurally valid JSON document can still violate
    /// these invariants (e.g. `status: "continue"` with an empty `tool_calls`).
    pub fn validate(&self) -> Result<(), String> {
        match self.status {
            ExecutorStatus::Continue if self.tool_calls.is_empty() => {
                Err("status=continue requires at least one tool call".to_string())
            }
            ExecutorStatus::NeedUser if self.user_question.as_deref().unwrap_or("").trim().is_empty() => {
                Err("status=need_user requires a non-empty user_question".to_string())
            }
            ExecutorStatus::Complete if self.final_message.is_none() => {
                Err("status=complete requires a final_message".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// The central task entity. See the module and crate-level docs for the
/// lifecycle and invariants this type must uphold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub kind: String,
    pub client_id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub history: Vec<HistoryEntry>,
    /// Free-form per-task bag; holds the generated plan once planned.
    pub plan: Option<Plan>,
    pub allowed_tools: Vec<String>,
    pub file_cache: HashMap<String, String>,
    /// First-seen content per cached path, kept alongside `file_cache` so
    /// `diff-cache(path, against: "original", ...)` has something to diff
    /// against without the caller re-supplying it.
    pub file_cache_original: HashMap<String, String>,
    pub pending_call: Option<PendingCall>,
    /// The Executor's most recent decision, consumed by the `act` node of
    /// the control graph on the same tick it was produced.
    #[serde(skip)]
    pub pending_executor_step: Option<ExecutorStep>,
    pub consecutive_errors: u32,
    pub max_consecutive_errors: u32,
    pub step_count: u32,
    pub step_budget: u32,
    /// Sliding window of `(tool_name, arguments)` hashes for anti-loop detection.
    pub recent_call_hashes: Vec<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: String,
        kind: String,
        client_id: String,
        prompt: String,
        allowed_tools: Vec<String>,
        max_consecutive_errors: u32,
        step_budget: u32,
    ) -> Self {
        let now = Utc::now();
        Task {
            task_id,
            kind,
            client_id,
            prompt,
            status: TaskStatus::Queued,
            history: Vec::new(),
            plan: None,
            allowed_tools,
            file_cache: HashMap::new(),
            file_cache_original: HashMap::new(),
            pending_call: None,
            pending_executor_step: None,
            consecutive_errors: 0,
            max_consecutive_errors,
            step_count: 0,
            step_budget,
            recent_call_hashes: Vec::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn append_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        self.updated_at = Utc::now();
    }

    pub fn is_waiting_for(&self, call_id: &str) -> bool {
        self.pending_call.as_ref().map(|p| p.call_id == call_id).unwrap_or(false)
    }
}
