//! Executes a batch of tool calls for one task with the flow-control policy
//! of §4.4: local tools run inline, the first remote or user-question call
//! suspends the batch.

use super::cache;
use super::cache::PatchFormat;
use super::channel_registry::ChannelRegistry;
use super::config::{Config, ToolClass};
use super::correlator::{CallOutcome, CancelReason, Correlator};
use super::protocol::OutboundFrame;
use super::task::{HistoryEntry, Task, ToolCall};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use uuid::Uuid;

/// What the control graph should do after a batch returns.
pub enum BatchOutcome {
    /// Every call in the batch ran to completion locally.
    Done,
    /// The batch stopped on a remote call; `waiter` resolves when the result arrives.
    WaitingForCommand { call_id: String, tool_name: String, waiter: oneshot::Receiver<CallOutcome> },
    /// The batch stopped on an accepted `ask-user` question.
    WaitingForUser { call_id: String, waiter: oneshot::Receiver<CallOutcome> },
    /// A dispatch-time transport failure; not terminal, but nothing ran after it.
    Error { message: String },
}

pub struct Dispatcher<'a> {
    config: &'a Config,
    channel_registry: &'a ChannelRegistry,
    correlator: &'a Correlator,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a Config, channel_registry: &'a ChannelRegistry, correlator: &'a Correlator) -> Self {
        Dispatcher { config, channel_registry, correlator }
    }

    /// Run `calls` against `task` in order, mutating its history/cache/error
    /// counters as it goes, stopping at the first remote or accepted
    /// user-question call.
    pub async fn dispatch(&self, task: &mut Task, calls: Vec<ToolCall>) -> BatchOutcome {
        for call in calls {
            // Sanitize before anything that looks at the call's identity: two
            // dispatches equal only after fence-stripping must hash and
            // authorize identically, not evade the duplicate-call throttle.
            let call = sanitize_call(call);

            if !task.allowed_tools.iter().any(|t| t == &call.tool) {
                task.append_history(HistoryEntry::user(format!(
                    "tool '{}' is not allowed for this task",
                    call.tool
                )));
                log::warn!("task {}: unauthorized tool '{}'", task.task_id, call.tool);
                continue;
            }

            if self.is_duplicate(task, &call) {
                task.append_history(HistoryEntry::user(format!(
                    "'{}' called identically too many times in a row; change strategy",
                    call.tool
                )));
                log::warn!("task {}: duplicate-call throttle on '{}'", task.task_id, call.tool);
                continue;
            }
            self.record_call_hash(task, &call);

            let class = match self.config.tool_class(&call.tool) {
                Some(c) => c,
                None => {
                    task.append_history(HistoryEntry::user(format!("tool '{}' is not registered", call.tool)));
                    continue;
                }
            };

            match class {
                ToolClass::Local => self.run_local(task, &call).await,
                ToolClass::Remote => {
                    let effective_call = if call.tool == "flush-cache" {
                        match self.translate_flush_cache(task, &call) {
                            Ok(c) => c,
                            Err(e) => {
                                task.append_history(HistoryEntry::user(format!("flush-cache failed: {}", e)));
                                continue;
                            }
                        }
                    } else {
                        call.clone()
                    };
                    return self.dispatch_remote(task, &effective_call).await;
                }
                ToolClass::AskUser => {
                    if let Some(outcome) = self.dispatch_ask_user(task, &call).await {
                        return outcome;
                    }
                    // forbidden phrasing: rejection already appended, advance.
                }
            }
        }
        BatchOutcome::Done
    }

    /// `flush-cache(path)` writes a cached file's current content back to the
    /// client; it is dispatched as a `write-file` remote call under the hood
    /// (§4.7), not as a command the client itself needs to know about.
    fn translate_flush_cache(&self, task: &Task, call: &ToolCall) -> Result<ToolCall, String> {
        let path = call.arguments.get("path").and_then(Value::as_str).unwrap_or_default();
        let content = cache::read_cache(task, path).map_err(|e| e.to_string())?.to_string();
        Ok(ToolCall { tool: "write-file".to_string(), arguments: serde_json::json!({"path": path, "content": content}) })
    }

    fn is_duplicate(&self, task: &Task, call: &ToolCall) -> bool {
        let hash = hash_call(call);
        let window_start = task.recent_call_hashes.len().saturating_sub(self.config.duplicate_call_window);
        let recent = &task.recent_call_hashes[window_start..];
        recent.iter().filter(|h| **h == hash).count() + 1 >= self.config.duplicate_call_threshold
    }

    fn record_call_hash(&self, task: &mut Task, call: &ToolCall) {
        task.recent_call_hashes.push(hash_call(call));
        let cap = self.config.duplicate_call_window * 4;
        if task.recent_call_hashes.len() > cap {
            let drop = task.recent_call_hashes.len() - cap;
            task.recent_call_hashes.drain(0..drop);
        }
    }

    async fn run_local(&self, task: &mut Task, call: &ToolCall) {
        let outcome = match call.tool.as_str() {
            "status-update" => {
                let message = call.arguments.get("message").and_then(Value::as_str).unwrap_or("").to_string();
                let frame = OutboundFrame::StatusUpdate { task_id: task.task_id.clone(), message: message.clone() };
                self.channel_registry.send(&task.client_id, &frame).await;
                format!("status sent: {}", message)
            }
            "cache-patch" => self.run_cache_patch(task, call),
            "cache-diff" => self.run_cache_diff(task, call),
            "cache-syntax-check" => self.run_cache_syntax_check(task, call),
            other => format!("no local handler for '{}'", other),
        };
        task.append_history(HistoryEntry::user(outcome));
    }

    fn run_cache_patch(&self, task: &mut Task, call: &ToolCall) -> String {
        let path = call.arguments.get("path").and_then(Value::as_str).unwrap_or_default();
        let patch = call.arguments.get("patch").and_then(Value::as_str).unwrap_or_default();
        let dry_run = call.arguments.get("dry_run").and_then(Value::as_bool).unwrap_or(false);
        let format = match call.arguments.get("format").and_then(Value::as_str) {
            Some("regex-replace") => PatchFormat::RegexReplace,
            Some("range-replace") => PatchFormat::RangeReplace,
            _ => PatchFormat::UnifiedDiff,
        };
        match cache::patch_cache(task, path, patch, format, dry_run) {
            Ok(outcome) => format!("{}\nsize={}\n{}", outcome.diff, outcome.new_size, outcome.notes),
            Err(e) => format!("patch-cache failed: {}", e),
        }
    }

    fn run_cache_diff(&self, task: &mut Task, call: &ToolCall) -> String {
        let path = call.arguments.get("path").and_then(Value::as_str).unwrap_or_default();
        let against = match call.arguments.get("against").and_then(Value::as_str) {
            Some("original") => cache::DiffAgainst::Original,
            _ => cache::DiffAgainst::Provided,
        };
        let provided = call.arguments.get("provided").and_then(Value::as_str).unwrap_or_default();
        match cache::diff_cache(task, path, against, provided) {
            Ok(diff) => diff,
            Err(e) => format!("diff-cache failed: {}", e),
        }
    }

    fn run_cache_syntax_check(&self, task: &mut Task, call: &ToolCall) -> String {
        let path = call.arguments.get("path").and_then(Value::as_str).unwrap_or_default();
        let checker = call.arguments.get("checker").and_then(Value::as_str);
        match cache::syntax_check_cache(task, path, checker) {
            Ok(note) => note,
            Err(e) => format!("syntax-check failed: {}", e),
        }
    }

    async fn dispatch_remote(&self, task: &mut Task, call: &ToolCall) -> BatchOutcome {
        let call_id = Uuid::new_v4().to_string();
        let waiter = self.correlator.register(&task.task_id, &call_id).await;
        let frame = OutboundFrame::CommandCall {
            task_id: task.task_id.clone(),
            call_id: call_id.clone(),
            command: call.tool.clone(),
            args: call.arguments.clone(),
        };
        if !self.channel_registry.send(&task.client_id, &frame).await {
            self.correlator.cancel(&task.task_id, &call_id, CancelReason::TransportDisconnected).await;
            return BatchOutcome::Error { message: format!("failed to send command-call for '{}'", call.tool) };
        }
        task.pending_call = Some(super::task::PendingCall { call_id: call_id.clone(), tool_name: call.tool.clone() });
        BatchOutcome::WaitingForCommand { call_id, tool_name: call.tool.clone(), waiter }
    }

    /// Returns `None` when the question was rejected (caller should advance);
    /// `Some(outcome)` when it was accepted and the batch must stop.
    async fn dispatch_ask_user(&self, task: &mut Task, call: &ToolCall) -> Option<BatchOutcome> {
        let question = call.arguments.get("question").and_then(Value::as_str).unwrap_or_default();
        let normalized = question.to_lowercase();
        if let Some(hit) = self.config.forbidden_question_substrings.iter().find(|s| normalized.contains(s.as_str())) {
            task.append_history(HistoryEntry::user(format!(
                "question rejected (contains '{}'): decide for yourself, or ask a behavioral question instead of asking for code/implementation details",
                hit
            )));
            return None;
        }

        let call_id = Uuid::new_v4().to_string();
        let waiter = self.correlator.register(&task.task_id, &call_id).await;
        let frame = OutboundFrame::UserQuestion {
            task_id: task.task_id.clone(),
            call_id: call_id.clone(),
            question: question.to_string(),
        };
        if !self.channel_registry.send(&task.client_id, &frame).await {
            self.correlator.cancel(&task.task_id, &call_id, CancelReason::TransportDisconnected).await;
            return Some(BatchOutcome::Error { message: "failed to send user-question".to_string() });
        }
        task.pending_call = Some(super::task::PendingCall { call_id: call_id.clone(), tool_name: call.tool.clone() });
        Some(BatchOutcome::WaitingForUser { call_id, waiter })
    }
}

fn hash_call(call: &ToolCall) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(call.tool.as_bytes());
    hasher.update(call.arguments.to_string().as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

/// Strip exactly one enclosing layer of Markdown code fences or backticks
/// from a `content` argument. The only permitted rewrite of model output (§4.5).
fn sanitize_call(mut call: ToolCall) -> ToolCall {
    if let Value::Object(ref mut map) = call.arguments {
        if let Some(Value::String(content)) = map.get("content") {
            let sanitized = strip_one_wrapper(content);
            map.insert("content".to_string(), Value::String(sanitized));
        }
    }
    call
}

fn strip_one_wrapper(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            let inner = match inner.find('\n') {
                Some(idx) if inner[..idx].chars().all(|c| c.is_alphanumeric()) => &inner[idx + 1..],
                _ => inner,
            };
            return inner.trim().to_string();
        }
    }
    if trimmed.len() >= 2 && trimmed.starts_with('`') && trimmed.ends_with('`') {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    s.to_string()
}
