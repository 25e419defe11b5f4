//! The task control graph: `ensure-plan → decide-next → act`, with
//! suspension points at remote-call and user-question boundaries (§4.6).
//!
//! Implemented as an explicit loop over an enum of graph nodes, not nested
//! callbacks, per the Design Note in §9 — the direct structural translation
//! of the source system's `agents/graph.py` `StateGraph` (`ensure_plan` /
//! `decide_next` / `act` nodes cycling back to `decide_next`), but expressed
//! as a Rust state machine driven by its own `tokio::spawn`ed task rather
//! than a checkpointed graph runtime.

use super::cache;
use super::channel_registry::ChannelRegistry;
use super::config::Config;
use super::correlator::{CallOutcome, CancelReason, Correlator};
use super::dispatcher::{BatchOutcome, Dispatcher};
use super::error::OrchestratorError;
use super::model_adapter::{ExecutorAdapter, PlannerAdapter};
use super::protocol::OutboundFrame;
use super::task::{ExecutorStatus, HistoryEntry, Task, TaskStatus};
use super::task_store::{TaskHandle, TaskStore};
use std::sync::Arc;

/// Shared state every task's control graph needs; cheap to clone (all `Arc`s).
#[derive(Clone)]
pub struct GraphContext {
    pub config: Arc<Config>,
    pub task_store: Arc<TaskStore>,
    pub channel_registry: Arc<ChannelRegistry>,
    pub correlator: Arc<Correlator>,
}

enum Node {
    EnsurePlan,
    DecideNext,
    Act,
    Done,
}

/// Drives one task from its current state to a terminal state, suspending on
/// waiters as needed. Spawned once per task by the Protocol Surface on
/// `create-task`, and re-entered is never necessary: suspension happens
/// in-line via `.await` on the correlator's waiter, not by returning early.
pub async fn run(handle: TaskHandle, ctx: GraphContext) {
    let task_id = handle.lock().await.task_id.clone();
    let mut node = Node::EnsurePlan;

    loop {
        if is_cancelled(&handle).await {
            log::info!("task {} observed cancellation; halting graph", task_id);
            return;
        }

        node = match node {
            Node::EnsurePlan => ensure_plan(&handle, &ctx).await,
            Node::DecideNext => decide_next(&handle, &ctx).await,
            Node::Act => act(&handle, &ctx).await,
            Node::Done => return,
        };
    }
}

async fn is_cancelled(handle: &TaskHandle) -> bool {
    handle.lock().await.status == TaskStatus::Cancelled
}

async fn ensure_plan(handle: &TaskHandle, ctx: &GraphContext) -> Node {
    let (task_id, prompt, allowed_tools, already_planned) = {
        let task = handle.lock().await;
        (task.task_id.clone(), task.prompt.clone(), task.allowed_tools.clone(), task.plan.is_some())
    };

    if already_planned {
        return Node::DecideNext;
    }

    ctx.task_store.set_status(&task_id, TaskStatus::Running).await;
    let adapter = PlannerAdapter::new(&ctx.config.planner_llm);
    match adapter.plan(&prompt, &allowed_tools).await {
        Ok(plan) => {
            let mut task = handle.lock().await;
            task.plan = Some(plan);
            task.updated_at = chrono::Utc::now();
            Node::DecideNext
        }
        Err(err) => {
            fail_task(handle, ctx, err).await;
            Node::Done
        }
    }
}

async fn decide_next(handle: &TaskHandle, ctx: &GraphContext) -> Node {
    let (task_id, prompt, plan, allowed_tools, history_window) = {
        let mut task = handle.lock().await;
        // One control-graph tick, successful or not, consumes one step of the
        // budget (§4.6, §8): this is what bounds a task stuck cycling through
        // non-terminal errors (duplicate-call, remote-timeout, ...).
        task.step_count += 1;
        if task.step_count > task.step_budget {
            let step_budget = task.step_budget;
            drop(task);
            fail_task(handle, ctx, OrchestratorError::BudgetExhausted { step_budget }).await;
            return Node::Done;
        }
        let plan = match task.plan.clone() {
            Some(p) => p,
            None => {
                return Node::EnsurePlan;
            }
        };
        (
            task.task_id.clone(),
            task.prompt.clone(),
            plan,
            task.allowed_tools.clone(),
            bounded_history(&task, ctx.config.history_window, ctx.config.history_char_budget),
        )
    };

    let adapter = ExecutorAdapter::new(&ctx.config.executor_llm);
    match adapter.step(&prompt, &plan, &allowed_tools, &history_window).await {
        Ok(step) => {
            let mut task = handle.lock().await;
            task.pending_executor_step = Some(step);
            Node::Act
        }
        Err(err) => {
            let terminal = err.is_terminal();
            let mut task = handle.lock().await;
            task.append_history(HistoryEntry::user(format!("executor error: {}", err)));
            task.consecutive_errors += 1;
            let exceeded = task.consecutive_errors >= task.max_consecutive_errors;
            drop(task);
            if terminal || exceeded {
                fail_task(handle, ctx, err).await;
                Node::Done
            } else {
                Node::DecideNext
            }
        }
    }
}

/// Most-recent-first view of `history`, bounded by turn count and then
/// trimmed further from the oldest end until it fits `char_budget` (§4.5.1):
/// whichever bound is tighter wins. At least one entry is always kept.
fn bounded_history(task: &Task, window: usize, char_budget: usize) -> Vec<String> {
    let mut lines: Vec<String> =
        task.history.iter().rev().take(window).rev().map(|h| format!("{}: {}", h.role, h.content)).collect();

    let mut total: usize = lines.iter().map(|l| l.len()).sum();
    while total > char_budget && lines.len() > 1 {
        total -= lines.remove(0).len();
    }
    lines
}

async fn act(handle: &TaskHandle, ctx: &GraphContext) -> Node {
    let step = {
        let mut task = handle.lock().await;
        task.pending_executor_step.take()
    };
    let step = match step {
        Some(s) => s,
        None => return Node::DecideNext,
    };

    match step.status {
        ExecutorStatus::Complete => {
            let task_id = handle.lock().await.task_id.clone();
            let message = step.final_message.unwrap_or_default();
            let result = serde_json::json!({"message": message});
            ctx.task_store.complete(&task_id, result.clone()).await;
            ctx.channel_registry
                .send(&client_id_of(handle).await, &OutboundFrame::TaskCompleted { task_id, result })
                .await;
            Node::Done
        }
        ExecutorStatus::NeedUser => {
            let question = step.user_question.unwrap_or_default();
            suspend_on_question(handle, ctx, question).await
        }
        ExecutorStatus::Continue => {
            let tool_calls = step.tool_calls;
            let outcome = {
                let mut task = handle.lock().await;
                let dispatcher = Dispatcher::new(&ctx.config, &ctx.channel_registry, &ctx.correlator);
                dispatcher.dispatch(&mut task, tool_calls).await
            };

            match outcome {
                BatchOutcome::Done => {
                    reset_error_streak(handle).await;
                    Node::DecideNext
                }
                BatchOutcome::WaitingForCommand { call_id, tool_name, waiter } => {
                    suspend_on_command(handle, ctx, call_id, tool_name, waiter).await
                }
                BatchOutcome::WaitingForUser { call_id, waiter } => {
                    await_waiter_as_user_answer(handle, ctx, call_id, waiter).await
                }
                BatchOutcome::Error { message } => {
                    let mut task = handle.lock().await;
                    task.append_history(HistoryEntry::user(format!("dispatch error: {}", message)));
                    task.consecutive_errors += 1;
                    let exceeded = task.consecutive_errors >= task.max_consecutive_errors;
                    drop(task);
                    if exceeded {
                        fail_task(handle, ctx, OrchestratorError::ValidationError { detail: message }).await;
                        Node::Done
                    } else {
                        Node::DecideNext
                    }
                }
            }
        }
    }
}

async fn suspend_on_question(handle: &TaskHandle, ctx: &GraphContext, question: String) -> Node {
    let (task_id, client_id) = {
        let task = handle.lock().await;
        (task.task_id.clone(), task.client_id.clone())
    };
    let call_id = uuid::Uuid::new_v4().to_string();
    let waiter = ctx.correlator.register(&task_id, &call_id).await;
    let frame = OutboundFrame::UserQuestion { task_id: task_id.clone(), call_id: call_id.clone(), question };
    if !ctx.channel_registry.send(&client_id, &frame).await {
        fail_task(handle, ctx, OrchestratorError::TransportSend { client_id, reason: "send failed".to_string() }).await;
        return Node::Done;
    }
    ctx.task_store.set_pending(&task_id, call_id, "ask-user".to_string(), true).await;
    await_waiter_as_user_answer_inner(handle, ctx, waiter).await
}

async fn suspend_on_command(
    handle: &TaskHandle,
    ctx: &GraphContext,
    call_id: String,
    tool_name: String,
    waiter: tokio::sync::oneshot::Receiver<CallOutcome>,
) -> Node {
    let task_id = handle.lock().await.task_id.clone();
    ctx.task_store.set_pending(&task_id, call_id.clone(), tool_name.clone(), false).await;

    let outcome = ctx
        .correlator
        .wait(&task_id, &call_id, &tool_name, waiter, ctx.config.remote_call_timeout)
        .await;

    ctx.task_store.clear_pending(&task_id).await;

    match outcome {
        Ok(CallOutcome::Ok(result)) => {
            let mut task = handle.lock().await;
            if tool_name == "read-file" {
                if let Some(content) = result.get("content").and_then(|v| v.as_str()) {
                    if let Some(path) = result.get("path").and_then(|v| v.as_str()) {
                        cache::write_cache(&mut task, path, content.to_string());
                    }
                }
            }
            task.append_history(HistoryEntry::user(format!("{} result: {}", tool_name, result)));
            reset_error_streak_locked(&mut task);
            Node::DecideNext
        }
        Ok(CallOutcome::Err(message)) => {
            let mut task = handle.lock().await;
            task.append_history(HistoryEntry::user(format!("{} failed: {}", tool_name, message)));
            task.consecutive_errors += 1;
            Node::DecideNext
        }
        Ok(CallOutcome::Cancelled(CancelReason::ExplicitCancel)) => {
            let mut task = handle.lock().await;
            task.status = TaskStatus::Cancelled;
            Node::Done
        }
        Ok(CallOutcome::Cancelled(CancelReason::TransportDisconnected)) => {
            let client_id = handle.lock().await.client_id.clone();
            fail_task(handle, ctx, OrchestratorError::TransportDisconnected { client_id }).await;
            Node::Done
        }
        Err(OrchestratorError::RemoteTimeout { tool_name, call_id }) => {
            let mut task = handle.lock().await;
            task.append_history(HistoryEntry::user(format!(
                "remote call '{}' (call_id={}) timed out",
                tool_name, call_id
            )));
            Node::DecideNext
        }
        Err(_) => Node::DecideNext,
    }
}

async fn await_waiter_as_user_answer(
    handle: &TaskHandle,
    ctx: &GraphContext,
    call_id: String,
    waiter: tokio::sync::oneshot::Receiver<CallOutcome>,
) -> Node {
    let task_id = handle.lock().await.task_id.clone();
    ctx.task_store.set_pending(&task_id, call_id, "ask-user".to_string(), true).await;
    await_waiter_as_user_answer_inner(handle, ctx, waiter).await
}

async fn await_waiter_as_user_answer_inner(
    handle: &TaskHandle,
    ctx: &GraphContext,
    waiter: tokio::sync::oneshot::Receiver<CallOutcome>,
) -> Node {
    let task_id = handle.lock().await.task_id.clone();
    let outcome = waiter.await;
    ctx.task_store.clear_pending(&task_id).await;

    match outcome {
        Ok(CallOutcome::Ok(answer)) => {
            let mut task = handle.lock().await;
            let text = answer.get("answer").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            task.append_history(HistoryEntry::user(format!("user answered: {}", text)));
            Node::DecideNext
        }
        Ok(CallOutcome::Err(message)) => {
            let mut task = handle.lock().await;
            task.append_history(HistoryEntry::user(format!("user answer delivery failed: {}", message)));
            Node::DecideNext
        }
        Ok(CallOutcome::Cancelled(CancelReason::ExplicitCancel)) => {
            let mut task = handle.lock().await;
            task.status = TaskStatus::Cancelled;
            Node::Done
        }
        Ok(CallOutcome::Cancelled(CancelReason::TransportDisconnected)) | Err(_) => {
            let client_id = handle.lock().await.client_id.clone();
            fail_task(handle, ctx, OrchestratorError::TransportDisconnected { client_id }).await;
            Node::Done
        }
    }
}

async fn reset_error_streak(handle: &TaskHandle) {
    let mut task = handle.lock().await;
    reset_error_streak_locked(&mut task);
}

fn reset_error_streak_locked(task: &mut Task) {
    task.consecutive_errors = 0;
}

async fn client_id_of(handle: &TaskHandle) -> String {
    handle.lock().await.client_id.clone()
}

async fn fail_task(handle: &TaskHandle, ctx: &GraphContext, err: OrchestratorError) {
    let (task_id, client_id) = {
        let task = handle.lock().await;
        (task.task_id.clone(), task.client_id.clone())
    };
    log::warn!("task {} failed: {}", task_id, err);
    ctx.task_store.fail(&task_id, err.to_string()).await;
    ctx.channel_registry
        .send(&client_id, &OutboundFrame::TaskFailed { task_id: Some(task_id), request_id: None, error: err.to_string() })
        .await;
}
