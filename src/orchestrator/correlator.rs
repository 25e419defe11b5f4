//! Correlates outbound `command-call`/`user-question` frames with their
//! inbound results (§4.3).
//!
//! Grounded in the same registry-of-guarded-state idiom as [`crate::orchestrator::channel_registry`],
//! keyed on `(task_id, call_id)` rather than `client_id`, with a `tokio::sync::oneshot`
//! per outstanding call standing in for the spec's "single-shot promise" — the
//! same primitive the source system's async wait-for-result call sites use.

use super::error::OrchestratorError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{timeout, Duration};

/// Why a waiter was cancelled rather than resolved with a real result.
///
/// Carried on `CallOutcome::Cancelled` so the control graph can tell an
/// explicit `cancel-task` apart from a transport disconnect and set the
/// task's final status accordingly (§7: `cancelled` is not a failure,
/// `transport-disconnected` is a terminal failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    ExplicitCancel,
    TransportDisconnected,
}

/// Whatever a remote or user-question call resolves with.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Ok(Value),
    Err(String),
    Cancelled(CancelReason),
}

type WaiterMap = HashMap<(String, String), oneshot::Sender<CallOutcome>>;

/// Owns every outstanding waiter exclusively.
#[derive(Default)]
pub struct Correlator {
    waiters: Arc<RwLock<WaiterMap>>,
}

impl Correlator {
    pub fn new() -> Self {
        Correlator { waiters: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Register a new waiter for `(task_id, call_id)`, returning the receiving half.
    pub async fn register(&self, task_id: &str, call_id: &str) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.write().await;
        waiters.insert((task_id.to_string(), call_id.to_string()), tx);
        rx
    }

    /// Deliver a result to a matching waiter, if one still exists.
    ///
    /// Late or duplicate deliveries (no matching waiter) are logged and dropped,
    /// satisfying §4.3's and §5's idempotence requirement.
    pub async fn resolve(&self, task_id: &str, call_id: &str, outcome: CallOutcome) {
        let mut waiters = self.waiters.write().await;
        match waiters.remove(&(task_id.to_string(), call_id.to_string())) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                log::info!(
                    "dropped command-result for task={} call_id={}: no matching waiter (late or duplicate)",
                    task_id,
                    call_id
                );
            }
        }
    }

    /// Remove a waiter and resolve it with a cancellation outcome, if present.
    pub async fn cancel(&self, task_id: &str, call_id: &str, reason: CancelReason) {
        let mut waiters = self.waiters.write().await;
        if let Some(tx) = waiters.remove(&(task_id.to_string(), call_id.to_string())) {
            let _ = tx.send(CallOutcome::Cancelled(reason));
        }
    }

    /// Remove and cancel every waiter belonging to `task_id` (used on transport
    /// disconnect or task cancellation, where every outstanding call must die).
    pub async fn cancel_all_for_task(&self, task_id: &str, reason: CancelReason) {
        let mut waiters = self.waiters.write().await;
        let keys: Vec<_> = waiters.keys().filter(|(t, _)| t == task_id).cloned().collect();
        for key in keys {
            if let Some(tx) = waiters.remove(&key) {
                let _ = tx.send(CallOutcome::Cancelled(reason));
            }
        }
    }

    /// Await a previously registered waiter up to `timeout_duration`.
    ///
    /// On timeout, the waiter is removed (it may otherwise still be resolved
    /// racily by a just-arriving result) and a [`OrchestratorError::RemoteTimeout`]
    /// is returned.
    pub async fn wait(
        &self,
        task_id: &str,
        call_id: &str,
        tool_name: &str,
        rx: oneshot::Receiver<CallOutcome>,
        timeout_duration: Duration,
    ) -> Result<CallOutcome, OrchestratorError> {
        match timeout(timeout_duration, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // The sender half was dropped without resolving — only happens if the
            // owning task's control graph died mid-wait, the same as a disconnect.
            Ok(Err(_)) => Ok(CallOutcome::Cancelled(CancelReason::TransportDisconnected)),
            Err(_) => {
                let mut waiters = self.waiters.write().await;
                waiters.remove(&(task_id.to_string(), call_id.to_string()));
                Err(OrchestratorError::RemoteTimeout {
                    tool_name: tool_name.to_string(),
                    call_id: call_id.to_string(),
                })
            }
        }
    }

    pub async fn outstanding_count(&self) -> usize {
        self.waiters.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve_delivers_outcome() {
        let correlator = Correlator::new();
        let rx = correlator.register("task-1", "call-1").await;
        correlator.resolve("task-1", "call-1", CallOutcome::Ok(serde_json::json!({"ok": true}))).await;
        let outcome =
            correlator.wait("task-1", "call-1", "read-file", rx, Duration::from_secs(1)).await.unwrap();
        matches!(outcome, CallOutcome::Ok(_));
    }

    #[tokio::test]
    async fn resolve_with_no_waiter_is_dropped_silently() {
        let correlator = Correlator::new();
        correlator.resolve("task-1", "nonexistent", CallOutcome::Ok(serde_json::json!(null))).await;
        assert_eq!(correlator.outstanding_count().await, 0);
    }

    #[tokio::test]
    async fn wait_times_out_and_removes_waiter() {
        let correlator = Correlator::new();
        let rx = correlator.register("task-1", "call-1").await;
        let result =
            correlator.wait("task-1", "call-1", "run-program", rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(OrchestratorError::RemoteTimeout { .. })));
        assert_eq!(correlator.outstanding_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_all_for_task_only_touches_that_task() {
        let correlator = Correlator::new();
        let rx1 = correlator.register("task-1", "call-1").await;
        let _rx2 = correlator.register("task-2", "call-2").await;
        correlator.cancel_all_for_task("task-1", CancelReason::ExplicitCancel).await;
        assert_eq!(correlator.outstanding_count().await, 1);
        let outcome = rx1.await.unwrap();
        assert!(matches!(outcome, CallOutcome::Cancelled(CancelReason::ExplicitCancel)));
    }
}
