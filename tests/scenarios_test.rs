//! End-to-end exercises of the six concrete scenarios in §8, built directly
//! on the Tool Dispatcher, Correlator, and Channel Registry — the part of
//! the control plane reachable without a live language model. Each test
//! plays the part of the Executor by handing the dispatcher the exact tool
//! calls the scenario says the Executor emits, and the part of the remote
//! client by reading `command-call` frames off the registry's outbound
//! queue and replying through the correlator, the way a real client and a
//! fake model backend would in a full integration harness (§10.4).

use orchestrator::orchestrator::cache;
use orchestrator::orchestrator::channel_registry::{ChannelRegistry, ClientHandle};
use orchestrator::orchestrator::config::Config;
use orchestrator::orchestrator::correlator::{CallOutcome, CancelReason, Correlator};
use orchestrator::orchestrator::dispatcher::{BatchOutcome, Dispatcher};
use orchestrator::orchestrator::task::{Task, ToolCall};
use serde_json::json;
use tokio::sync::mpsc;

async fn connected_client(registry: &ChannelRegistry, client_id: &str) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    registry.connect(client_id.to_string(), ClientHandle::new(tx)).await;
    rx
}

fn task_with_tools(tools: &[&str]) -> Task {
    Task::new(
        "task-1".to_string(),
        "general-agent".to_string(),
        "client-1".to_string(),
        "prompt".to_string(),
        tools.iter().map(|s| s.to_string()).collect(),
        3,
        20,
    )
}

/// Scenario 1: read-and-summarize.
#[tokio::test]
async fn read_and_summarize() {
    let config = Config::default();
    let registry = ChannelRegistry::new();
    let correlator = Correlator::new();
    let mut rx = connected_client(&registry, "client-1").await;
    let dispatcher = Dispatcher::new(&config, &registry, &correlator);

    let mut task = task_with_tools(&["read-file"]);
    let outcome = dispatcher
        .dispatch(&mut task, vec![ToolCall { tool: "read-file".to_string(), arguments: json!({"path": "/a.txt"}) }])
        .await;

    let (call_id, waiter) = match outcome {
        BatchOutcome::WaitingForCommand { call_id, waiter, .. } => (call_id, waiter),
        _ => panic!("expected a waiting-for-command outcome"),
    };

    let sent = rx.recv().await.unwrap();
    assert!(sent.contains("command-call"));
    assert!(sent.contains("read-file"));

    correlator
        .resolve("task-1", &call_id, CallOutcome::Ok(json!({"path": "/a.txt", "content": "hello"})))
        .await;
    let result = waiter.await.unwrap();
    let content = match result {
        CallOutcome::Ok(v) => v,
        other => panic!("unexpected outcome: {:?}", other),
    };
    cache::write_cache(&mut task, "/a.txt", content["content"].as_str().unwrap().to_string());
    assert_eq!(cache::read_cache(&task, "/a.txt").unwrap(), "hello");
}

/// Scenario 2: write-then-run, failing once on syntax, then succeeding.
#[tokio::test]
async fn write_then_run_with_failure_then_success() {
    let config = Config::default();
    let registry = ChannelRegistry::new();
    let correlator = Correlator::new();
    let mut rx = connected_client(&registry, "client-1").await;
    let dispatcher = Dispatcher::new(&config, &registry, &correlator);
    let mut task = task_with_tools(&["write-and-run"]);

    let first = dispatcher
        .dispatch(
            &mut task,
            vec![ToolCall {
                tool: "write-and-run".to_string(),
                arguments: json!({"path": "/hello.lua", "content": "prnt('Hi')", "args": []}),
            }],
        )
        .await;
    let (call_id_1, waiter_1) = match first {
        BatchOutcome::WaitingForCommand { call_id, waiter, .. } => (call_id, waiter),
        _ => panic!("expected waiting-for-command"),
    };
    let first_frame = rx.recv().await.unwrap();
    assert!(first_frame.contains("command-call"));

    correlator.resolve("task-1", &call_id_1, CallOutcome::Err("syntax error".to_string())).await;
    let first_result = waiter_1.await.unwrap();
    assert!(matches!(first_result, CallOutcome::Err(_)));
    task.append_history(orchestrator::orchestrator::task::HistoryEntry::user(
        "write-and-run failed: syntax error".to_string(),
    ));

    let second = dispatcher
        .dispatch(
            &mut task,
            vec![ToolCall {
                tool: "write-and-run".to_string(),
                arguments: json!({"path": "/hello.lua", "content": "print('Hi')", "args": []}),
            }],
        )
        .await;
    let (call_id_2, waiter_2) = match second {
        BatchOutcome::WaitingForCommand { call_id, waiter, .. } => (call_id, waiter),
        _ => panic!("expected waiting-for-command"),
    };
    let second_frame = rx.recv().await.unwrap();
    assert!(second_frame.contains("command-call"));

    correlator.resolve("task-1", &call_id_2, CallOutcome::Ok(json!({"output": "Hi"}))).await;
    let second_result = waiter_2.await.unwrap();
    assert!(matches!(second_result, CallOutcome::Ok(_)));

    assert_ne!(call_id_1, call_id_2);
}

/// Scenario 3: ask-user with forbidden phrasing is rejected, not sent.
#[tokio::test]
async fn ask_user_forbidden_phrasing_is_rejected() {
    let config = Config::default();
    let registry = ChannelRegistry::new();
    let correlator = Correlator::new();
    let mut rx = connected_client(&registry, "client-1").await;
    let dispatcher = Dispatcher::new(&config, &registry, &correlator);
    let mut task = task_with_tools(&["ask-user", "write-file"]);

    let outcome = dispatcher
        .dispatch(
            &mut task,
            vec![ToolCall {
                tool: "ask-user".to_string(),
                arguments: json!({"question": "please provide the content of hello.lua"}),
            }],
        )
        .await;

    assert!(matches!(outcome, BatchOutcome::Done));
    assert!(task.history.last().unwrap().content.contains("rejected"));
    assert!(rx.try_recv().is_err(), "no user-question frame should have been sent");

    let next = dispatcher
        .dispatch(
            &mut task,
            vec![ToolCall { tool: "write-file".to_string(), arguments: json!({"path": "/hello.lua", "content": "print('Hi')"}) }],
        )
        .await;
    assert!(matches!(next, BatchOutcome::WaitingForCommand { .. }));
}

/// Scenario 4: duplicate call throttle on the third identical call.
#[tokio::test]
async fn duplicate_call_throttle() {
    let config = Config::default();
    let registry = ChannelRegistry::new();
    let correlator = Correlator::new();
    let mut rx = connected_client(&registry, "client-1").await;
    let dispatcher = Dispatcher::new(&config, &registry, &correlator);
    let mut task = task_with_tools(&["list-dir"]);
    let call = ToolCall { tool: "list-dir".to_string(), arguments: json!({"path": ""}) };

    let first = dispatcher.dispatch(&mut task, vec![call.clone()]).await;
    assert!(matches!(first, BatchOutcome::WaitingForCommand { .. }));
    let call_id = match first {
        BatchOutcome::WaitingForCommand { call_id, .. } => call_id,
        _ => unreachable!(),
    };
    rx.recv().await.unwrap();
    correlator.resolve("task-1", &call_id, CallOutcome::Ok(json!({"entries": []}))).await;

    let second = dispatcher.dispatch(&mut task, vec![call.clone()]).await;
    assert!(matches!(second, BatchOutcome::WaitingForCommand { .. }));
    let call_id_2 = match second {
        BatchOutcome::WaitingForCommand { call_id, .. } => call_id,
        _ => unreachable!(),
    };
    rx.recv().await.unwrap();
    correlator.resolve("task-1", &call_id_2, CallOutcome::Ok(json!({"entries": []}))).await;

    let third = dispatcher.dispatch(&mut task, vec![call]).await;
    assert!(matches!(third, BatchOutcome::Done));
    assert!(task.history.last().unwrap().content.contains("change strategy"));
    assert!(rx.try_recv().is_err(), "no third command-call should have been sent");
}

/// Scenario 5: a remote call that never resolves times out.
#[tokio::test]
async fn remote_timeout() {
    let config = Config::default();
    let registry = ChannelRegistry::new();
    let correlator = Correlator::new();
    let mut rx = connected_client(&registry, "client-1").await;
    let dispatcher = Dispatcher::new(&config, &registry, &correlator);
    let mut task = task_with_tools(&["run-program"]);

    let outcome = dispatcher
        .dispatch(&mut task, vec![ToolCall { tool: "run-program".to_string(), arguments: json!({"path": "/x.lua"}) }])
        .await;
    let (call_id, tool_name, waiter) = match outcome {
        BatchOutcome::WaitingForCommand { call_id, tool_name, waiter } => (call_id, tool_name, waiter),
        _ => panic!("expected waiting-for-command"),
    };
    rx.recv().await.unwrap();

    let result = correlator
        .wait(&task.task_id, &call_id, &tool_name, waiter, tokio::time::Duration::from_millis(20))
        .await;
    assert!(result.is_err());
}

/// Scenario 6: cancellation mid-wait discards a late result.
#[tokio::test]
async fn cancellation_mid_wait_drops_late_result() {
    let correlator = Correlator::new();
    let waiter = correlator.register("task-1", "call-1").await;

    correlator.cancel("task-1", "call-1", CancelReason::ExplicitCancel).await;
    let outcome = waiter.await.unwrap();
    assert!(matches!(outcome, CallOutcome::Cancelled(CancelReason::ExplicitCancel)));

    // A late command-result for the same (task_id, call_id) is dropped silently.
    correlator.resolve("task-1", "call-1", CallOutcome::Ok(json!({"output": "too late"}))).await;
    assert_eq!(correlator.outstanding_count().await, 0);
}
