//! The Protocol Surface's transport binding: one WebSocket endpoint per
//! client, `/ws/{client_id}` (§6), built on `axum` the way the reference
//! codebase's `AxumHttpAdapter` builds its own HTTP surface (`Router`,
//! `tokio::net::TcpListener`, `axum::serve`) — generalized here from a
//! request/response tool API to a long-lived bidirectional channel.

use super::channel_registry::ClientHandle;
use super::control_graph::{self, GraphContext};
use super::protocol::{self, InboundFrame, OutboundFrame};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub fn build_router(ctx: Arc<GraphContext>) -> Router {
    Router::new().route("/ws/{client_id}", get(ws_handler)).with_state(ctx)
}

pub async fn serve(addr: SocketAddr, ctx: Arc<GraphContext>) -> std::io::Result<()> {
    let app = build_router(ctx);
    let listener = TcpListener::bind(addr).await?;
    log::info!("orchestrator listening on {}", addr);
    axum::serve(listener, app).await
}

async fn ws_handler(
    Path(client_id): Path<String>,
    State(ctx): State<Arc<GraphContext>>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, ctx))
}

async fn handle_socket(socket: WebSocket, client_id: String, ctx: Arc<GraphContext>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(ctx.config.channel_outbound_queue_capacity);

    ctx.channel_registry.connect(client_id.clone(), ClientHandle::new(tx)).await;

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(axum_ws_text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let raw = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        match protocol::parse_inbound(&raw) {
            Some(frame) => handle_inbound(frame, &client_id, &ctx).await,
            None => continue,
        }
    }

    ctx.channel_registry.disconnect(&client_id).await;
    fail_tasks_on_disconnect(&client_id, &ctx).await;
    writer.abort();
    log::info!("client {} connection closed", client_id);
}

/// A channel disconnect cancels every outstanding waiter owned by a task
/// bound to this client and fails those tasks with `transport-disconnected` (§5).
async fn fail_tasks_on_disconnect(client_id: &str, ctx: &Arc<GraphContext>) {
    for handle in ctx.task_store.tasks_by_client(client_id) {
        let task_id = {
            let task = handle.lock().await;
            if task.status.is_terminal() {
                continue;
            }
            task.task_id.clone()
        };
        ctx.correlator.cancel_all_for_task(&task_id, super::correlator::CancelReason::TransportDisconnected).await;
        ctx.task_store
            .fail(&task_id, super::error::OrchestratorError::TransportDisconnected { client_id: client_id.to_string() }.to_string())
            .await;
    }
}

fn axum_ws_text(payload: String) -> Message {
    Message::Text(payload.into())
}

async fn handle_inbound(frame: InboundFrame, client_id: &str, ctx: &Arc<GraphContext>) {
    match frame {
        InboundFrame::CreateTask { request_id, task_kind, client_id: target, prompt, allowed_tools, .. } => {
            let effective_client = target.unwrap_or_else(|| client_id.to_string());
            let profile = match ctx.config.task_kind(&task_kind) {
                Some(p) => p.clone(),
                None => {
                    let frame = OutboundFrame::TaskFailed {
                        task_id: None,
                        request_id: Some(request_id),
                        error: format!("unknown task kind '{}'", task_kind),
                    };
                    ctx.channel_registry.send(&effective_client, &frame).await;
                    return;
                }
            };

            let tools = allowed_tools.unwrap_or(profile.allowed_tools);
            let handle = ctx.task_store.create(
                task_kind,
                effective_client.clone(),
                prompt,
                tools,
                &profile.system_prompt,
                ctx.config.max_consecutive_errors,
                ctx.config.step_budget,
            );
            let task_id = handle.lock().await.task_id.clone();

            ctx.channel_registry
                .send(
                    &effective_client,
                    &OutboundFrame::TaskCreated { request_id, task_id: task_id.clone(), status: super::task::TaskStatus::Queued },
                )
                .await;

            let graph_ctx = (**ctx).clone();
            tokio::spawn(async move { control_graph::run(handle, graph_ctx).await });
        }
        InboundFrame::CommandResult { task_id, call_id, ok, result, error } => {
            let outcome = if ok {
                super::correlator::CallOutcome::Ok(result.unwrap_or(serde_json::Value::Null))
            } else {
                super::correlator::CallOutcome::Err(error.unwrap_or_default())
            };
            ctx.correlator.resolve(&task_id, &call_id, outcome).await;
        }
        InboundFrame::UserAnswer { task_id, call_id, answer } => {
            let outcome = super::correlator::CallOutcome::Ok(serde_json::json!({"answer": answer}));
            ctx.correlator.resolve(&task_id, &call_id, outcome).await;
        }
        InboundFrame::CancelTask { task_id } => {
            ctx.task_store.set_status(&task_id, super::task::TaskStatus::Cancelled).await;
            ctx.correlator.cancel_all_for_task(&task_id, super::correlator::CancelReason::ExplicitCancel).await;
            if let Some(handle) = ctx.task_store.get(&task_id) {
                let client = handle.lock().await.client_id.clone();
                ctx.channel_registry
                    .send(&client, &OutboundFrame::TaskUpdate { task_id, status: super::task::TaskStatus::Cancelled })
                    .await;
            }
        }
        InboundFrame::Ping => {
            ctx.channel_registry.send(client_id, &OutboundFrame::Pong).await;
        }
    }
}
