//! Maps client identifiers to active connections (§4.1).
//!
//! Grounded in the source system's `websocket_manager.py` (`connections: Dict[str, WebSocket]`,
//! `connect`/`disconnect`/`send_to_client`/`is_connected`), but with a bounded
//! per-client outbound queue so a slow receiver never blocks a sender, per §5's
//! backpressure requirement. The registry itself is an `Arc<RwLock<HashMap<...>>>`,
//! the same shape `mcp_server.rs`'s `UnifiedMcpServer` uses for its tool map.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Outbound handle for one client: a bounded sender into that client's write task.
#[derive(Clone)]
pub struct ClientHandle {
    sender: mpsc::Sender<String>,
}

impl ClientHandle {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        ClientHandle { sender }
    }
}

/// Tracks one active connection per client, serializing outbound frames per client.
#[derive(Default)]
pub struct ChannelRegistry {
    connections: RwLock<HashMap<String, ClientHandle>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry { connections: RwLock::new(HashMap::new()) }
    }

    /// Register a new connection, replacing and implicitly closing any prior one.
    pub async fn connect(&self, client_id: String, handle: ClientHandle) {
        let mut connections = self.connections.write().await;
        if connections.insert(client_id.clone(), handle).is_some() {
            log::info!("client {} reconnected; prior connection replaced", client_id);
        } else {
            log::info!("client {} connected", client_id);
        }
    }

    pub async fn disconnect(&self, client_id: &str) {
        let mut connections = self.connections.write().await;
        if connections.remove(client_id).is_some() {
            log::info!("client {} disconnected", client_id);
        }
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.connections.read().await.contains_key(client_id)
    }

    /// Serialize `frame` to JSON and enqueue it for `client_id`.
    ///
    /// Returns `false` if the client is not connected, serialization fails, or
    /// the per-client outbound queue is full (backpressure) — never blocks.
    pub async fn send<F: Serialize>(&self, client_id: &str, frame: &F) -> bool {
        let handle = match self.connections.read().await.get(client_id).cloned() {
            Some(h) => h,
            None => {
                log::warn!("send to {} failed: not connected", client_id);
                return false;
            }
        };
        let payload = match serde_json::to_string(frame) {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to serialize outbound frame for {}: {}", client_id, e);
                return false;
            }
        };
        match handle.sender.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("outbound queue for {} is full; dropping frame (backpressure)", client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("outbound channel for {} is closed", client_id);
                false
            }
        }
    }

    pub async fn connected_clients(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn connect_then_send_delivers_to_queue() {
        let registry = ChannelRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.connect("client-1".to_string(), ClientHandle::new(tx)).await;
        assert!(registry.is_connected("client-1").await);

        let ok = registry.send("client-1", &json!({"type": "pong"})).await;
        assert!(ok);
        let received = rx.recv().await.unwrap();
        assert!(received.contains("pong"));
    }

    #[tokio::test]
    async fn send_to_unknown_client_returns_false() {
        let registry = ChannelRegistry::new();
        let ok = registry.send("ghost", &json!({"type": "pong"})).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn reconnect_replaces_prior_handle() {
        let registry = ChannelRegistry::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.connect("client-1".to_string(), ClientHandle::new(tx1)).await;
        registry.connect("client-1".to_string(), ClientHandle::new(tx2)).await;

        registry.send("client-1", &json!({"type": "pong"})).await;
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let registry = ChannelRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.connect("client-1".to_string(), ClientHandle::new(tx)).await;
        assert!(registry.send("client-1", &json!({"type": "pong"})).await);
        let ok = registry.send("client-1", &json!({"type": "pong"})).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let registry = ChannelRegistry::new();
        registry.disconnect("never-connected").await;
        registry.disconnect("never-connected").await;
    }
}
