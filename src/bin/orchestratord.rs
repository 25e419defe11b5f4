//! Service entry point: wires up shared state and serves the WebSocket
//! Protocol Surface on `/ws/{client_id}`.

use orchestrator::orchestrator::channel_registry::ChannelRegistry;
use orchestrator::orchestrator::correlator::Correlator;
use orchestrator::orchestrator::server;
use orchestrator::orchestrator::task_store::TaskStore;
use orchestrator::{Config, GraphContext};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let ctx = Arc::new(GraphContext {
        config: Arc::new(Config::default()),
        task_store: Arc::new(TaskStore::new()),
        channel_registry: Arc::new(ChannelRegistry::new()),
        correlator: Arc::new(Correlator::new()),
    });

    let addr: SocketAddr = std::env::var("ORCHESTRATOR_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

    log::info!("starting orchestratord on {}", addr);
    server::serve(addr, ctx).await
}
