//! Server startup and lifecycle

use crate::{routes, AppState, NodeConfig};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Run the node server
pub async fn run_server(config: NodeConfig) -> anyhow::Result<()> {
    run_server_with_shutdown(config, std::future::pending()).await
}

/// Run server with graceful shutdown
pub async fn run_server_with_shutdown(
    config: NodeConfig,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let state = Arc::new(AppState::new(config).await?);
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, state, shutdown_signal).await
}

/// Serve `state` on an already bound listener
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let name = state.storage.name().to_string();
    let app = routes::create_router(state);

    info!(node = %name, "shardstore node listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!(node = %name, "node shutdown complete");

    Ok(())
}
