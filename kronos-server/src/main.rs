mod routes;
mod state;

use anyhow::Result;
use kronos_core::EngineConfig;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::load()?;
    let bind = config.server.bind.clone();

    let state = AppState::new(config)?;
    let tasks = state.engine.start()?;
    let app = routes::app(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("kronos-server listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
