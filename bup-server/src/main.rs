use bup_server::config::AppConfig;
use bup_server::services::archive::BupTool;
use bup_server::state::AppState;
use bup_server::utils::logger;
use bup_server::{routes, start_engine};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    logger::init(&config.log_level)?;
    tracing::info!("Starting bup server on port {}", config.port);

    config.check_paths()?;

    let tool = Arc::new(BupTool::from_config(&config));
    let state = Arc::new(AppState::new(config.clone(), tool));

    let cancel = CancellationToken::new();
    let scheduler = match start_engine(&state, cancel.clone()).await {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!("Failed to start scheduler: {}", e);
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    if let Err(e) = state.store.flush().await {
        tracing::error!("Failed to write config: {:#}", e);
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
