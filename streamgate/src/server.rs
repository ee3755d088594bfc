use anyhow::{Context, Result};
use tracing::info;

use streamgate_api::{create_router, AppState};
use streamgate_core::Config;

/// Bind the listener, serve the proxy router, and clean up on shutdown.
pub async fn run(config: Config) -> Result<()> {
    let address = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config);
    let router = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("HTTP server listening on {address}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down, releasing extractors and sessions");
    state.cleanup().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
