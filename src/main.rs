use idempotency_guard::api::{create_router, AppState};
use idempotency_guard::config::Settings;
use idempotency_guard::idempotency::build_guard;
use idempotency_guard::observability::{init_logging, init_metrics, LogConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::new()?;

    init_logging(&LogConfig::from(&settings.application))?;
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;
    let guard = build_guard(&settings)?;

    let state = AppState::new(guard).with_metrics(metrics_handle);
    let app = create_router(state);

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
