use tokio::sync::watch;
use tracing::{error, info};

/// Initialize the fmt subscriber at the given level.
pub fn start_logging(level: tracing::Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Wait for Ctrl-C, then tell the bridge to stop polling.
pub async fn handle_shutdown(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        return;
    }

    info!("midea2mqtt is shutting down...");
    if shutdown.send(true).is_err() {
        error!("Bridge already stopped before the shutdown signal arrived.");
    }
}
