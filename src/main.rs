mod appliance;
mod bridge;
mod config;
mod driver;
mod models;
mod mqtt_service;
mod registry;
mod service_utils;
#[cfg(test)]
mod test_support;

use crate::bridge::{select_connector, Bridge, StartupError};
use crate::config::Config;
use crate::service_utils::{handle_shutdown, start_logging};
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};

const VERSION: &str = concat!("Midea2MQTT v", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration before logging so its log level applies
    let config_path = Config::path_from_env();
    let config = Config::from_file(&config_path);
    start_logging(
        config
            .as_ref()
            .map(Config::log_level)
            .unwrap_or(tracing::Level::INFO),
    );
    info!("{}", VERSION);

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", StartupError::from(e));
            return ExitCode::FAILURE;
        }
    };
    info!("Configuration loaded from {}", config_path.display());

    let connector = match select_connector(&config) {
        Ok(connector) => connector,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let bridge = match Bridge::start(&config, connector).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(handle_shutdown(shutdown_tx));

    bridge.run(shutdown_rx).await;
    info!("All services shut down successfully.");
    ExitCode::SUCCESS
}
