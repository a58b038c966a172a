//! HTTP and WebSocket server command (`appforge serve`).

use anyhow::{Context, Result};
use appforge::config::AppConfig;
use appforge::logging::init_logging;
use tracing::info;

pub async fn cmd_serve(port: Option<u16>, dev: bool) -> Result<()> {
    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(port) = port {
        config.port = port;
    }

    let _guard = init_logging(&config.log_level, config.log_format, config.log_dir.as_deref());
    info!(
        port = config.port,
        database = %config.database_path.display(),
        max_sessions = config.max_concurrent_sessions,
        max_containers = config.max_concurrent_containers,
        dev,
        "starting appforge"
    );

    appforge::server::start_server(config, dev).await
}
