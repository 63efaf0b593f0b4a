//! Vehicle Telemetry Agent - Main Entry Point

use anyhow::Context;
use std::path::PathBuf;
use telemetry_agent::{run, telemetry::init_logging, AgentConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TELEMETRY_AGENT_CONFIG").ok())
        .map(PathBuf::from);

    let config = AgentConfig::load(config_path.as_deref()).context("loading configuration")?;
    init_logging(&config.logging).context("initializing logging")?;

    info!("=== Vehicle Telemetry Agent v{} ===", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Configuration from {}", path.display());
    }

    run(config).await.context("agent failed")?;
    Ok(())
}
