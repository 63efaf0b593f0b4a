//! Logging and metrics setup

use crate::config::LoggingConfig;
use crate::AgentError;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<(), AgentError> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| AgentError::Logging(format!("unknown level {}", config.level)))?;

    let result = if config.json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    result.map_err(|e| AgentError::Logging(e.to_string()))
}

/// Install the global Prometheus recorder
pub fn init_metrics() -> Result<PrometheusHandle, AgentError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AgentError::Metrics(e.to_string()))
}
