//! Vehicle Telemetry Agent
//!
//! Composition root: wires the adapter driver, the uploader, the offline
//! store and the connectivity monitor together and exposes them over a
//! local JSON API.

use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use cloud_sync::{
    ConnectivityProbe, ConnectivityReporter, HttpCollector, NetworkMonitor, TcpProbe, Uploader,
};
use metrics_exporter_prometheus::PrometheusHandle;
use obd_driver::{ConnectionStatus, Driver, DriverError, DriverHandle};
use obd_protocol::transport::SimulatedRadio;
use obd_protocol::{AdapterConnector, DeviceRef, TransportKind};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use storage::{DeviceRecord, OfflineStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub mod config;
mod error;
mod routes;
pub mod telemetry;

pub use crate::config::AgentConfig;
pub use error::AgentError;

/// Application state shared across handlers
pub struct AppState {
    pub driver: DriverHandle,
    pub uploader: Uploader,
    pub network: ConnectivityReporter,
    pub store: OfflineStore,
    /// Present when the Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
    pub version: String,
    pub start_time: Instant,
}

impl AppState {
    /// Connect and remember the device for the next launch
    pub async fn connect_device(
        &self,
        device: DeviceRef,
        name: Option<String>,
    ) -> Result<(), DriverError> {
        self.driver.connect(device.clone()).await?;

        let mut record = DeviceRecord::new(device.kind.to_string(), device.address);
        record.name = name;
        if let Err(e) = self.store.save_last_device(&record).await {
            error!("Could not remember device: {}", e);
        }
        Ok(())
    }

    /// Disconnect and forget the device so the next launch stays idle
    pub async fn disconnect_device(&self) -> Result<(), DriverError> {
        self.driver.disconnect().await?;
        if let Err(e) = self.store.clear_last_device().await {
            error!("Could not forget device: {}", e);
        }
        Ok(())
    }

    /// Reconnect to the device used before the last shutdown, if any
    pub async fn reconnect_last_device(&self) -> Result<bool, AgentError> {
        let Some(record) = self.store.last_device().await? else {
            return Ok(false);
        };
        let kind: TransportKind = match record.kind.parse() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Ignoring remembered device: {}", e);
                return Ok(false);
            }
        };

        let device = DeviceRef::new(kind, record.address);
        info!("Reconnecting to last used device {}", device);
        match self.driver.connect(device).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Could not reconnect to last used device: {}", e);
                Ok(false)
            }
        }
    }
}

/// Running agent: shared state plus its background tasks
pub struct Agent {
    pub state: Arc<AppState>,
    driver_task: JoinHandle<()>,
    uploader_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl Agent {
    pub async fn start(
        config: AgentConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, AgentError> {
        let store = OfflineStore::open(&config.storage).await?;

        let monitor = NetworkMonitor::new(config.network.clone());
        let reporter = monitor.reporter();
        let collector = Arc::new(HttpCollector::new(&config.upload)?);
        let uploader = Uploader::new(
            config.upload.clone(),
            collector,
            store.clone(),
            monitor.subscribe(),
        );
        uploader.bind_vehicle(config.vehicle_id.clone());
        let monitor_task = monitor.spawn(uploader.clone(), probe_for(&config));

        let mut connector = AdapterConnector::new(config.serial.clone());
        if config.simulator.enabled {
            info!("Simulated adapter enabled");
            let radio = SimulatedRadio::new(config.simulator.vehicle.clone());
            connector = connector.with_radio(Arc::new(radio));
        }

        let (samples_tx, samples_rx) = mpsc::channel(config.upload.channel_capacity.max(1));
        let (driver, driver_task) = Driver::spawn(config.driver.clone(), Arc::new(connector), samples_tx);
        let uploader_task = tokio::spawn(uploader.clone().run(samples_rx));

        let state = Arc::new(AppState {
            driver,
            uploader,
            network: reporter,
            store,
            metrics,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Instant::now(),
        });

        if config.server.auto_reconnect {
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = state.reconnect_last_device().await {
                    warn!("Relaunch reconnect skipped: {}", e);
                }
            });
        }

        Ok(Self {
            state,
            driver_task,
            uploader_task,
            monitor_task,
        })
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Stop the driver, let the uploader flush what is left and close the store
    pub async fn shutdown(self) {
        if let Err(e) = self.state.driver.shutdown().await {
            warn!("Driver already stopped: {}", e);
        }
        if let Err(e) = self.driver_task.await {
            error!("Driver task failed: {}", e);
        }
        if let Err(e) = self.uploader_task.await {
            error!("Uploader task failed: {}", e);
        }
        self.monitor_task.abort();
        self.state.store.close().await;
        info!("Agent stopped");
    }
}

fn probe_for(config: &AgentConfig) -> Option<Arc<dyn ConnectivityProbe>> {
    if !config.network.probe_enabled {
        return None;
    }
    let address = config
        .network
        .probe_address
        .clone()
        .or_else(|| TcpProbe::address_for_url(&config.upload.base_url));
    match address {
        Some(address) => {
            info!("Probing connectivity via {}", address);
            Some(Arc::new(TcpProbe::new(address, config.network.probe_timeout())))
        }
        None => {
            warn!("No probe address for {}, relying on reports", config.upload.base_url);
            None
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentStatus,
}

/// Component status
#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub adapter: ConnectionStatus,
    pub network_online: bool,
    pub offline_queue: u64,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/snapshot", get(routes::vehicle::get_snapshot))
        .route("/api/v1/status", get(routes::vehicle::get_status))
        .route("/api/v1/vehicle", put(routes::vehicle::put_vehicle))
        .route("/api/v1/devices", get(routes::devices::list_devices))
        .route("/api/v1/connect", post(routes::devices::connect))
        .route("/api/v1/disconnect", post(routes::devices::disconnect))
        .route("/api/v1/polling/start", post(routes::devices::start_polling))
        .route("/api/v1/polling/stop", post(routes::devices::stop_polling))
        .route("/api/v1/network", post(routes::network::report))
        .route("/api/v1/uploads/flush", post(routes::network::flush))
        .route("/metrics", get(routes::network::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        components: ComponentStatus {
            adapter: state.driver.status(),
            network_online: state.network.is_online(),
            offline_queue: state.uploader.queued().await,
        },
    })
}

/// Run the agent until Ctrl-C
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let metrics = if config.server.metrics_enabled {
        Some(telemetry::init_metrics()?)
    } else {
        None
    };

    let agent = Agent::start(config.clone(), metrics).await?;
    let app = agent.router();

    info!("Starting API server on {}", config.server.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    agent.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
