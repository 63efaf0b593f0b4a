//! Connectivity monitor
//!
//! Tracks whether the collector is reachable and replays the offline queue
//! each time connectivity comes back. All state changes funnel through one
//! task, so two replays never run at once.

use crate::config::NetworkConfig;
use crate::uploader::Uploader;
use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Active reachability check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Reachable when a TCP connection to the address succeeds in time
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// `host:port` of an http(s) URL, with the scheme's default port
    pub fn address_for_url(url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(format!("{}:{}", host, port))
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn check(&self) -> bool {
        match timeout(self.timeout, TcpStream::connect(self.address.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", self.address, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out", self.address);
                false
            }
        }
    }
}

/// Feeds connectivity changes from outside (OS callbacks, the agent API)
#[derive(Clone)]
pub struct ConnectivityReporter {
    reports: mpsc::Sender<bool>,
    online: watch::Receiver<bool>,
}

impl ConnectivityReporter {
    pub async fn report(&self, online: bool) {
        if self.reports.send(online).await.is_err() {
            warn!("Network monitor has stopped, report ignored");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }
}

pub struct NetworkMonitor {
    config: NetworkConfig,
    online: watch::Sender<bool>,
    reports_tx: mpsc::Sender<bool>,
    reports_rx: mpsc::Receiver<bool>,
}

impl NetworkMonitor {
    pub fn new(config: NetworkConfig) -> Self {
        let (online, _) = watch::channel(config.initially_online);
        let (reports_tx, reports_rx) = mpsc::channel(16);
        Self {
            config,
            online,
            reports_tx,
            reports_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn reporter(&self) -> ConnectivityReporter {
        ConnectivityReporter {
            reports: self.reports_tx.clone(),
            online: self.online.subscribe(),
        }
    }

    /// Start the monitor task. Queued batches left from an earlier run are
    /// replayed right away when starting online.
    pub fn spawn(
        self,
        uploader: Uploader,
        probe: Option<Arc<dyn ConnectivityProbe>>,
    ) -> JoinHandle<()> {
        let NetworkMonitor {
            config,
            online,
            reports_tx,
            mut reports_rx,
        } = self;
        drop(reports_tx);

        tokio::spawn(async move {
            info!("Starting network monitor (online: {})", *online.borrow());
            if *online.borrow() {
                uploader.replay_offline().await;
            }

            let mut ticker = interval(config.probe_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reports_open = true;

            loop {
                tokio::select! {
                    report = reports_rx.recv(), if reports_open => match report {
                        Some(state) => apply(&online, state, &uploader).await,
                        None => {
                            reports_open = false;
                            if probe.is_none() {
                                break;
                            }
                        }
                    },
                    _ = ticker.tick(), if probe.is_some() => {
                        if let Some(probe) = &probe {
                            let state = probe.check().await;
                            apply(&online, state, &uploader).await;
                        }
                    }
                }
            }
            info!("Network monitor stopped");
        })
    }
}

async fn apply(online: &watch::Sender<bool>, state: bool, uploader: &Uploader) {
    let was_online = online.send_replace(state);
    if was_online == state {
        return;
    }
    if state {
        info!("Connectivity restored, replaying offline queue");
        uploader.replay_offline().await;
    } else {
        warn!("Connectivity lost, uploads will be queued");
    }
}
