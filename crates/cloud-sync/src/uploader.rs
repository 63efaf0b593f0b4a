//! Batch uploader with offline fallback

use crate::buffer::TelemetryBuffer;
use crate::collector::Collector;
use crate::config::UploadConfig;
use crate::payload::TelemetryBatch;
use crate::UploadError;
use metrics::counter;
use obd_protocol::{TelemetryEvent, TelemetrySample};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use storage::{OfflineStore, UploadRequest};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// What became of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    /// Acknowledged by the collector
    Uploaded,
    /// Written to the offline queue
    Queued,
    /// Offline queue write failed, samples kept in memory
    Retained,
    /// No vehicle bound, samples discarded
    Dropped,
    /// Nothing to send
    Empty,
}

impl UploadOutcome {
    fn label(self) -> &'static str {
        match self {
            UploadOutcome::Uploaded => "uploaded",
            UploadOutcome::Queued => "queued",
            UploadOutcome::Retained => "retained",
            UploadOutcome::Dropped => "dropped",
            UploadOutcome::Empty => "empty",
        }
    }
}

/// Result of one pass over the offline queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub delivered: usize,
    pub remaining: u64,
}

/// Buffered samples and the length that triggers the next upload
struct Batching {
    buffer: TelemetryBuffer,
    upload_at: usize,
}

struct Inner {
    config: UploadConfig,
    collector: Arc<dyn Collector>,
    store: OfflineStore,
    online: watch::Receiver<bool>,
    vehicle_id: RwLock<Option<String>>,
    /// Guards the buffer and every offline queue mutation
    batching: Mutex<Batching>,
}

/// Buffers samples and uploads them in batches. Cheap to clone.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

impl Uploader {
    pub fn new(
        config: UploadConfig,
        collector: Arc<dyn Collector>,
        store: OfflineStore,
        online: watch::Receiver<bool>,
    ) -> Self {
        let batching = Batching {
            buffer: TelemetryBuffer::new(config.buffer_ceiling),
            upload_at: config.batch_size,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                collector,
                store,
                online,
                vehicle_id: RwLock::new(None),
                batching: Mutex::new(batching),
            }),
        }
    }

    /// Set or clear the vehicle uploads are attributed to
    pub fn bind_vehicle(&self, vehicle_id: Option<String>) {
        match &vehicle_id {
            Some(id) => info!("Uploads bound to vehicle {}", id),
            None => info!("Vehicle binding cleared"),
        }
        *self.inner.vehicle_id.write().unwrap_or_else(PoisonError::into_inner) = vehicle_id;
    }

    pub fn vehicle_id(&self) -> Option<String> {
        self.inner.vehicle_id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn buffered(&self) -> usize {
        self.inner.batching.lock().await.buffer.len()
    }

    pub async fn queued(&self) -> u64 {
        match self.inner.store.len().await {
            Ok(len) => len,
            Err(e) => {
                warn!("Could not read offline queue length: {}", e);
                0
            }
        }
    }

    /// Buffer one sample, uploading when the batch size is reached
    pub async fn ingest(&self, sample: TelemetrySample) -> Option<UploadOutcome> {
        let mut batching = self.inner.batching.lock().await;
        if batching.buffer.push(sample) > 0 {
            batching.upload_at = self.inner.config.batch_size;
        }
        if batching.buffer.len() < batching.upload_at {
            return None;
        }
        Some(self.upload(&mut batching).await)
    }

    /// Upload whatever is buffered now
    pub async fn flush(&self) -> UploadOutcome {
        let mut batching = self.inner.batching.lock().await;
        if batching.buffer.is_empty() {
            return UploadOutcome::Empty;
        }
        self.upload(&mut batching).await
    }

    async fn upload(&self, batching: &mut Batching) -> UploadOutcome {
        let samples = batching.buffer.take();
        let outcome = self.deliver(&samples).await;
        batching.upload_at = self.inner.config.batch_size;
        if outcome == UploadOutcome::Retained {
            batching.buffer.restore(samples);
            // Retained samples wait for one more batch or an explicit flush
            batching.upload_at = batching.buffer.len() + self.inner.config.batch_size;
        }
        counter!("telemetry_batches_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn deliver(&self, samples: &[TelemetrySample]) -> UploadOutcome {
        let vehicle_id = match self.vehicle_id().ok_or(UploadError::NoVehicle) {
            Ok(id) => id,
            Err(e) => {
                warn!("Dropping {} samples: {}", samples.len(), e);
                return UploadOutcome::Dropped;
            }
        };

        let request = match TelemetryBatch::new(&vehicle_id, samples).to_request() {
            Ok(request) => request,
            Err(e) => {
                error!("Could not serialize batch, dropping it: {}", e);
                return UploadOutcome::Dropped;
            }
        };

        match self.send(&request).await {
            Ok(()) => {
                info!("Uploaded {} samples for {}", samples.len(), vehicle_id);
                return UploadOutcome::Uploaded;
            }
            Err(UploadError::Offline) => debug!("Offline, queueing {} samples", samples.len()),
            Err(e) => warn!("Upload of {} samples failed, queueing: {}", samples.len(), e),
        }

        match self.inner.store.enqueue(&request).await {
            Ok(id) => {
                info!("Queued batch {} with {} samples for later", id, samples.len());
                UploadOutcome::Queued
            }
            Err(e) => {
                error!("Could not persist batch, keeping it in memory: {}", e);
                UploadOutcome::Retained
            }
        }
    }

    async fn send(&self, request: &UploadRequest) -> Result<(), UploadError> {
        if !*self.inner.online.borrow() {
            return Err(UploadError::Offline);
        }
        self.inner.collector.send(request).await
    }

    /// Send queued batches oldest first, stopping at the first failure.
    /// Holds the buffer lock so flushes cannot interleave.
    pub async fn replay_offline(&self) -> ReplayReport {
        let _guard = self.inner.batching.lock().await;
        let store = &self.inner.store;
        let mut report = ReplayReport::default();

        loop {
            let entry = match store.peek_oldest().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("Could not read offline queue: {}", e);
                    break;
                }
            };

            if let Err(e) = self.send(&entry.request).await {
                if matches!(e, UploadError::Offline) {
                    debug!("Went offline during replay");
                    break;
                }
                warn!("Replay of batch {} failed, halting: {}", entry.id, e);
                if let Err(e) = store.record_failure(entry.id).await {
                    error!("Could not record replay failure: {}", e);
                }
                break;
            }

            match store.remove(entry.id).await {
                Ok(_) => {
                    report.delivered += 1;
                    counter!("telemetry_replayed_total").increment(1);
                }
                Err(e) => {
                    error!("Delivered batch {} but could not remove it: {}", entry.id, e);
                    break;
                }
            }
        }

        report.remaining = store.len().await.unwrap_or_default();
        if report.delivered > 0 || report.remaining > 0 {
            info!(
                "Offline replay delivered {} batches, {} remaining",
                report.delivered, report.remaining
            );
        }
        report
    }

    /// Consume driver events until the sender side closes
    pub async fn run(self, mut events: mpsc::Receiver<TelemetryEvent>) {
        info!("Starting telemetry uploader");
        while let Some(event) = events.recv().await {
            match event {
                TelemetryEvent::Sample(sample) => {
                    self.ingest(sample).await;
                }
                TelemetryEvent::Flush => {
                    let outcome = self.flush().await;
                    debug!("Flush finished: {:?}", outcome);
                }
            }
        }
        self.flush().await;
        info!("Telemetry uploader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use obd_protocol::VehicleSnapshot;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeCollector {
        sent: StdMutex<Vec<UploadRequest>>,
        /// Fail every call whose 1-based index is listed
        failing_calls: StdMutex<Vec<usize>>,
        calls: StdMutex<usize>,
    }

    impl FakeCollector {
        fn sent(&self) -> Vec<UploadRequest> {
            self.sent.lock().unwrap().clone()
        }

        fn fail_calls(&self, calls: &[usize]) {
            *self.failing_calls.lock().unwrap() = calls.to_vec();
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Collector for FakeCollector {
        async fn send(&self, request: &UploadRequest) -> Result<(), UploadError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if self.failing_calls.lock().unwrap().contains(&call) {
                return Err(UploadError::Rejected { status: 500 });
            }
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    struct Fixture {
        uploader: Uploader,
        collector: Arc<FakeCollector>,
        store: OfflineStore,
        online: watch::Sender<bool>,
    }

    async fn fixture(config: UploadConfig) -> Fixture {
        let collector = Arc::new(FakeCollector::default());
        let store = OfflineStore::in_memory().await.unwrap();
        let (online, online_rx) = watch::channel(true);
        let uploader = Uploader::new(config, collector.clone(), store.clone(), online_rx);
        uploader.bind_vehicle(Some("VIN1".to_string()));
        Fixture {
            uploader,
            collector,
            store,
            online,
        }
    }

    fn sample() -> TelemetrySample {
        let values = VehicleSnapshot {
            engine_rpm: Some(800.0),
            ..Default::default()
        };
        TelemetrySample::new(Utc::now(), values)
    }

    async fn fill(uploader: &Uploader, count: usize) -> Vec<UploadOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..count {
            if let Some(outcome) = uploader.ingest(sample()).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    #[tokio::test]
    async fn test_uploads_once_at_batch_size() {
        let f = fixture(UploadConfig::default()).await;

        assert!(fill(&f.uploader, 179).await.is_empty());
        assert!(f.collector.sent().is_empty());

        assert_eq!(fill(&f.uploader, 1).await, vec![UploadOutcome::Uploaded]);
        let sent = f.collector.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint, "/vehicles/VIN1/telemetry");
        let body: serde_json::Value = serde_json::from_str(&sent[0].body).unwrap();
        assert_eq!(body["items"].as_array().unwrap().len(), 180);
        assert_eq!(f.uploader.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_offline_batch_goes_to_store() {
        let f = fixture(UploadConfig::default()).await;
        f.online.send_replace(false);

        assert_eq!(fill(&f.uploader, 180).await, vec![UploadOutcome::Queued]);

        assert!(f.collector.sent().is_empty());
        assert_eq!(f.store.len().await.unwrap(), 1);
        assert_eq!(f.uploader.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_failed_upload_falls_back_to_store() {
        let f = fixture(UploadConfig::default()).await;
        f.collector.fail_calls(&[1]);

        assert_eq!(fill(&f.uploader, 180).await, vec![UploadOutcome::Queued]);
        assert_eq!(f.store.len().await.unwrap(), 1);
        assert_eq!(f.uploader.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_unbound_vehicle_drops_batch() {
        let f = fixture(UploadConfig::default()).await;
        f.uploader.bind_vehicle(None);

        assert_eq!(fill(&f.uploader, 180).await, vec![UploadOutcome::Dropped]);
        assert!(f.collector.sent().is_empty());
        assert_eq!(f.store.len().await.unwrap(), 0);
        assert_eq!(f.uploader.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_samples() {
        let f = fixture(UploadConfig::default()).await;
        f.online.send_replace(false);
        f.store.close().await;

        assert_eq!(fill(&f.uploader, 180).await, vec![UploadOutcome::Retained]);
        assert_eq!(f.uploader.buffered().await, 180);
    }

    #[tokio::test]
    async fn test_retained_batch_waits_for_next_boundary() {
        let f = fixture(UploadConfig::default()).await;
        f.collector.fail_calls(&[1, 2, 3]);
        f.store.close().await;

        assert_eq!(fill(&f.uploader, 190).await, vec![UploadOutcome::Retained]);
        assert_eq!(f.collector.calls(), 1);
        assert_eq!(f.uploader.buffered().await, 190);

        assert_eq!(fill(&f.uploader, 170).await, vec![UploadOutcome::Retained]);
        assert_eq!(f.collector.calls(), 2);
        assert_eq!(f.uploader.buffered().await, 360);

        assert_eq!(f.uploader.flush().await, UploadOutcome::Retained);
        assert_eq!(f.collector.calls(), 3);

        assert_eq!(f.uploader.flush().await, UploadOutcome::Uploaded);
        assert_eq!(f.uploader.buffered().await, 0);
        assert!(fill(&f.uploader, 179).await.is_empty());
        assert_eq!(fill(&f.uploader, 1).await, vec![UploadOutcome::Uploaded]);
    }

    #[tokio::test]
    async fn test_buffer_ceiling_clears_wholesale() {
        let config = UploadConfig {
            batch_size: 5000,
            buffer_ceiling: 1000,
            ..Default::default()
        };
        let f = fixture(config).await;

        fill(&f.uploader, 1000).await;
        assert_eq!(f.uploader.buffered().await, 1000);
        fill(&f.uploader, 1).await;
        assert_eq!(f.uploader.buffered().await, 1);
    }

    #[tokio::test]
    async fn test_flush_sends_partial_batch() {
        let f = fixture(UploadConfig::default()).await;
        assert_eq!(f.uploader.flush().await, UploadOutcome::Empty);

        fill(&f.uploader, 3).await;
        assert_eq!(f.uploader.flush().await, UploadOutcome::Uploaded);
        assert_eq!(f.collector.sent().len(), 1);
        assert_eq!(f.uploader.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_replay_is_fifo_and_halts_on_failure() {
        let f = fixture(UploadConfig::default()).await;
        f.online.send_replace(false);
        for _ in 0..3 {
            fill(&f.uploader, 2).await;
            f.uploader.flush().await;
        }
        assert_eq!(f.store.len().await.unwrap(), 3);
        let first = f.store.peek_oldest().await.unwrap().unwrap();

        f.online.send_replace(true);
        f.collector.fail_calls(&[2]);
        let report = f.uploader.replay_offline().await;

        assert_eq!(report, ReplayReport { delivered: 1, remaining: 2 });
        assert_eq!(f.collector.sent()[0].body, first.request.body);
        let head = f.store.peek_oldest().await.unwrap().unwrap();
        assert!(head.id > first.id);
        assert_eq!(head.retry_count, 1);

        let report = f.uploader.replay_offline().await;
        assert_eq!(report, ReplayReport { delivered: 2, remaining: 0 });
    }

    #[tokio::test]
    async fn test_run_handles_flush_events() {
        let f = fixture(UploadConfig::default()).await;
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(f.uploader.clone().run(rx));

        tx.send(TelemetryEvent::Sample(sample())).await.unwrap();
        tx.send(TelemetryEvent::Sample(sample())).await.unwrap();
        tx.send(TelemetryEvent::Flush).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let sent = f.collector.sent();
        assert_eq!(sent.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&sent[0].body).unwrap();
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
    }
}
