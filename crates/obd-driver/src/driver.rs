//! Driver Event Loop
//!
//! One task owns the transport, the session and the single in-flight
//! request. Commands, link events, the poll ticker and the two timers
//! (response deadline, reconnect delay) are multiplexed with `select!`, so
//! nothing else ever writes to the adapter.

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::handle::{Command, DriverHandle};
use crate::observer::SnapshotObservers;
use crate::session::{ConnectionSession, ConnectionState, ConnectionStatus, PendingRequest};
use chrono::Utc;
use metrics::counter;
use obd_protocol::{
    codec, init_sequence, Connector, DeviceRef, LinkEvent, Parameter, TelemetryEvent,
    TelemetrySample, Transport, VehicleSnapshot,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct Driver {
    config: DriverConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    samples: mpsc::Sender<TelemetryEvent>,
    snapshot: watch::Sender<VehicleSnapshot>,
    status: watch::Sender<ConnectionStatus>,
    state: watch::Sender<ConnectionState>,
    observers: SnapshotObservers,
    session: Option<ConnectionSession>,
    transport: Option<Transport>,
    queue: VecDeque<Parameter>,
    pending: Option<PendingRequest>,
    polling: bool,
    cycle_active: bool,
    reconnect_at: Option<Instant>,
}

impl Driver {
    /// Start the driver task. Completed poll cycles and flush requests are
    /// sent on `samples`.
    pub fn spawn(
        config: DriverConfig,
        connector: Arc<dyn Connector>,
        samples: mpsc::Sender<TelemetryEvent>,
    ) -> (DriverHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(VehicleSnapshot::default());
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let observers = SnapshotObservers::new();

        let handle = DriverHandle {
            commands: command_tx,
            connector: connector.clone(),
            snapshot: snapshot_rx,
            status: status_rx,
            state: state_rx,
            observers: observers.clone(),
        };

        let driver = Driver {
            config,
            connector,
            commands: command_rx,
            samples,
            snapshot: snapshot_tx,
            status: status_tx,
            state: state_tx,
            observers,
            session: None,
            transport: None,
            queue: VecDeque::new(),
            pending: None,
            polling: false,
            cycle_active: false,
            reconnect_at: None,
        };

        (handle, tokio::spawn(driver.run()))
    }

    async fn run(mut self) {
        info!(
            "Starting protocol driver: {} parameters every {}ms",
            self.config.parameters.len(),
            self.config.poll_interval_ms
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let reconnect_at = self.reconnect_at;
            let can_poll = self.polling
                && !self.cycle_active
                && self.current_state() == ConnectionState::Idle;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = next_event(self.transport.as_mut()) => self.handle_link_event(event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.abandon_pending().await;
                }
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.attempt_reconnect().await;
                }
                _ = ticker.tick(), if can_poll => self.begin_cycle().await,
            }
        }

        self.close_session().await;
        info!("Protocol driver stopped");
    }

    /// Returns false when the loop should exit
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { device, reply } => {
                let result = self.connect(device).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.close_session().await;
                let _ = reply.send(());
            }
            Command::StartPolling => {
                if !self.polling {
                    info!("Polling started");
                    self.polling = true;
                }
            }
            Command::StopPolling { reply } => {
                self.stop_polling().await;
                let _ = reply.send(());
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn connect(&mut self, device: DeviceRef) -> Result<(), DriverError> {
        if self.session.is_some() {
            info!("Replacing current session with {}", device);
            self.close_session().await;
        }

        self.session = Some(ConnectionSession::new(device.clone()));
        self.set_status(ConnectionStatus::Connecting);

        match self.establish(&device).await {
            Ok(()) => {
                if self.config.poll_on_connect {
                    self.polling = true;
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", device, e);
                self.session = None;
                self.set_state(ConnectionState::Disconnected);
                self.set_status(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    /// Open the link and run the init sequence, leaving the session Idle.
    /// The polling flag is untouched, so a reconnect resumes whatever the
    /// session was doing before the link dropped.
    async fn establish(&mut self, device: &DeviceRef) -> Result<(), DriverError> {
        let mut transport = self.connector.connect(device).await?;
        self.set_state(ConnectionState::Initializing);

        for command in init_sequence(self.config.protocol) {
            debug!("Init command {}", command);
            if let Err(e) = transport.write(&codec::encode_command(command)).await {
                transport.disconnect().await;
                return Err(e.into());
            }
            sleep(self.config.init_command_delay()).await;
        }
        transport.drain().await;

        self.transport = Some(transport);
        if let Some(session) = self.session.as_mut() {
            session.reconnect_attempts = 0;
        }
        self.set_state(ConnectionState::Idle);
        self.set_status(ConnectionStatus::Connected);
        info!("Adapter at {} initialized", device);
        Ok(())
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Data(bytes) => {
                let Some(pending) = self.pending.as_mut() else {
                    debug!("Discarding {} unsolicited bytes", bytes.len());
                    return;
                };
                pending.append(&bytes);
                if !pending.is_complete() {
                    return;
                }
                if let Some(pending) = self.pending.take() {
                    self.resolve(pending);
                }
                self.dispatch_next().await;
            }
            LinkEvent::Closed => {
                match self.session.as_ref() {
                    Some(session) => warn!("Link to {} lost", session.device),
                    None => warn!("Link closed without a session"),
                }
                self.begin_reconnect().await;
            }
        }
    }

    fn resolve(&mut self, pending: PendingRequest) {
        let definition = pending.definition();
        match codec::parse(pending.response(), definition) {
            Ok(value) => {
                debug!("{} = {:?}", definition.parameter, value);
                let now = Utc::now();
                let mut changed = false;
                self.snapshot.send_modify(|snapshot| {
                    changed = snapshot.apply(definition.parameter, value, now);
                });
                if changed {
                    let current = self.snapshot.borrow().clone();
                    self.observers.notify(&current);
                }
            }
            Err(e) => {
                counter!("obd_decode_failures_total").increment(1);
                debug!("Reply for {} rejected: {}", definition.parameter, e);
            }
        }
    }

    async fn begin_cycle(&mut self) {
        if self.cycle_active || self.pending.is_some() {
            return;
        }
        self.cycle_active = true;
        self.queue.extend(self.config.parameters.iter().copied());
        debug!("Poll cycle started with {} parameters", self.queue.len());
        self.dispatch_next().await;
    }

    /// Send the next queued request, or finish the cycle when none are left
    async fn dispatch_next(&mut self) {
        while let Some(parameter) = self.queue.pop_front() {
            let Some(transport) = self.transport.as_mut() else {
                self.reset_cycle();
                return;
            };
            let definition = parameter.definition();
            counter!("obd_requests_total").increment(1);
            match transport.write(&codec::encode_request(definition)).await {
                Ok(()) => {
                    let deadline = Instant::now() + self.config.response_timeout();
                    self.pending = Some(PendingRequest::new(definition, deadline));
                    self.set_state(ConnectionState::AwaitingResponse);
                    return;
                }
                Err(e) => warn!("Failed to send request for {}: {}", parameter, e),
            }
        }
        self.complete_cycle();
    }

    fn complete_cycle(&mut self) {
        if !self.cycle_active {
            return;
        }
        self.cycle_active = false;
        self.set_state(ConnectionState::Idle);

        let sample = TelemetrySample::new(Utc::now(), self.snapshot.borrow().clone());
        if let Err(e) = self.samples.try_send(TelemetryEvent::Sample(sample)) {
            warn!("Dropping telemetry sample: {}", e);
        }
    }

    async fn abandon_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            counter!("obd_response_timeouts_total").increment(1);
            warn!(
                "No reply for {} within {}ms, moving on",
                pending.definition().parameter,
                self.config.response_timeout_ms
            );
        }
        self.dispatch_next().await;
    }

    fn reset_cycle(&mut self) {
        self.queue.clear();
        self.pending = None;
        self.cycle_active = false;
    }

    async fn stop_polling(&mut self) {
        if self.polling {
            info!("Polling stopped");
        }
        self.polling = false;
        self.reset_cycle();
        if self.current_state() == ConnectionState::AwaitingResponse {
            self.set_state(ConnectionState::Idle);
        }
        self.request_flush().await;
    }

    async fn begin_reconnect(&mut self) {
        self.reset_cycle();
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        let Some(session) = self.session.as_mut() else {
            self.set_state(ConnectionState::Disconnected);
            self.set_status(ConnectionStatus::Disconnected);
            return;
        };
        session.reconnect_attempts = 0;
        self.set_state(ConnectionState::Reconnecting);
        self.set_status(ConnectionStatus::Connecting);
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay());
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.reconnect_attempts += 1;
        let attempt = session.reconnect_attempts;
        let device = session.device.clone();

        counter!("obd_reconnect_attempts_total").increment(1);
        info!(
            "Reconnect attempt {}/{} to {}",
            attempt, self.config.max_reconnect_attempts, device
        );

        match self.establish(&device).await {
            Ok(()) => info!("Reconnected to {} after {} attempts", device, attempt),
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                if attempt >= self.config.max_reconnect_attempts {
                    error!("Giving up on {} after {} attempts", device, attempt);
                    self.session = None;
                    self.set_state(ConnectionState::Disconnected);
                    self.set_status(ConnectionStatus::Disconnected);
                    self.request_flush().await;
                } else {
                    self.set_state(ConnectionState::Reconnecting);
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay());
                }
            }
        }
    }

    /// Deliberate teardown: never followed by a reconnect
    async fn close_session(&mut self) {
        self.reset_cycle();
        self.reconnect_at = None;
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        let had_session = match self.session.take() {
            Some(session) => {
                info!("Disconnected from {}", session.device);
                true
            }
            None => false,
        };
        self.set_state(ConnectionState::Disconnected);
        self.set_status(ConnectionStatus::Disconnected);
        if had_session {
            self.request_flush().await;
        }
    }

    async fn request_flush(&mut self) {
        if self.samples.send(TelemetryEvent::Flush).await.is_err() {
            warn!("Telemetry consumer is gone, flush skipped");
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Driver state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!("Connection status {:?} -> {:?}", current, status);
            *current = status;
            true
        });
    }
}

async fn next_event(transport: Option<&mut Transport>) -> LinkEvent {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use obd_protocol::transport::{
        SerialSettings, SerialTransport, SimulatedRadio, SimulatorConfig, SIMULATOR_ADDRESS,
    };
    use obd_protocol::{AdapterConnector, DeviceInfo, TransportError, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn test_config() -> DriverConfig {
        DriverConfig {
            init_command_delay_ms: 50,
            ..Default::default()
        }
    }

    fn start(config: DriverConfig) -> (DriverHandle, SimulatedRadio, mpsc::Receiver<TelemetryEvent>) {
        let radio = SimulatedRadio::new(SimulatorConfig::default());
        let connector =
            AdapterConnector::new(SerialSettings::default()).with_radio(Arc::new(radio.clone()));
        let (tx, rx) = mpsc::channel(256);
        let (handle, _task) = Driver::spawn(config, Arc::new(connector), tx);
        (handle, radio, rx)
    }

    fn sim_device() -> DeviceRef {
        DeviceRef::new(TransportKind::Notify, SIMULATOR_ADDRESS)
    }

    async fn next_sample(rx: &mut mpsc::Receiver<TelemetryEvent>) -> TelemetrySample {
        loop {
            match rx.recv().await {
                Some(TelemetryEvent::Sample(sample)) => return sample,
                Some(TelemetryEvent::Flush) => continue,
                None => panic!("driver dropped the sample channel"),
            }
        }
    }

    async fn next_flush(rx: &mut mpsc::Receiver<TelemetryEvent>) {
        loop {
            match rx.recv().await {
                Some(TelemetryEvent::Flush) => return,
                Some(TelemetryEvent::Sample(_)) => continue,
                None => panic!("driver dropped the sample channel"),
            }
        }
    }

    fn polled(radio: &SimulatedRadio) -> usize {
        radio.requests().iter().filter(|r| !r.starts_with("AT")).count()
    }

    async fn wait_for_status(handle: &DriverHandle, status: ConnectionStatus) {
        let mut rx = handle.watch_status();
        rx.wait_for(|s| *s == status).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_runs_init_sequence() {
        let (handle, radio, _rx) = start(test_config());

        handle.connect(sim_device()).await.unwrap();

        assert_eq!(handle.status(), ConnectionStatus::Connected);
        let requests = radio.requests();
        assert_eq!(
            &requests[..6],
            &["ATZ", "ATE0", "ATL0", "ATS0", "ATH0", "ATSP0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cycle_produces_decoded_sample() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();

        let sample = next_sample(&mut rx).await;
        assert_eq!(sample.values.engine_rpm, Some(1726.0));
        assert_eq!(sample.values.vehicle_speed, Some(60.0));
        assert_eq!(sample.values.coolant_temp, Some(90.0));
        assert!(sample.values.control_module_voltage.is_some());
        assert_eq!(handle.snapshot().engine_rpm, Some(1726.0));
        assert_eq!(radio.overlapping_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_request_in_flight_across_cycles() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();

        for _ in 0..3 {
            next_sample(&mut rx).await;
        }

        assert_eq!(radio.overlapping_requests(), 0);
        let polled = radio.requests().iter().filter(|r| !r.starts_with("AT")).count();
        assert!(polled >= 3 * Parameter::default_poll_set().len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_reply_keeps_previous_value() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();

        let first = next_sample(&mut rx).await;
        assert_eq!(first.values.coolant_temp, Some(90.0));

        radio.respond_with(Parameter::CoolantTemp, "7F0112\r\r>");
        radio.update(|c| c.engine_rpm = 2000.0);

        let second = next_sample(&mut rx).await;
        assert_eq!(second.values.coolant_temp, Some(90.0));
        assert_eq!(second.values.engine_rpm, Some(2000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_parameter_times_out_and_cycle_continues() {
        let (handle, radio, mut rx) = start(test_config());
        radio.silence(Parameter::VehicleSpeed);
        handle.connect(sim_device()).await.unwrap();

        let started = Instant::now();
        let sample = next_sample(&mut rx).await;

        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(sample.values.vehicle_speed, None);
        assert_eq!(sample.values.engine_rpm, Some(1726.0));
        assert_eq!(sample.values.long_fuel_trim.map(|v| v.round()), Some(-2.0));
        assert_eq!(radio.overlapping_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_waits_for_start_when_not_automatic() {
        let config = DriverConfig {
            poll_on_connect: false,
            ..test_config()
        };
        let (handle, radio, mut rx) = start(config);
        handle.connect(sim_device()).await.unwrap();

        assert!(timeout(Duration::from_secs(5), rx.recv()).await.is_err());
        assert!(radio.requests().iter().all(|r| r.starts_with("AT")));

        handle.start_polling().await.unwrap();
        let sample = next_sample(&mut rx).await;
        assert!(sample.values.engine_rpm.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_polling_flushes_and_goes_quiet() {
        let (handle, _radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();
        next_sample(&mut rx).await;

        handle.stop_polling().await.unwrap();
        next_flush(&mut rx).await;

        assert!(timeout(Duration::from_secs(5), rx.recv()).await.is_err());
        assert_eq!(handle.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_never_reconnects() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();

        handle.disconnect().await.unwrap();
        next_flush(&mut rx).await;
        sleep(Duration::from_secs(30)).await;

        assert_eq!(handle.status(), ConnectionStatus::Disconnected);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(radio.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_drop_reconnects_after_delay() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();
        next_sample(&mut rx).await;

        let dropped_at = Instant::now();
        radio.drop_link();
        wait_for_status(&handle, ConnectionStatus::Connecting).await;
        wait_for_status(&handle, ConnectionStatus::Connected).await;

        assert!(dropped_at.elapsed() >= Duration::from_secs(3));
        assert_eq!(radio.connect_count(), 2);

        let sample = next_sample(&mut rx).await;
        assert!(sample.values.engine_rpm.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_five_attempts() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();

        let dropped_at = Instant::now();
        radio.fail_next_connects(10);
        radio.drop_link();
        wait_for_status(&handle, ConnectionStatus::Connecting).await;
        wait_for_status(&handle, ConnectionStatus::Disconnected).await;

        assert!(dropped_at.elapsed() >= Duration::from_secs(15));
        assert_eq!(radio.connect_count(), 1 + 5);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        next_flush(&mut rx).await;

        sleep(Duration::from_secs(30)).await;
        assert_eq!(radio.connect_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_reports_disconnected() {
        let (handle, radio, _rx) = start(test_config());
        radio.fail_next_connects(1);

        let result = handle.connect(sim_device()).await;

        assert!(matches!(result, Err(DriverError::Transport(_))));
        assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_follow_snapshot_changes() {
        let (handle, radio, mut rx) = start(test_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = handle.subscribe(move |snapshot| {
            if snapshot.engine_rpm.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        handle.connect(sim_device()).await.unwrap();
        next_sample(&mut rx).await;
        assert!(calls.load(Ordering::SeqCst) > 0);

        assert!(handle.unsubscribe(id));
        let seen = calls.load(Ordering::SeqCst);
        radio.update(|c| c.engine_rpm = 3000.0);
        next_sample(&mut rx).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vin_multi_frame_reply_is_assembled() {
        let config = DriverConfig {
            parameters: vec![Parameter::Vin, Parameter::EngineRpm],
            ..test_config()
        };
        let (handle, _radio, mut rx) = start(config);
        handle.connect(sim_device()).await.unwrap();

        let sample = next_sample(&mut rx).await;
        assert_eq!(sample.values.vin.as_deref(), Some("1G1JC5444R7252367"));
        assert_eq!(sample.values.engine_rpm, Some(1726.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_task() {
        let radio = SimulatedRadio::new(SimulatorConfig::default());
        let connector =
            AdapterConnector::new(SerialSettings::default()).with_radio(Arc::new(radio.clone()));
        let (tx, _rx) = mpsc::channel(16);
        let (handle, task) = Driver::spawn(test_config(), Arc::new(connector), tx);

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(
            handle.connect(sim_device()).await,
            Err(DriverError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_polling_stopped() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();
        next_sample(&mut rx).await;

        handle.stop_polling().await.unwrap();
        next_flush(&mut rx).await;
        let polled_before = polled(&radio);

        radio.drop_link();
        wait_for_status(&handle, ConnectionStatus::Connecting).await;
        wait_for_status(&handle, ConnectionStatus::Connected).await;
        sleep(Duration::from_secs(10)).await;

        assert_eq!(radio.connect_count(), 2);
        assert_eq!(polled(&radio), polled_before);
        assert_eq!(handle.state(), ConnectionState::Idle);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, TelemetryEvent::Sample(_)));
        }

        handle.start_polling().await.unwrap();
        let sample = next_sample(&mut rx).await;
        assert!(sample.values.engine_rpm.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_reply_leaves_snapshot_unchanged() {
        let (handle, radio, mut rx) = start(test_config());
        handle.connect(sim_device()).await.unwrap();
        let first = next_sample(&mut rx).await;
        assert_eq!(first.values.engine_rpm, Some(1726.0));

        radio.respond_with(Parameter::EngineRpm, "410C1A\r>");
        radio.update(|c| c.vehicle_speed = 80.0);
        let second = next_sample(&mut rx).await;

        assert_eq!(second.values.engine_rpm, Some(1726.0));
        assert_eq!(second.values.vehicle_speed, Some(80.0));
        assert_eq!(handle.snapshot().engine_rpm, Some(1726.0));
        assert_eq!(radio.overlapping_requests(), 0);
    }

    const SETTLE_DELAY: Duration = Duration::from_millis(200);
    const FIRST_SEGMENT_AT: Duration = Duration::from_millis(100);
    const SECOND_SEGMENT_AT: Duration = Duration::from_millis(300);

    #[derive(Default)]
    struct BenchLog {
        requests: StdMutex<Vec<String>>,
        overlaps: AtomicUsize,
    }

    impl BenchLog {
        fn polled(&self) -> Vec<String> {
            let requests = self.requests.lock().unwrap();
            requests.iter().filter(|r| !r.starts_with("AT")).cloned().collect()
        }
    }

    /// Opens serial transports over an in-memory pipe with a scripted
    /// adapter on the far end
    struct BenchConnector {
        log: Arc<BenchLog>,
    }

    #[async_trait]
    impl Connector for BenchConnector {
        async fn discover(&self, _kind: TransportKind) -> Vec<DeviceInfo> {
            Vec::new()
        }

        async fn connect(&self, device: &DeviceRef) -> Result<Transport, TransportError> {
            let (local, adapter) = duplex(1024);
            tokio::spawn(run_bench_adapter(adapter, self.log.clone()));
            Ok(Transport::Serial(SerialTransport::from_io(
                device.address.clone(),
                local,
                SETTLE_DELAY,
            )))
        }
    }

    /// Coolant temperature never gets an answer
    fn bench_reply(request: &str) -> Option<&'static str> {
        match request {
            "010C" => Some("410C1AF8\r\r>"),
            "010D" => Some("410D3C\r\r>"),
            "0105" => None,
            _ => Some("NO DATA\r\r>"),
        }
    }

    /// AT commands are acknowledged at once. Parameter replies go out in
    /// two writes, the second one after the driver's settle delay, so the
    /// driver has to reassemble them across reads.
    async fn run_bench_adapter(mut io: DuplexStream, log: Arc<BenchLog>) {
        let mut line = Vec::new();
        let mut chunk = [0u8; 64];
        let mut scheduled: VecDeque<(Instant, Vec<u8>)> = VecDeque::new();

        loop {
            let next_write = scheduled.front().map(|(at, _)| *at);
            tokio::select! {
                read = io.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    for &byte in &chunk[..n] {
                        if byte != b'\r' {
                            line.push(byte);
                            continue;
                        }
                        let request = String::from_utf8_lossy(&line).trim().to_string();
                        line.clear();
                        log.requests.lock().unwrap().push(request.clone());

                        if request.starts_with("AT") {
                            if io.write_all(b"OK\r\r>").await.is_err() {
                                return;
                            }
                            continue;
                        }
                        if !scheduled.is_empty() {
                            log.overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        if let Some(reply) = bench_reply(&request) {
                            let (head, tail) = reply.as_bytes().split_at(reply.len() / 2);
                            let now = Instant::now();
                            scheduled.push_back((now + FIRST_SEGMENT_AT, head.to_vec()));
                            scheduled.push_back((now + SECOND_SEGMENT_AT, tail.to_vec()));
                        }
                    }
                }
                _ = sleep_until(next_write.unwrap_or_else(Instant::now)), if next_write.is_some() => {
                    if let Some((_, segment)) = scheduled.pop_front() {
                        if io.write_all(&segment).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_link_settles_reassembles_and_times_out() {
        let log = Arc::new(BenchLog::default());
        let connector = BenchConnector { log: log.clone() };
        let config = DriverConfig {
            parameters: vec![
                Parameter::EngineRpm,
                Parameter::CoolantTemp,
                Parameter::VehicleSpeed,
            ],
            ..test_config()
        };
        let (tx, mut rx) = mpsc::channel(64);
        let (handle, _task) = Driver::spawn(config, Arc::new(connector), tx);

        handle
            .connect(DeviceRef::new(TransportKind::Serial, "/dev/rfcomm0"))
            .await
            .unwrap();
        let started = Instant::now();
        let first = next_sample(&mut rx).await;

        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(first.values.engine_rpm, Some(1726.0));
        assert_eq!(first.values.coolant_temp, None);
        assert_eq!(first.values.vehicle_speed, Some(60.0));

        next_sample(&mut rx).await;
        assert_eq!(log.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(
            &log.polled()[..6],
            &["010C", "0105", "010D", "010C", "0105", "010D"]
        );
    }
}
