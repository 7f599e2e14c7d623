//! Proximity session: the public entry point
//!
//! A session owns the registry, the device filter, the GATT server and the
//! two duty-cycle loops. `start` spawns three tasks on the current tokio
//! runtime: a steady tick, the scan role and the advert role. Each role
//! task issues its own radio commands one at a time. Registry and server
//! events are republished to delegates by a single dispatcher task, so
//! delegates see events in registry order.

use crate::config::ProximityConfig;
use crate::device::{
    Device, DeviceAttribute, DeviceFilter, DeviceRegistry, DeviceState, RegistryEvent,
    RegistryEvents, SharedDevice, TargetIdentifier,
};
use crate::payload::{PayloadData, PayloadSupplier};
use crate::transport::ble::advertiser::{AdvertCommand, AdvertLoop};
use crate::transport::ble::beacon::BeaconBuilder;
use crate::transport::ble::codec::SignalMessage;
use crate::transport::ble::connection::{ConnectionDriver, DeviceTask};
use crate::transport::ble::gatt::GattServer;
use crate::transport::ble::radio::{BleRadio, RadioState, ScanFilter, ScanRecord};
use crate::transport::ble::scanner::{ScanCommand, ScanCycleProcessor, ScanLoop, ScanResultBuffer};
use crate::transport::ble::server::{ServerEvent, SignalServer};
use crate::ProximityError;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How long `stop` waits for a role task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Receives proximity events. Every method has an empty default.
#[cfg_attr(test, mockall::automock)]
pub trait SensorDelegate: Send + Sync {
    /// A device was seen for the first time
    fn did_detect(&self, _device: &Device) {}

    /// A device's identity payload was read or written to us
    fn did_read(&self, _payload: &PayloadData, _device: &Device) {}

    /// A new RSSI sample for a device
    fn did_measure(&self, _rssi: i16, _device: &Device) {}

    /// `device` relayed the payloads of other peers
    fn did_share(&self, _payloads: &[PayloadData], _device: &Device) {}

    /// `device` sent immediate-send data
    fn did_receive(&self, _data: &[u8], _device: &Device) {}

    fn did_delete(&self, _device: &Device) {}

    fn did_update_state(&self, _state: RadioState) {}
}

type Delegates = Arc<RwLock<Vec<Arc<dyn SensorDelegate>>>>;

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct DispatcherInputs {
    registry_events: RegistryEvents,
    server_events: mpsc::UnboundedReceiver<ServerEvent>,
}

struct SessionInner {
    config: RwLock<Arc<ProximityConfig>>,
    filter: RwLock<Arc<DeviceFilter>>,
    radio: Arc<dyn BleRadio>,
    supplier: Arc<dyn PayloadSupplier>,
    registry: DeviceRegistry,
    server: Arc<SignalServer>,
    scan_buffer: ScanResultBuffer,
    delegates: Delegates,
    radio_state: watch::Sender<RadioState>,
    running: Mutex<Option<RunningTasks>>,
    dispatcher: Mutex<Option<DispatcherInputs>>,
}

impl SessionInner {
    fn config(&self) -> Arc<ProximityConfig> {
        self.config.read().clone()
    }

    fn filter(&self) -> Arc<DeviceFilter> {
        self.filter.read().clone()
    }

    fn powered_on(&self) -> bool {
        self.radio_state.borrow().is_powered_on()
    }
}

/// Handle to a proximity session; clones share the session
#[derive(Clone)]
pub struct ProximitySession {
    inner: Arc<SessionInner>,
}

impl ProximitySession {
    pub fn new(
        config: ProximityConfig,
        radio: Arc<dyn BleRadio>,
        supplier: Arc<dyn PayloadSupplier>,
    ) -> Result<Self, ProximityError> {
        config.validate()?;
        let filter = DeviceFilter::new(&config.filter)?;
        let config = Arc::new(config);
        let (registry, registry_events) = DeviceRegistry::new();
        let (server, server_events) =
            SignalServer::new(registry.clone(), supplier.clone(), config.clone());
        let (radio_state, _) = watch::channel(radio.state());

        Ok(Self {
            inner: Arc::new(SessionInner {
                config: RwLock::new(config),
                filter: RwLock::new(Arc::new(filter)),
                radio,
                supplier,
                registry,
                server: Arc::new(server),
                scan_buffer: ScanResultBuffer::new(),
                delegates: Arc::new(RwLock::new(Vec::new())),
                radio_state,
                running: Mutex::new(None),
                dispatcher: Mutex::new(Some(DispatcherInputs {
                    registry_events,
                    server_events,
                })),
            }),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Start scanning and advertising. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), ProximityError> {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return Err(ProximityError::AlreadyRunning);
        }
        info!("Proximity session starting");

        if let Some(inputs) = self.inner.dispatcher.lock().take() {
            tokio::spawn(dispatch(
                inputs,
                self.inner.delegates.clone(),
                self.inner.radio_state.subscribe(),
            ));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tick, tick_rx) = watch::channel(Instant::now());
        let tick_interval = self.inner.config().tick_interval();

        let handles = vec![
            tokio::spawn(run_tick(tick, tick_interval, shutdown_rx.clone())),
            tokio::spawn(run_scan_role(
                self.inner.clone(),
                tick_rx.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_advert_role(self.inner.clone(), tick_rx, shutdown_rx)),
        ];
        *running = Some(RunningTasks { shutdown, handles });
        info!("Proximity session started");
        Ok(())
    }

    /// Stop both roles, tear down radio operations and leave every device
    /// disconnected
    pub async fn stop(&self) -> Result<(), ProximityError> {
        let tasks = self
            .inner
            .running
            .lock()
            .take()
            .ok_or(ProximityError::NotRunning)?;
        info!("Proximity session stopping");

        let _ = tasks.shutdown.send(true);
        for handle in tasks.handles {
            let abort = handle.abort_handle();
            if timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("Role task did not stop in {:?}, aborting", SHUTDOWN_GRACE);
                abort.abort();
            }
        }

        let radio = &self.inner.radio;
        if let Err(e) = radio.stop_scan().await {
            debug!("Stop scan on shutdown: {}", e);
        }
        if let Err(e) = radio.stop_advertising().await {
            debug!("Stop advertising on shutdown: {}", e);
        }
        if let Err(e) = radio.stop_gatt_server().await {
            debug!("Stop GATT server on shutdown: {}", e);
        }
        self.inner.server.set_enabled(false);

        let now = SystemTime::now();
        for device in self.inner.registry.list_all() {
            let connected = device.read().state != DeviceState::Disconnected;
            if !connected {
                continue;
            }
            let identifier = device.identifier();
            let bound = self.inner.config().connect_timeout();
            if timeout(bound, radio.disconnect(&identifier)).await.is_err() {
                warn!("Disconnect from {} timed out on shutdown", identifier);
            }
            device.force_disconnected(now);
        }
        info!("Proximity session stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    // ------------------------------------------------------------------------
    // DELEGATES & RADIO EVENTS
    // ------------------------------------------------------------------------

    pub fn add_delegate(&self, delegate: Arc<dyn SensorDelegate>) {
        self.inner.delegates.write().push(delegate);
    }

    /// Scan result from the radio; buffered until the next processing phase
    pub fn on_scan_result(&self, record: ScanRecord) {
        if !self.is_running() {
            return;
        }
        self.inner.scan_buffer.push(record);
    }

    /// Radio power state change
    pub fn on_radio_state(&self, state: RadioState) {
        let changed = self.inner.radio_state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("Radio state {}", state);
        }
    }

    /// Server-side callbacks for the radio driver
    pub fn gatt_server(&self) -> Arc<dyn GattServer> {
        self.inner.server.clone()
    }

    // ------------------------------------------------------------------------
    // OPERATIONS
    // ------------------------------------------------------------------------

    /// Connect to `target` now and write `data` as an immediate-send
    /// message. Returns whether the write completed. On failure before the
    /// write, or when a connection to `target` is already open, the data
    /// stays queued and goes out on that connection or the next one.
    pub async fn immediate_send(
        &self,
        data: Vec<u8>,
        target: &TargetIdentifier,
    ) -> Result<bool, ProximityError> {
        if !self.is_running() {
            return Err(ProximityError::NotRunning);
        }
        // reject what could never be written
        SignalMessage::ImmediateSend(data.clone()).encode()?;
        let device = self
            .inner
            .registry
            .get(target)
            .ok_or_else(|| ProximityError::UnknownDevice(target.to_string()))?;
        device.modify(|d| d.immediate_send = Some(data));

        let driver = ConnectionDriver::new(
            self.inner.radio.clone(),
            self.inner.registry.clone(),
            self.inner.supplier.clone(),
            self.inner.filter(),
            self.inner.config(),
        );
        let outcome = driver.run(&device).await;
        let sent = outcome.is_success()
            && outcome
                .tasks
                .contains(&DeviceTask::ImmediateSend);
        info!("Immediate send to {}: sent={}", target, sent);
        Ok(sent)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn filter(&self) -> Arc<DeviceFilter> {
        self.inner.filter()
    }

    pub fn config(&self) -> Arc<ProximityConfig> {
        self.inner.config()
    }

    /// Replace the configuration; running loops pick it up on their next
    /// cycle. Training samples survive when the patterns are unchanged.
    pub fn update_config(&self, config: ProximityConfig) -> Result<(), ProximityError> {
        config.validate()?;
        let patterns_changed = self.inner.config().filter != config.filter;
        if patterns_changed {
            let filter = DeviceFilter::new(&config.filter)?;
            *self.inner.filter.write() = Arc::new(filter);
        }
        let config = Arc::new(config);
        self.inner.server.set_config(config.clone());
        *self.inner.config.write() = config;
        info!("Configuration updated");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// TASKS
// ----------------------------------------------------------------------------

async fn run_tick(tick: watch::Sender<Instant>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            now = interval.tick() => {
                if tick.send(now).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Tick stopped");
}

async fn run_scan_role(
    inner: Arc<SessionInner>,
    mut tick: watch::Receiver<Instant>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut scan = ScanLoop::new(&inner.config(), Instant::now());
    let mut processor = ScanCycleProcessor::new(
        inner.registry.clone(),
        inner.radio.clone(),
        inner.supplier.clone(),
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = tick.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *tick.borrow_and_update();
                let config = inner.config();
                scan.apply_config(&config);

                match scan.on_tick(now, inner.powered_on()) {
                    Some(ScanCommand::StartScan) => {
                        let result = inner.radio.start_scan(&ScanFilter::for_config(&config)).await;
                        if let Err(e) = &result {
                            warn!("Start scan failed: {}", e);
                        }
                        scan.on_scan_started(result.is_ok(), Instant::now());
                    }
                    Some(ScanCommand::StopScan) => {
                        let result = inner.radio.stop_scan().await;
                        if let Err(e) = &result {
                            warn!("Stop scan failed: {}", e);
                        }
                        scan.on_scan_stopped(result.is_ok(), Instant::now());
                    }
                    Some(ScanCommand::Process) => {
                        let records = inner.scan_buffer.drain();
                        let filter = inner.filter();
                        processor.process(records, &config, &filter).await;
                        scan.on_processed(Instant::now());
                    }
                    None => {}
                }
            }
        }
    }
    debug!("Scan role stopped");
}

async fn run_advert_role(
    inner: Arc<SessionInner>,
    mut tick: watch::Receiver<Instant>,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = inner.config();
    let mut advert = AdvertLoop::new(&config, Instant::now());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = tick.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *tick.borrow_and_update();
                let config = inner.config();
                advert.apply_config(&config);

                let transmit = inner.radio.is_transmit_supported();
                match advert.on_tick(now, inner.powered_on(), transmit) {
                    Some(AdvertCommand::Start) => {
                        let success = start_advertising(&inner).await;
                        advert.on_started(success, Instant::now());
                    }
                    Some(AdvertCommand::Stop) => {
                        inner.server.set_enabled(false);
                        let advertising = inner.radio.stop_advertising().await;
                        let server = inner.radio.stop_gatt_server().await;
                        if let Err(e) = &advertising {
                            warn!("Stop advertising failed: {}", e);
                        }
                        if let Err(e) = &server {
                            warn!("Stop GATT server failed: {}", e);
                        }
                        advert.on_stopped(advertising.is_ok() && server.is_ok(), Instant::now());
                    }
                    None => {}
                }
            }
        }
    }
    debug!("Advert role stopped");
}

/// Bring up the GATT server, then advertise a freshly rotated pseudo-address
/// under the current service and manufacturer identifiers
async fn start_advertising(inner: &SessionInner) -> bool {
    let now = SystemTime::now();
    let mut beacon = BeaconBuilder::new(&inner.config());
    beacon.rotate(now);
    let data = match beacon.build(now) {
        Ok(data) => data,
        Err(e) => {
            warn!("Beacon build failed: {}", e);
            return false;
        }
    };

    inner.server.set_enabled(true);
    if let Err(e) = inner.radio.start_gatt_server(&inner.server.services()).await {
        warn!("Start GATT server failed: {}", e);
        inner.server.set_enabled(false);
        return false;
    }
    if let Err(e) = inner.radio.start_advertising(&data).await {
        warn!("Start advertising failed: {}", e);
        inner.server.set_enabled(false);
        return false;
    }
    info!("Advertising pseudo-address {:?}", data.pseudo_address());
    true
}

async fn dispatch(
    mut inputs: DispatcherInputs,
    delegates: Delegates,
    mut radio_state: watch::Receiver<RadioState>,
) {
    let mut radio_open = true;
    loop {
        tokio::select! {
            event = inputs.registry_events.next() => match event {
                Some(event) => publish_registry_event(&delegates, event),
                None => break,
            },
            event = inputs.server_events.recv() => match event {
                Some(event) => publish_server_event(&delegates, event),
                None => break,
            },
            changed = radio_state.changed(), if radio_open => {
                if changed.is_err() {
                    radio_open = false;
                    continue;
                }
                let state = *radio_state.borrow_and_update();
                for delegate in snapshot(&delegates) {
                    delegate.did_update_state(state);
                }
            }
        }
    }
    debug!("Dispatcher stopped");
}

fn snapshot(delegates: &Delegates) -> Vec<Arc<dyn SensorDelegate>> {
    delegates.read().clone()
}

fn publish_registry_event(delegates: &Delegates, event: RegistryEvent) {
    let delegates = snapshot(delegates);
    if delegates.is_empty() {
        return;
    }
    match event {
        RegistryEvent::Created(device) => {
            let device = device.snapshot();
            for delegate in &delegates {
                delegate.did_detect(&device);
            }
        }
        RegistryEvent::Updated(device, DeviceAttribute::Payload) => {
            let device = device.snapshot();
            if let Some(payload) = &device.payload {
                for delegate in &delegates {
                    delegate.did_read(payload, &device);
                }
            }
        }
        RegistryEvent::Updated(device, DeviceAttribute::Rssi) => {
            let device = device.snapshot();
            if let Some(rssi) = device.rssi {
                for delegate in &delegates {
                    delegate.did_measure(rssi, &device);
                }
            }
        }
        RegistryEvent::Updated(_, _) => {}
        RegistryEvent::Deleted(device) => {
            let device = device.snapshot();
            for delegate in &delegates {
                delegate.did_delete(&device);
            }
        }
    }
}

fn publish_server_event(delegates: &Delegates, event: ServerEvent) {
    match event {
        ServerEvent::Shared { from, devices } => {
            let payloads: Vec<PayloadData> = devices
                .iter()
                .filter_map(|d: &SharedDevice| d.read().payload.clone())
                .collect();
            let from = from.snapshot();
            for delegate in snapshot(delegates) {
                delegate.did_share(&payloads, &from);
            }
        }
        ServerEvent::Received { from, data } => {
            let from = from.snapshot();
            for delegate in snapshot(delegates) {
                delegate.did_receive(&data, &from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::FixedLengthPayloadSupplier;
    use crate::transport::ble::simulated::{RadioCall, SimulatedRadio};

    fn session() -> (ProximitySession, Arc<SimulatedRadio>) {
        let radio = Arc::new(SimulatedRadio::new(ProximityConfig::default()));
        let supplier = Arc::new(FixedLengthPayloadSupplier::from_seed(7, 16));
        let session = ProximitySession::new(ProximityConfig::default(), radio.clone(), supplier)
            .expect("session");
        (session, radio)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ProximityConfig::default();
        config.connection.android_write_chunk_bytes = 0;
        let radio = Arc::new(SimulatedRadio::new(ProximityConfig::default()));
        let supplier = Arc::new(FixedLengthPayloadSupplier::from_seed(7, 16));
        assert!(matches!(
            ProximitySession::new(config, radio, supplier),
            Err(ProximityError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_rejected() {
        let (session, _radio) = session();
        session.start().expect("start");
        assert!(matches!(session.start(), Err(ProximityError::AlreadyRunning)));
        session.stop().await.expect("stop");
        assert!(matches!(session.stop().await, Err(ProximityError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertising_starts_after_off_gap() {
        let (session, radio) = session();
        session.start().expect("start");
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert_eq!(radio.count(|c| matches!(c, RadioCall::StartGattServer(1))), 1);
        assert_eq!(radio.count(|c| matches!(c, RadioCall::StartAdvertising(_))), 1);
        assert!(session.gatt_server().is_enabled());
        session.stop().await.expect("stop");
        assert!(!session.gatt_server().is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_state_reaches_delegate() {
        let (session, _radio) = session();
        let mut delegate = MockSensorDelegate::new();
        delegate
            .expect_did_update_state()
            .withf(|state| *state == RadioState::PoweredOff)
            .times(1)
            .return_const(());
        session.add_delegate(Arc::new(delegate));
        session.start().expect("start");

        session.on_radio_state(RadioState::PoweredOff);
        session.on_radio_state(RadioState::PoweredOff);
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_send_requires_known_device() {
        let (session, _radio) = session();
        let target = TargetIdentifier::from("nobody");
        assert!(matches!(
            session.immediate_send(vec![1], &target).await,
            Err(ProximityError::NotRunning)
        ));
        session.start().expect("start");
        assert!(matches!(
            session.immediate_send(vec![1], &target).await,
            Err(ProximityError::UnknownDevice(_))
        ));
        session.stop().await.expect("stop");
    }

    #[test]
    fn test_update_config_keeps_filter_when_patterns_unchanged() {
        let (session, _radio) = session();
        let before = session.filter();
        let mut config = ProximityConfig::default();
        config.device_expiry_secs = 60;
        session.update_config(config).expect("update");
        assert!(Arc::ptr_eq(&before, &session.filter()));
        assert_eq!(session.config().device_expiry_secs, 60);

        let mut config = ProximityConfig::default();
        config.filter.patterns.push("^FF".to_string());
        session.update_config(config).expect("update");
        assert!(!Arc::ptr_eq(&before, &session.filter()));
    }
}
