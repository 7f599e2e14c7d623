/// BLE scan duty cycle and scan-cycle processing
///
/// The scan loop alternates between listening, resting and processing:
///
/// ```text
/// processed -> scan_starting -> scan_started -> scan_stopping
///           -> scan_stopped -> processing -> processed
/// ```
///
/// `ScanLoop` is a pure state machine driven by the shared tick and by the
/// radio's start/stop acknowledgements; it only says which command to run
/// next. `ScanCycleProcessor` is the processing phase: it turns buffered
/// scan results into device updates, expires and normalises devices, then
/// runs the connection protocol within the cycle budget.

use super::beacon::BeaconParser;
use super::connection::{ConnectionDriver, ConnectionOutcome, DeviceTask};
use super::radio::{BleRadio, ScanRecord};
use crate::config::ProximityConfig;
use crate::device::classifier::vendor_features;
use crate::device::{
    classify, DeviceFilter, DeviceRegistry, DeviceState, IgnoreBackoff, ScanSignals, SharedDevice,
    TargetIdentifier,
};
use crate::payload::PayloadSupplier;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Scan loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    Processed,
    ScanStarting,
    ScanStarted,
    ScanStopping,
    ScanStopped,
    Processing,
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerState::Processed => write!(f, "processed"),
            ScannerState::ScanStarting => write!(f, "scan_starting"),
            ScannerState::ScanStarted => write!(f, "scan_started"),
            ScannerState::ScanStopping => write!(f, "scan_stopping"),
            ScannerState::ScanStopped => write!(f, "scan_stopped"),
            ScannerState::Processing => write!(f, "processing"),
        }
    }
}

/// Command the scan loop wants executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    StartScan,
    StopScan,
    Process,
}

/// Scan duty-cycle state machine
#[derive(Debug, Clone)]
pub struct ScanLoop {
    state: ScannerState,
    entered_at: Instant,
    scan_on: Duration,
    scan_rest: Duration,
    scan_off: Duration,
}

impl ScanLoop {
    /// Starts in `processed`, as if a cycle just finished
    pub fn new(config: &ProximityConfig, now: Instant) -> Self {
        Self {
            state: ScannerState::Processed,
            entered_at: now,
            scan_on: Duration::from_millis(config.duty_cycle.scan_on_ms),
            scan_rest: Duration::from_millis(config.duty_cycle.scan_rest_ms),
            scan_off: Duration::from_millis(config.duty_cycle.scan_off_ms),
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Pick up new timings; takes effect from the next phase
    pub fn apply_config(&mut self, config: &ProximityConfig) {
        self.scan_on = Duration::from_millis(config.duty_cycle.scan_on_ms);
        self.scan_rest = Duration::from_millis(config.duty_cycle.scan_rest_ms);
        self.scan_off = Duration::from_millis(config.duty_cycle.scan_off_ms);
    }

    fn enter(&mut self, state: ScannerState, now: Instant) {
        debug!("Scan loop {} -> {}", self.state, state);
        self.state = state;
        self.entered_at = now;
    }

    /// Advance on the shared tick
    pub fn on_tick(&mut self, now: Instant, powered_on: bool) -> Option<ScanCommand> {
        let elapsed = now.saturating_duration_since(self.entered_at);
        match self.state {
            ScannerState::Processed if powered_on && elapsed >= self.scan_off => {
                self.enter(ScannerState::ScanStarting, now);
                Some(ScanCommand::StartScan)
            }
            ScannerState::ScanStarted if !powered_on || elapsed >= self.scan_on => {
                self.enter(ScannerState::ScanStopping, now);
                Some(ScanCommand::StopScan)
            }
            ScannerState::ScanStopped if elapsed >= self.scan_rest => {
                self.enter(ScannerState::Processing, now);
                Some(ScanCommand::Process)
            }
            _ => None,
        }
    }

    /// Radio acknowledged a start request. Failure falls back to
    /// `processed` and retries after the off period.
    pub fn on_scan_started(&mut self, success: bool, now: Instant) {
        if self.state != ScannerState::ScanStarting {
            debug!("Ignoring scan start ack in state {}", self.state);
            return;
        }
        if success {
            self.enter(ScannerState::ScanStarted, now);
        } else {
            warn!("Scan start failed, retrying next cycle");
            self.enter(ScannerState::Processed, now);
        }
    }

    /// Radio acknowledged a stop request. Failure keeps the loop in
    /// `scan_started` so the next tick stops again.
    pub fn on_scan_stopped(&mut self, success: bool, now: Instant) {
        if self.state != ScannerState::ScanStopping {
            debug!("Ignoring scan stop ack in state {}", self.state);
            return;
        }
        if success {
            self.enter(ScannerState::ScanStopped, now);
        } else {
            warn!("Scan stop failed");
            self.state = ScannerState::ScanStarted;
        }
    }

    pub fn on_processed(&mut self, now: Instant) {
        if self.state != ScannerState::Processing {
            debug!("Ignoring processed ack in state {}", self.state);
            return;
        }
        self.enter(ScannerState::Processed, now);
    }
}

/// Scan results buffered between processing phases
#[derive(Debug, Default)]
pub struct ScanResultBuffer {
    records: Mutex<Vec<ScanRecord>>,
}

impl ScanResultBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: ScanRecord) {
        self.records.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Take everything buffered, keeping only the latest record per
    /// identifier, in first-seen order
    pub fn drain(&self) -> Vec<ScanRecord> {
        let records = std::mem::take(&mut *self.records.lock());
        let mut order: Vec<TargetIdentifier> = Vec::new();
        let mut latest: HashMap<TargetIdentifier, ScanRecord> = HashMap::new();
        for record in records {
            if !latest.contains_key(&record.identifier) {
                order.push(record.identifier.clone());
            }
            latest.insert(record.identifier.clone(), record);
        }
        order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect()
    }
}

/// Running mean of per-connection cost
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    total: Duration,
    count: u32,
}

impl RunningAverage {
    pub fn record(&mut self, sample: Duration) {
        self.total += sample;
        self.count = self.count.saturating_add(1);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            None
        } else {
            Some(self.total / self.count)
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// What one processing phase did
#[derive(Debug, Default)]
pub struct ProcessingReport {
    pub consumed: usize,
    pub expired: usize,
    pub forced_disconnects: usize,
    pub connections: Vec<ConnectionOutcome>,
    pub skipped_for_budget: usize,
}

/// Processing phase of the scan loop
pub struct ScanCycleProcessor {
    registry: DeviceRegistry,
    radio: Arc<dyn BleRadio>,
    supplier: Arc<dyn PayloadSupplier>,
    cost: RunningAverage,
}

impl ScanCycleProcessor {
    pub fn new(
        registry: DeviceRegistry,
        radio: Arc<dyn BleRadio>,
        supplier: Arc<dyn PayloadSupplier>,
    ) -> Self {
        Self {
            registry,
            radio,
            supplier,
            cost: RunningAverage::default(),
        }
    }

    pub fn average_cost(&self) -> Option<Duration> {
        self.cost.average()
    }

    /// Fold one scan record into the registry and classify the device
    pub fn apply_scan_record(
        &self,
        record: &ScanRecord,
        config: &ProximityConfig,
        filter: &DeviceFilter,
        now: SystemTime,
    ) -> SharedDevice {
        let parser = BeaconParser::new(config);
        let device = match parser.pseudo_address(record) {
            Some(address) => self
                .registry
                .get_or_create_by_pseudo_address(&record.identifier, address),
            None => self.registry.get_or_create_by_session_id(&record.identifier),
        };

        device.modify(|d| {
            d.register_discovery(now);
            d.vendor_features = vendor_features(record, config);
        });
        device.set_rssi(record.rssi, now);
        if let Some(tx_power) = record.tx_power {
            device.set_tx_power(tx_power, now);
        }

        let signals = ScanSignals::from_record(record, config, filter);
        let current = device.read().operating_system;
        if let Some(operating_system) = classify(current, &signals) {
            let backoff = IgnoreBackoff::from(&config.filter);
            device.set_operating_system(operating_system, now, &backoff);
        }
        device
    }

    /// Run one processing phase
    pub async fn process(
        &mut self,
        records: Vec<ScanRecord>,
        config: &Arc<ProximityConfig>,
        filter: &Arc<DeviceFilter>,
    ) -> ProcessingReport {
        let started = Instant::now();
        let now = SystemTime::now();
        let mut report = ProcessingReport {
            consumed: records.len(),
            ..ProcessingReport::default()
        };

        let mut discovered: Vec<SharedDevice> = Vec::new();
        for record in &records {
            let device = self.apply_scan_record(record, config, filter, now);
            if !discovered.iter().any(|d| d.ptr_eq(&device)) {
                discovered.push(device);
            }
        }

        report.expired = self.registry.expire_stale(now, config.device_expiry()).len();
        report.forced_disconnects = self.normalise_connections(config, now);

        let driver = ConnectionDriver::new(
            self.radio.clone(),
            self.registry.clone(),
            self.supplier.clone(),
            filter.clone(),
            config.clone(),
        );
        let budget = config.processing_budget();
        for device in discovered {
            if self.registry.get(&device.identifier()).is_none() {
                continue;
            }
            let task = driver.next_task(&device, SystemTime::now());
            if task == DeviceTask::Nothing {
                continue;
            }

            let spent = started.elapsed();
            let expected = self.cost.average().unwrap_or_default();
            if spent + expected > budget {
                report.skipped_for_budget += 1;
                continue;
            }

            let connection_started = Instant::now();
            let outcome = driver.run(&device).await;
            self.cost.record(connection_started.elapsed());
            report.connections.push(outcome);
        }

        info!(
            "Scan cycle processed: {} results, {} expired, {} forced, {} connections, {} deferred",
            report.consumed,
            report.expired,
            report.forced_disconnects,
            report.connections.len(),
            report.skipped_for_budget
        );
        report
    }

    /// Force devices stuck connected (or connecting) back to disconnected
    pub fn normalise_connections(&self, config: &ProximityConfig, now: SystemTime) -> usize {
        let mut forced = 0;
        for device in self.registry.list_all() {
            let stuck = {
                let d = device.read();
                match d.state {
                    DeviceState::Connected => d
                        .time_since_connected(now)
                        .map_or(true, |t| t > config.stuck_connected()),
                    DeviceState::Connecting => d
                        .last_connect_request_at
                        .map(|t| now.duration_since(t).unwrap_or_default())
                        .map_or(true, |t| t > config.connect_timeout()),
                    DeviceState::Disconnected => false,
                }
            };
            if stuck {
                warn!("Device {} stuck {}, forcing disconnect", device.identifier(), device.read().state);
                device.force_disconnected(now);
                forced += 1;
            }
        }
        forced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceOperatingSystem;
    use crate::payload::FixedLengthPayloadSupplier;
    use crate::transport::ble::advert::ManufacturerData;
    use crate::transport::ble::simulated::SimulatedRadio;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_scan_loop_full_cycle() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut scan = ScanLoop::new(&config, start);

        assert_eq!(scan.on_tick(start + ms(1_000), true), None);
        assert_eq!(scan.on_tick(start + ms(2_000), true), Some(ScanCommand::StartScan));
        assert_eq!(scan.state(), ScannerState::ScanStarting);
        // waits for the ack
        assert_eq!(scan.on_tick(start + ms(10_000), true), None);

        scan.on_scan_started(true, start + ms(2_000));
        assert_eq!(scan.on_tick(start + ms(5_000), true), None);
        assert_eq!(scan.on_tick(start + ms(6_000), true), Some(ScanCommand::StopScan));

        scan.on_scan_stopped(true, start + ms(6_000));
        assert_eq!(scan.on_tick(start + ms(6_500), true), None);
        assert_eq!(scan.on_tick(start + ms(7_000), true), Some(ScanCommand::Process));
        assert_eq!(scan.state(), ScannerState::Processing);

        scan.on_processed(start + ms(8_000));
        assert_eq!(scan.state(), ScannerState::Processed);
    }

    #[test]
    fn test_scan_loop_waits_for_power() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut scan = ScanLoop::new(&config, start);

        assert_eq!(scan.on_tick(start + ms(5_000), false), None);
        assert_eq!(scan.on_tick(start + ms(6_000), true), Some(ScanCommand::StartScan));
    }

    #[test]
    fn test_scan_loop_start_failure_retries() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut scan = ScanLoop::new(&config, start);
        scan.on_tick(start + ms(2_000), true);
        scan.on_scan_started(false, start + ms(2_000));

        assert_eq!(scan.state(), ScannerState::Processed);
        assert_eq!(scan.on_tick(start + ms(3_000), true), None);
        assert_eq!(scan.on_tick(start + ms(4_000), true), Some(ScanCommand::StartScan));
    }

    #[test]
    fn test_scan_loop_stops_on_power_loss() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut scan = ScanLoop::new(&config, start);
        scan.on_tick(start + ms(2_000), true);
        scan.on_scan_started(true, start + ms(2_000));

        assert_eq!(scan.on_tick(start + ms(3_000), false), Some(ScanCommand::StopScan));
        scan.on_scan_stopped(false, start + ms(3_000));
        assert_eq!(scan.state(), ScannerState::ScanStarted);
    }

    #[test]
    fn test_stray_acks_ignored() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut scan = ScanLoop::new(&config, start);
        scan.on_scan_started(true, start);
        scan.on_scan_stopped(true, start);
        scan.on_processed(start);
        assert_eq!(scan.state(), ScannerState::Processed);
    }

    #[test]
    fn test_buffer_keeps_latest_per_device() {
        let buffer = ScanResultBuffer::new();
        buffer.push(ScanRecord::new("a".into(), -80));
        buffer.push(ScanRecord::new("b".into(), -70));
        buffer.push(ScanRecord::new("a".into(), -60));

        let records = buffer.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identifier.as_str(), "a");
        assert_eq!(records[0].rssi, -60);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_running_average() {
        let mut average = RunningAverage::default();
        assert_eq!(average.average(), None);
        average.record(ms(100));
        average.record(ms(300));
        assert_eq!(average.average(), Some(ms(200)));
        assert_eq!(average.count(), 2);
    }

    fn processor() -> (ScanCycleProcessor, DeviceRegistry) {
        let (registry, _events) = DeviceRegistry::new();
        let radio = Arc::new(SimulatedRadio::new(ProximityConfig::default()));
        let supplier = Arc::new(FixedLengthPayloadSupplier::from_seed(1, 16));
        (
            ScanCycleProcessor::new(registry.clone(), radio, supplier),
            registry,
        )
    }

    #[test]
    fn test_apply_scan_record_classifies() {
        let (processor, _registry) = processor();
        let config = ProximityConfig::default();
        let filter = DeviceFilter::new(&config.filter).expect("filter");
        let now = SystemTime::now();

        let mut record = ScanRecord::new("ios".into(), -65);
        record.service_uuids.push(config.service_uuid);
        record.manufacturer_data.push(ManufacturerData {
            manufacturer_id: 76,
            data: vec![0x01, 0x01, 0x80],
        });
        let device = processor.apply_scan_record(&record, &config, &filter, now);

        let snapshot = device.snapshot();
        assert_eq!(snapshot.operating_system, DeviceOperatingSystem::Ios);
        assert_eq!(snapshot.rssi, Some(-65));
        assert_eq!(snapshot.vendor_features, vec!["010180".to_string()]);
        assert!(snapshot.last_discovered_at.is_some());
    }

    #[test]
    fn test_apply_scan_record_uses_pseudo_address() {
        let (processor, registry) = processor();
        let config = ProximityConfig::default();
        let filter = DeviceFilter::new(&config.filter).expect("filter");
        let now = SystemTime::now();

        let mut first = ScanRecord::new("addr-1".into(), -50);
        first.service_uuids.push(config.service_uuid);
        first.manufacturer_data.push(ManufacturerData {
            manufacturer_id: config.sensor_manufacturer_id,
            data: vec![1, 2, 3, 4, 5, 6],
        });
        let mut second = first.clone();
        second.identifier = "addr-2".into();

        let a = processor.apply_scan_record(&first, &config, &filter, now);
        let b = processor.apply_scan_record(&second, &config, &filter, now);
        assert!(a.ptr_eq(&b));
        assert_eq!(registry.len(), 1);
        assert_eq!(b.identifier().as_str(), "addr-2");
        // android flavour already confirmed by the pseudo-address
        assert_eq!(b.read().operating_system, DeviceOperatingSystem::Android);
    }

    #[test]
    fn test_repeated_ignore_extends_deadline() {
        let (processor, _registry) = processor();
        let config = ProximityConfig::default();
        let filter = DeviceFilter::new(&config.filter).expect("filter");
        let now = SystemTime::now();
        let record = ScanRecord::new("nothing".into(), -90);

        // one classification per scan cycle
        let mut deadlines = Vec::new();
        let mut device = None;
        for cycle in 0..3u64 {
            let at = now + Duration::from_secs(7 * cycle);
            let d = processor.apply_scan_record(&record, &config, &filter, at);
            deadlines.push(d.read().ignore_until.expect("deadline"));
            device = Some(d);
        }
        let device = device.expect("device");
        assert!(deadlines[1] > deadlines[0]);
        assert!(deadlines[2] > deadlines[1]);
        assert_eq!(deadlines[0], now + Duration::from_secs(60));
        assert_eq!(deadlines[1], now + Duration::from_secs(7 + 72));
        let third = device.read().ignore_for.expect("backoff duration");
        assert!((third.as_secs_f64() - 86.4).abs() < 0.001);

        for cycle in 3..20u64 {
            let at = now + Duration::from_secs(7 * cycle);
            processor.apply_scan_record(&record, &config, &filter, at);
        }
        let last = now + Duration::from_secs(7 * 19);
        assert_eq!(device.read().ignore_for, Some(Duration::from_secs(180)));
        assert_eq!(
            device.read().ignore_until,
            Some(last + Duration::from_secs(180))
        );
    }

    #[test]
    fn test_normalise_stuck_connections() {
        let (processor, registry) = processor();
        let config = ProximityConfig::default();
        let now = SystemTime::now();

        let stuck = registry.get_or_create_by_session_id(&"stuck".into());
        stuck.modify(|d| {
            d.state = DeviceState::Connected;
            d.last_connected_at = Some(now - Duration::from_secs(120));
        });
        let fresh = registry.get_or_create_by_session_id(&"fresh".into());
        fresh.modify(|d| {
            d.state = DeviceState::Connected;
            d.last_connected_at = Some(now - Duration::from_secs(5));
        });
        let connecting = registry.get_or_create_by_session_id(&"connecting".into());
        connecting.modify(|d| {
            d.state = DeviceState::Connecting;
            d.last_connect_request_at = Some(now - Duration::from_secs(30));
        });

        assert_eq!(processor.normalise_connections(&config, now), 2);
        assert_eq!(stuck.read().state, DeviceState::Disconnected);
        assert_eq!(fresh.read().state, DeviceState::Connected);
        assert_eq!(connecting.read().state, DeviceState::Disconnected);
    }
}
