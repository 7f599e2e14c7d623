/// Connection task protocol
///
/// `next_task_for_device` decides the single next GATT action for a device
/// from its current state; it is recomputed after every completed task, so
/// a connection is a chain of one-task-at-a-time exchanges that ends when
/// nothing is left to do. `ConnectionDriver` runs that chain against the
/// radio under the connect timeout and the per-connection ceiling, and
/// always leaves the device disconnected.

use super::codec::{CodecError, SignalMessage};
use super::gatt::{GattCharacteristic, GattError};
use super::radio::{BleRadio, RadioError, WriteType};
use crate::config::{PlatformFlavor, ProximityConfig};
use crate::device::{
    Device, DeviceAttribute, DeviceError, DeviceFilter, DeviceOperatingSystem,
    DeviceRegistry, DeviceState, DiscoveredCharacteristics, IgnoreBackoff, SharedDevice,
    TargetIdentifier,
};
use crate::payload::{PayloadData, PayloadSupplier};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Connection exceeded {0:?}")]
    CeilingExceeded(Duration),
    #[error("Characteristic not available: {0}")]
    MissingCharacteristic(&'static str),
    #[error("Nothing to send: {0}")]
    NothingToSend(&'static str),
    #[error("Empty read from {0}")]
    EmptyRead(&'static str),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),
}

/// Single next action on a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTask {
    Nothing,
    ReadModel,
    ReadDeviceName,
    ReadPayload,
    WritePayload,
    WriteRssi,
    WritePayloadSharing,
    ImmediateSend,
}

impl fmt::Display for DeviceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceTask::Nothing => "nothing",
            DeviceTask::ReadModel => "read_model",
            DeviceTask::ReadDeviceName => "read_device_name",
            DeviceTask::ReadPayload => "read_payload",
            DeviceTask::WritePayload => "write_payload",
            DeviceTask::WriteRssi => "write_rssi",
            DeviceTask::WritePayloadSharing => "write_payload_sharing",
            DeviceTask::ImmediateSend => "immediate_send",
        };
        f.write_str(name)
    }
}

/// Inputs to task selection beyond the device itself
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub config: &'a ProximityConfig,
    /// Whether this device can advertise
    pub transmit_supported: bool,
    /// Whether the registry holds payloads the device has not been sent
    pub sharing_available: bool,
}

fn interval_elapsed(since: Option<Duration>, interval: Duration) -> bool {
    since.map_or(true, |t| t >= interval)
}

/// Decide the next task for `device`. Fixed precedence; the first rule
/// that applies wins.
pub fn next_task_for_device(device: &Device, ctx: &TaskContext<'_>, now: SystemTime) -> DeviceTask {
    let config = ctx.config;

    // Only radio-addressable devices can be connected to
    if device.identifier.is_synthesized()
        || device.operating_system == DeviceOperatingSystem::Shared
    {
        return DeviceTask::Nothing;
    }
    if device.is_ignored(now) {
        return DeviceTask::Nothing;
    }

    if config.introspection_enabled {
        if device.characteristics.model.is_some() && device.model.is_none() {
            return DeviceTask::ReadModel;
        }
        if device.characteristics.device_name.is_some() && device.device_name.is_none() {
            return DeviceTask::ReadDeviceName;
        }
    }

    if !device.operating_system.is_confirmed() {
        return DeviceTask::ReadPayload;
    }

    if device.immediate_send.is_some() {
        return DeviceTask::ImmediateSend;
    }

    if device.payload.is_none() {
        return DeviceTask::ReadPayload;
    }

    if let (Some(refresh), Some(age)) = (config.payload_refresh(), device.payload_age(now)) {
        if age >= refresh {
            return DeviceTask::ReadPayload;
        }
    }

    let sharing_interval = Duration::from_secs(config.connection.write_payload_sharing_interval_secs);
    if !ctx.transmit_supported {
        let payload_interval = Duration::from_secs(config.connection.write_payload_interval_secs);
        let rssi_interval = Duration::from_secs(config.connection.write_rssi_interval_secs);
        if interval_elapsed(device.time_since_write_payload(now), payload_interval) {
            return DeviceTask::WritePayload;
        }
        if device.rssi.is_some() && interval_elapsed(device.time_since_write_rssi(now), rssi_interval)
        {
            return DeviceTask::WriteRssi;
        }
        if ctx.sharing_available
            && interval_elapsed(device.time_since_write_payload_sharing(now), sharing_interval)
        {
            return DeviceTask::WritePayloadSharing;
        }
        return DeviceTask::Nothing;
    }

    if device.operating_system == DeviceOperatingSystem::Ios
        && ctx.sharing_available
        && interval_elapsed(device.time_since_write_payload_sharing(now), sharing_interval)
    {
        return DeviceTask::WritePayloadSharing;
    }

    DeviceTask::Nothing
}

/// Result of one connection
#[derive(Debug, Clone)]
pub struct ConnectionOutcome {
    pub identifier: TargetIdentifier,
    pub connected: bool,
    pub tasks: Vec<DeviceTask>,
    pub error: Option<ConnectionError>,
    pub elapsed: Duration,
}

impl ConnectionOutcome {
    fn new(identifier: TargetIdentifier) -> Self {
        Self {
            identifier,
            connected: false,
            tasks: Vec::new(),
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.connected && self.error.is_none()
    }
}

/// Runs the task protocol over one connection
pub struct ConnectionDriver {
    radio: Arc<dyn BleRadio>,
    registry: DeviceRegistry,
    supplier: Arc<dyn PayloadSupplier>,
    filter: Arc<DeviceFilter>,
    config: Arc<ProximityConfig>,
}

impl ConnectionDriver {
    pub fn new(
        radio: Arc<dyn BleRadio>,
        registry: DeviceRegistry,
        supplier: Arc<dyn PayloadSupplier>,
        filter: Arc<DeviceFilter>,
        config: Arc<ProximityConfig>,
    ) -> Self {
        Self {
            radio,
            registry,
            supplier,
            filter,
            config,
        }
    }

    /// Next task for `device` given the current registry contents
    pub fn next_task(&self, device: &SharedDevice, now: SystemTime) -> DeviceTask {
        let sharing_available = !self
            .registry
            .compute_payload_sharing_set(device, now, &self.config)
            .unknown
            .is_empty();
        let ctx = TaskContext {
            config: &self.config,
            transmit_supported: self.radio.is_transmit_supported(),
            sharing_available,
        };
        next_task_for_device(&device.read(), &ctx, now)
    }

    /// Connect, run tasks until none is left, disconnect. The device is
    /// always disconnected on return.
    pub async fn run(&self, device: &SharedDevice) -> ConnectionOutcome {
        let started = Instant::now();
        let identifier = device.identifier();
        let mut outcome = ConnectionOutcome::new(identifier.clone());

        if let Err(e) = device.try_begin_connect(SystemTime::now()) {
            debug!("Not connecting to {}: {}", identifier, e);
            outcome.error = Some(e.into());
            return outcome;
        }

        let ceiling = self.config.connection_ceiling();
        match timeout(ceiling, self.exchange(device, &mut outcome)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Connection to {} ended: {}", identifier, e);
                outcome.error = Some(e);
            }
            Err(_) => {
                warn!("Connection to {} exceeded {:?}", identifier, ceiling);
                outcome.error = Some(ConnectionError::CeilingExceeded(ceiling));
            }
        }

        match timeout(self.config.connect_timeout(), self.radio.disconnect(&identifier)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Disconnect from {} failed: {}", identifier, e),
            Err(_) => warn!("Disconnect from {} timed out", identifier),
        }
        device.modify(|d| d.write_queue.clear());
        if device.set_state(DeviceState::Disconnected, SystemTime::now()).is_err() {
            device.force_disconnected(SystemTime::now());
        }

        outcome.elapsed = started.elapsed();
        info!(
            "Connection to {} finished in {:?}: tasks={:?} error={:?}",
            identifier, outcome.elapsed, outcome.tasks, outcome.error
        );
        outcome
    }

    async fn exchange(
        &self,
        device: &SharedDevice,
        outcome: &mut ConnectionOutcome,
    ) -> Result<(), ConnectionError> {
        let identifier = device.identifier();
        let connect_timeout = self.config.connect_timeout();
        timeout(connect_timeout, self.radio.connect(&identifier))
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(connect_timeout))??;
        device.set_state(DeviceState::Connected, SystemTime::now())?;
        outcome.connected = true;

        self.discover(device).await?;

        let mut previous = DeviceTask::Nothing;
        loop {
            let task = self.next_task(device, SystemTime::now());
            if task == DeviceTask::Nothing {
                return Ok(());
            }
            if task == previous {
                debug!("Task {} made no progress on {}, disconnecting", task, identifier);
                return Ok(());
            }
            outcome.tasks.push(task);
            let result = self.execute(device, task).await;
            if task == DeviceTask::ImmediateSend {
                return result;
            }
            result?;
            previous = task;
        }
    }

    /// Service discovery on every connection; the signal characteristic
    /// found confirms the operating system
    async fn discover(&self, device: &SharedDevice) -> Result<(), ConnectionError> {
        let identifier = device.identifier();
        let services = self.radio.discover_services(&identifier).await?;
        let config = &self.config;

        let mut found = DiscoveredCharacteristics::default();
        for service in &services {
            for reference in service.characteristic_refs() {
                match GattCharacteristic::from_uuid(reference.characteristic, config) {
                    Some(GattCharacteristic::Signal(flavor)) if service.uuid == config.service_uuid => {
                        found.signal = Some((reference, flavor));
                    }
                    Some(GattCharacteristic::Payload) if service.uuid == config.service_uuid => {
                        found.payload = Some(reference);
                    }
                    Some(GattCharacteristic::LegacyPayload) if config.interop.enabled => {
                        found.legacy_payload = Some(reference);
                    }
                    Some(GattCharacteristic::DeviceName) => found.device_name = Some(reference),
                    Some(GattCharacteristic::Model) => found.model = Some(reference),
                    _ => {}
                }
            }
        }

        let features = device.read().vendor_features.clone();
        self.filter.train(&features, found.payload.is_some());

        let now = SystemTime::now();
        let backoff = IgnoreBackoff::from(&config.filter);
        match found.signal {
            Some((_, PlatformFlavor::Android)) => {
                device.set_operating_system(DeviceOperatingSystem::Android, now, &backoff)
            }
            Some((_, PlatformFlavor::Ios)) => {
                device.set_operating_system(DeviceOperatingSystem::Ios, now, &backoff)
            }
            None if found.legacy_payload.is_some() => {
                // predecessor protocol only exposes its payload
                let current = device.read().operating_system;
                if !current.is_confirmed() {
                    device.set_operating_system(DeviceOperatingSystem::Android, now, &backoff);
                }
            }
            None if found.payload.is_none() => {
                debug!("Device {} has no proximity service", identifier);
                device.set_operating_system(DeviceOperatingSystem::Ignore, now, &backoff);
            }
            None => {}
        }
        device.modify(|d| d.characteristics = found);
        Ok(())
    }

    async fn execute(&self, device: &SharedDevice, task: DeviceTask) -> Result<(), ConnectionError> {
        debug!("Device {} task {}", device.identifier(), task);
        match task {
            DeviceTask::Nothing => Ok(()),
            DeviceTask::ReadModel => self.read_text(device, DeviceAttribute::Model).await,
            DeviceTask::ReadDeviceName => self.read_text(device, DeviceAttribute::DeviceName).await,
            DeviceTask::ReadPayload => self.read_payload(device).await,
            DeviceTask::WritePayload => {
                let now = SystemTime::now();
                let payload = self
                    .supplier
                    .payload(now, Some(device.identifier()))
                    .ok_or(ConnectionError::NothingToSend("payload"))?;
                self.write_signal(device, &SignalMessage::Payload(payload)).await?;
                device.modify(|d| d.last_write_payload_at = Some(SystemTime::now()));
                Ok(())
            }
            DeviceTask::WriteRssi => {
                let rssi = device
                    .read()
                    .rssi
                    .ok_or(ConnectionError::NothingToSend("rssi"))?;
                self.write_signal(device, &SignalMessage::Rssi(rssi)).await?;
                device.modify(|d| d.last_write_rssi_at = Some(SystemTime::now()));
                Ok(())
            }
            DeviceTask::WritePayloadSharing => {
                let data = self
                    .registry
                    .payload_sharing_data(device, SystemTime::now(), &self.config)
                    .ok_or(ConnectionError::NothingToSend("payload sharing"))?;
                let result = self
                    .write_signal(device, &SignalMessage::PayloadSharing(data))
                    .await;
                device.modify(|d| d.last_write_payload_sharing_at = Some(SystemTime::now()));
                result
            }
            DeviceTask::ImmediateSend => {
                let data = device
                    .modify(|d| d.immediate_send.take())
                    .ok_or(ConnectionError::NothingToSend("immediate send"))?;
                self.write_signal(device, &SignalMessage::ImmediateSend(data)).await
            }
        }
    }

    async fn read_payload(&self, device: &SharedDevice) -> Result<(), ConnectionError> {
        let identifier = device.identifier();
        let characteristics = device.read().characteristics.clone();

        if let Some(reference) = characteristics.payload {
            let data = self.radio.read_characteristic(&identifier, reference).await?;
            if data.is_empty() {
                return Err(ConnectionError::EmptyRead("payload"));
            }
            let payload = PayloadData::new(data);
            debug!("Device {} payload {}", identifier, payload.short_name());
            device.set_payload(payload, SystemTime::now());
            return Ok(());
        }

        if let Some(reference) = characteristics.legacy_payload {
            let mtu = self
                .radio
                .request_mtu(&identifier, self.config.interop.mtu)
                .await?;
            debug!("Device {} legacy MTU {}", identifier, mtu);
            let data = self.radio.read_characteristic(&identifier, reference).await?;
            if data.is_empty() {
                return Err(ConnectionError::EmptyRead("legacy payload"));
            }
            let payload = PayloadData::new(data);
            device.modify(|d| d.legacy_payload = Some(payload.clone()));
            device.set_payload(payload, SystemTime::now());
            return Ok(());
        }

        Err(ConnectionError::MissingCharacteristic("payload"))
    }

    async fn read_text(
        &self,
        device: &SharedDevice,
        attribute: DeviceAttribute,
    ) -> Result<(), ConnectionError> {
        let identifier = device.identifier();
        let characteristics = device.read().characteristics.clone();
        let reference = match attribute {
            DeviceAttribute::Model => characteristics.model,
            _ => characteristics.device_name,
        }
        .ok_or(ConnectionError::MissingCharacteristic("introspection"))?;

        let data = self.radio.read_characteristic(&identifier, reference).await?;
        let text = String::from_utf8_lossy(&data).trim().to_string();
        device.update(attribute, |d| {
            match attribute {
                DeviceAttribute::Model => d.model = Some(text),
                _ => d.device_name = Some(text),
            }
            d.touch(SystemTime::now());
        });
        Ok(())
    }

    /// Write a signal message in the style the peer's characteristic
    /// implies: android peers get fixed-size chunks written one after the
    /// other, others get the whole buffer in one write
    async fn write_signal(
        &self,
        device: &SharedDevice,
        message: &SignalMessage,
    ) -> Result<(), ConnectionError> {
        let identifier = device.identifier();
        let (reference, flavor) = device
            .read()
            .characteristics
            .signal
            .ok_or(ConnectionError::MissingCharacteristic("signal"))?;
        let bytes = message.encode()?;

        match flavor {
            PlatformFlavor::Ios => {
                self.radio
                    .write_characteristic(&identifier, reference, &bytes, WriteType::WithResponse)
                    .await?;
            }
            PlatformFlavor::Android => {
                let chunk = self.config.connection.android_write_chunk_bytes;
                device.modify(|d| {
                    d.write_queue.clear();
                    d.write_queue
                        .enqueue_fragmented(reference, &bytes, chunk, WriteType::WithResponse)
                })?;
                self.drain_write_queue(device, &identifier).await?;
            }
        }
        debug!(
            "Device {} wrote {} ({} bytes)",
            identifier,
            message.action(),
            bytes.len()
        );
        Ok(())
    }

    async fn drain_write_queue(
        &self,
        device: &SharedDevice,
        identifier: &TargetIdentifier,
    ) -> Result<(), ConnectionError> {
        loop {
            let next = device.modify(|d| d.write_queue.dequeue());
            let request = match next {
                Some(request) => request,
                None => return Ok(()),
            };
            let written = self
                .radio
                .write_characteristic(identifier, request.characteristic, &request.data, request.write_type)
                .await;
            if let Err(e) = written {
                device.modify(|d| d.write_queue.clear());
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CharacteristicRef;
    use crate::payload::FixedLengthPayloadSupplier;
    use crate::transport::ble::simulated::{
        RadioCall, SimulatedBehaviour, SimulatedPeer, SimulatedRadio,
    };
    use std::collections::HashSet;

    fn ctx(config: &ProximityConfig, transmit: bool, sharing: bool) -> TaskContext<'_> {
        TaskContext {
            config,
            transmit_supported: transmit,
            sharing_available: sharing,
        }
    }

    fn confirmed(os: DeviceOperatingSystem, now: SystemTime) -> Device {
        let mut device = Device::new(TargetIdentifier::from("peer"), now);
        device.operating_system = os;
        device.set_payload(PayloadData::new(vec![1; 8]), now);
        device.rssi = Some(-60);
        device
    }

    #[test]
    fn test_synthesized_and_ignored_get_nothing() {
        let config = ProximityConfig::default();
        let now = SystemTime::now();
        let synthesized = Device::new(TargetIdentifier::synthesized(), now);
        assert_eq!(
            next_task_for_device(&synthesized, &ctx(&config, true, false), now),
            DeviceTask::Nothing
        );

        let mut ignored = Device::new(TargetIdentifier::from("x"), now);
        ignored.set_operating_system(DeviceOperatingSystem::Ignore, now, &IgnoreBackoff::default());
        assert_eq!(
            next_task_for_device(&ignored, &ctx(&config, true, false), now),
            DeviceTask::Nothing
        );
        // after the deadline the device is tried again
        assert_eq!(
            next_task_for_device(&ignored, &ctx(&config, true, false), now + Duration::from_secs(61)),
            DeviceTask::ReadPayload
        );
    }

    #[test]
    fn test_unconfirmed_reads_payload() {
        let config = ProximityConfig::default();
        let now = SystemTime::now();
        let mut device = Device::new(TargetIdentifier::from("x"), now);
        device.operating_system = DeviceOperatingSystem::AndroidTbc;
        device.immediate_send = Some(vec![1]);
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::ReadPayload
        );
    }

    #[test]
    fn test_introspection_first_when_enabled() {
        let mut config = ProximityConfig::default();
        let now = SystemTime::now();
        let mut device = confirmed(DeviceOperatingSystem::Android, now);
        device.characteristics.model = Some(CharacteristicRef {
            service: config.service_uuid,
            characteristic: crate::config::MODEL_CHARACTERISTIC_UUID,
        });
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::Nothing
        );
        config.introspection_enabled = true;
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::ReadModel
        );
        device.model = Some("Pixel".to_string());
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::Nothing
        );
    }

    #[test]
    fn test_immediate_send_before_payload() {
        let config = ProximityConfig::default();
        let now = SystemTime::now();
        let mut device = Device::new(TargetIdentifier::from("x"), now);
        device.operating_system = DeviceOperatingSystem::Ios;
        device.immediate_send = Some(vec![1, 2]);
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::ImmediateSend
        );
        device.immediate_send = None;
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::ReadPayload
        );
    }

    #[test]
    fn test_payload_refresh() {
        let mut config = ProximityConfig::default();
        let now = SystemTime::now();
        let device = confirmed(DeviceOperatingSystem::Android, now - Duration::from_secs(600));
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::Nothing
        );
        config.connection.payload_refresh_secs = Some(300);
        assert_eq!(
            next_task_for_device(&device, &ctx(&config, true, false), now),
            DeviceTask::ReadPayload
        );
    }

    #[test]
    fn test_receive_only_writes_alternate() {
        let config = ProximityConfig::default();
        let now = SystemTime::now();
        let mut device = confirmed(DeviceOperatingSystem::Android, now);
        let c = ctx(&config, false, true);

        assert_eq!(next_task_for_device(&device, &c, now), DeviceTask::WritePayload);
        device.last_write_payload_at = Some(now);
        assert_eq!(next_task_for_device(&device, &c, now), DeviceTask::WriteRssi);
        device.last_write_rssi_at = Some(now);
        assert_eq!(next_task_for_device(&device, &c, now), DeviceTask::WritePayloadSharing);
        device.last_write_payload_sharing_at = Some(now);
        assert_eq!(next_task_for_device(&device, &c, now), DeviceTask::Nothing);

        // RSSI interval (15 s) elapses before the payload interval (5 min)
        let later = now + Duration::from_secs(16);
        assert_eq!(next_task_for_device(&device, &c, later), DeviceTask::WriteRssi);
        let much_later = now + Duration::from_secs(301);
        assert_eq!(next_task_for_device(&device, &c, much_later), DeviceTask::WritePayload);
    }

    #[test]
    fn test_sharing_pushed_to_ios_only() {
        let config = ProximityConfig::default();
        let now = SystemTime::now();
        let ios = confirmed(DeviceOperatingSystem::Ios, now);
        let android = confirmed(DeviceOperatingSystem::Android, now);

        assert_eq!(
            next_task_for_device(&ios, &ctx(&config, true, true), now),
            DeviceTask::WritePayloadSharing
        );
        assert_eq!(
            next_task_for_device(&ios, &ctx(&config, true, false), now),
            DeviceTask::Nothing
        );
        assert_eq!(
            next_task_for_device(&android, &ctx(&config, true, true), now),
            DeviceTask::Nothing
        );
    }

    #[test]
    fn test_task_names_unique() {
        let tasks = [
            DeviceTask::Nothing,
            DeviceTask::ReadModel,
            DeviceTask::ReadDeviceName,
            DeviceTask::ReadPayload,
            DeviceTask::WritePayload,
            DeviceTask::WriteRssi,
            DeviceTask::WritePayloadSharing,
            DeviceTask::ImmediateSend,
        ];
        let names: HashSet<String> = tasks.iter().map(|t| t.to_string()).collect();
        assert_eq!(names.len(), tasks.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_runs_share_one_connection() {
        let config = ProximityConfig::default();
        let radio = Arc::new(SimulatedRadio::new(config.clone()));
        radio.add_peer(SimulatedPeer::new(
            "android-1",
            SimulatedBehaviour::Android,
            PayloadData::new(vec![7; 16]),
        ));
        radio.set_latency(Duration::from_millis(500));
        let (registry, _events) = DeviceRegistry::new();
        let filter = Arc::new(DeviceFilter::new(&config.filter).expect("filter"));
        let driver = ConnectionDriver::new(
            radio.clone(),
            registry.clone(),
            Arc::new(FixedLengthPayloadSupplier::from_seed(1, 16)),
            filter,
            Arc::new(config),
        );
        let device = registry.get_or_create_by_session_id(&"android-1".into());

        let late = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            driver.run(&device).await
        };
        let (first, second) = tokio::join!(driver.run(&device), late);

        assert!(first.is_success());
        assert_eq!(first.tasks, vec![DeviceTask::ReadPayload]);
        assert!(!second.connected);
        assert!(second.tasks.is_empty());
        assert_eq!(
            second.error,
            Some(ConnectionError::Device(DeviceError::ConnectionInProgress(
                DeviceState::Connecting
            )))
        );
        assert_eq!(radio.count(|c| matches!(c, RadioCall::Connect(_))), 1);
        assert_eq!(device.read().state, DeviceState::Disconnected);
        assert!(device.read().payload.is_some());

        // once disconnected the device can be connected again
        let again = driver.run(&device).await;
        assert!(again.connected);
        assert_eq!(radio.count(|c| matches!(c, RadioCall::Connect(_))), 2);
    }
}
