//! Device entity: everything known about one peer
//!
//! A `Device` is created on first observation (scan result, inbound write,
//! or synthesized for an unseen payload) and mutated by every radio event
//! that concerns it. Devices live in the `DeviceRegistry` behind a
//! `SharedDevice` handle; attribute updates made through the handle are
//! published on the registry event stream.

pub mod classifier;
pub mod registry;
pub mod sharing;

use crate::config::{FilterConfig, PlatformFlavor};
use crate::payload::PayloadData;
use crate::transport::ble::gatt::GattWriteQueue;
use parking_lot::{RwLock, RwLockReadGuard};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use classifier::{classify, DeviceFilter, ScanSignals, TrainingSample};
pub use registry::{DeviceRegistry, RegistryEvent, RegistryEvents};
pub use sharing::PayloadSharingSet;

const SYNTHESIZED_PREFIX: &str = "synthesized:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: DeviceState, to: DeviceState },
    #[error("Connection already in progress ({0})")]
    ConnectionInProgress(DeviceState),
}

/// Session identifier of a device: a radio-level address, or a synthesized
/// identifier for devices only known by payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetIdentifier(String);

impl TargetIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh identifier for a device with no radio address yet
    pub fn synthesized() -> Self {
        Self(format!("{}{}", SYNTHESIZED_PREFIX, Uuid::new_v4()))
    }

    /// Synthesized identifiers cannot be connected to
    pub fn is_synthesized(&self) -> bool {
        self.0.starts_with(SYNTHESIZED_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetIdentifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Synthetic 48-bit address broadcast in manufacturer data so a peer that
/// rotates its radio address can be re-identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PseudoDeviceAddress([u8; 6]);

impl PseudoDeviceAddress {
    pub const LENGTH: usize = 6;

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Random address; an all-zero draw is avoided so it never looks unset
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        let mut rng = rand::thread_rng();
        loop {
            rng.fill_bytes(&mut bytes);
            if bytes.iter().any(|b| *b != 0) {
                return Self(bytes);
            }
        }
    }

    /// Parse from manufacturer data; requires at least six bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LENGTH {
            return None;
        }
        let mut address = [0u8; 6];
        address.copy_from_slice(&bytes[..Self::LENGTH]);
        Some(Self(address))
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        self.0
    }

    pub fn as_u64(&self) -> u64 {
        let mut value = [0u8; 8];
        value[..6].copy_from_slice(&self.0);
        u64::from_le_bytes(value)
    }
}

impl fmt::Display for PseudoDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Inferred operating system. Tentative (`*Tbc`) values come from advert
/// data alone; confirmed values come from a completed GATT discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOperatingSystem {
    Unknown,
    AndroidTbc,
    Android,
    IosTbc,
    Ios,
    Ignore,
    /// Known only from payload-sharing data relayed by another peer
    Shared,
}

impl DeviceOperatingSystem {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DeviceOperatingSystem::Android | DeviceOperatingSystem::Ios)
    }

    pub fn is_tentative(&self) -> bool {
        matches!(
            self,
            DeviceOperatingSystem::Unknown
                | DeviceOperatingSystem::AndroidTbc
                | DeviceOperatingSystem::IosTbc
        )
    }
}

impl fmt::Display for DeviceOperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceOperatingSystem::Unknown => "unknown",
            DeviceOperatingSystem::AndroidTbc => "android_tbc",
            DeviceOperatingSystem::Android => "android",
            DeviceOperatingSystem::IosTbc => "ios_tbc",
            DeviceOperatingSystem::Ios => "ios",
            DeviceOperatingSystem::Ignore => "ignore",
            DeviceOperatingSystem::Shared => "shared",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Disconnected => write!(f, "disconnected"),
            DeviceState::Connecting => write!(f, "connecting"),
            DeviceState::Connected => write!(f, "connected"),
        }
    }
}

/// How the device came to be known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Observed through scanning and the connection protocol
    Scanned,
    /// Cannot advertise; it writes its own payload and RSSI to us
    ReceiveOnly,
    /// Known only through payload-sharing data relayed by a peer
    Relayed,
}

/// Attribute named in an update notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAttribute {
    State,
    OperatingSystem,
    Payload,
    Rssi,
    TxPower,
    PseudoAddress,
    SessionIdentifier,
    Model,
    DeviceName,
    Role,
}

/// Location of a characteristic found during service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// Per-connection service discovery cache; cleared on every connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredCharacteristics {
    /// Signal characteristic and the write style it implies
    pub signal: Option<(CharacteristicRef, PlatformFlavor)>,
    pub payload: Option<CharacteristicRef>,
    pub legacy_payload: Option<CharacteristicRef>,
    pub device_name: Option<CharacteristicRef>,
    pub model: Option<CharacteristicRef>,
}

impl DiscoveredCharacteristics {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Ignore backoff parameters
#[derive(Debug, Clone, Copy)]
pub struct IgnoreBackoff {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for IgnoreBackoff {
    fn default() -> Self {
        Self::from(&FilterConfig::default())
    }
}

impl From<&FilterConfig> for IgnoreBackoff {
    fn from(config: &FilterConfig) -> Self {
        Self {
            initial: Duration::from_secs(config.ignore_initial_secs),
            factor: config.ignore_backoff_factor,
            max: Duration::from_secs(config.ignore_max_secs),
        }
    }
}

impl IgnoreBackoff {
    /// Duration following `previous`: initial first, then grown by the
    /// factor up to the cap
    pub fn next(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.initial,
            Some(previous) => previous.mul_f64(self.factor).min(self.max),
        }
    }
}

fn elapsed(now: SystemTime, since: Option<SystemTime>) -> Option<Duration> {
    since.map(|t| now.duration_since(t).unwrap_or_default())
}

/// Everything known about one peer
#[derive(Debug, Clone)]
pub struct Device {
    pub identifier: TargetIdentifier,
    pub state: DeviceState,
    pub operating_system: DeviceOperatingSystem,
    pub role: DeviceRole,
    pub pseudo_address: Option<PseudoDeviceAddress>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub payload: Option<PayloadData>,
    pub legacy_payload: Option<PayloadData>,
    /// Payloads already forwarded to this peer
    pub shared_payloads: HashSet<PayloadData>,
    pub characteristics: DiscoveredCharacteristics,
    pub model: Option<String>,
    pub device_name: Option<String>,
    /// Upper-case hex Apple sub-segments from the latest advert
    pub vendor_features: Vec<String>,
    /// Pending immediate-send data
    pub immediate_send: Option<Vec<u8>>,
    /// Outbound fragments of the signal write in flight
    pub write_queue: GattWriteQueue,
    pub created_at: SystemTime,
    pub last_updated_at: SystemTime,
    pub last_discovered_at: Option<SystemTime>,
    pub last_connect_request_at: Option<SystemTime>,
    pub last_connected_at: Option<SystemTime>,
    pub last_disconnected_at: Option<SystemTime>,
    pub payload_updated_at: Option<SystemTime>,
    pub last_write_payload_at: Option<SystemTime>,
    pub last_write_rssi_at: Option<SystemTime>,
    pub last_write_payload_sharing_at: Option<SystemTime>,
    pub ignore_until: Option<SystemTime>,
    pub ignore_for: Option<Duration>,
}

impl Device {
    pub fn new(identifier: TargetIdentifier, now: SystemTime) -> Self {
        Self {
            identifier,
            state: DeviceState::Disconnected,
            operating_system: DeviceOperatingSystem::Unknown,
            role: DeviceRole::Scanned,
            pseudo_address: None,
            rssi: None,
            tx_power: None,
            payload: None,
            legacy_payload: None,
            shared_payloads: HashSet::new(),
            characteristics: DiscoveredCharacteristics::default(),
            model: None,
            device_name: None,
            vendor_features: Vec::new(),
            immediate_send: None,
            write_queue: GattWriteQueue::new_default(),
            created_at: now,
            last_updated_at: now,
            last_discovered_at: None,
            last_connect_request_at: None,
            last_connected_at: None,
            last_disconnected_at: None,
            payload_updated_at: None,
            last_write_payload_at: None,
            last_write_rssi_at: None,
            last_write_payload_sharing_at: None,
            ignore_until: None,
            ignore_for: None,
        }
    }

    pub fn touch(&mut self, now: SystemTime) {
        self.last_updated_at = now;
    }

    pub fn time_since_last_update(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_updated_at).unwrap_or_default()
    }

    pub fn payload_age(&self, now: SystemTime) -> Option<Duration> {
        elapsed(now, self.payload_updated_at)
    }

    pub fn time_since_connected(&self, now: SystemTime) -> Option<Duration> {
        elapsed(now, self.last_connected_at)
    }

    pub fn time_since_write_payload(&self, now: SystemTime) -> Option<Duration> {
        elapsed(now, self.last_write_payload_at)
    }

    pub fn time_since_write_rssi(&self, now: SystemTime) -> Option<Duration> {
        elapsed(now, self.last_write_rssi_at)
    }

    pub fn time_since_write_payload_sharing(&self, now: SystemTime) -> Option<Duration> {
        elapsed(now, self.last_write_payload_sharing_at)
    }

    /// Whether an ignore deadline is still in the future
    pub fn is_ignored(&self, now: SystemTime) -> bool {
        matches!(self.ignore_until, Some(until) if until > now)
    }

    pub fn register_discovery(&mut self, now: SystemTime) {
        self.last_discovered_at = Some(now);
        self.touch(now);
    }

    /// Move along disconnected → connecting → {connected, disconnected} →
    /// disconnected. Re-entering the current state is a no-op.
    pub fn transition(&mut self, to: DeviceState, now: SystemTime) -> Result<bool, DeviceError> {
        let from = self.state;
        if from == to {
            return Ok(false);
        }
        let allowed = matches!(
            (from, to),
            (DeviceState::Disconnected, DeviceState::Connecting)
                | (DeviceState::Connecting, DeviceState::Connected)
                | (DeviceState::Connecting, DeviceState::Disconnected)
                | (DeviceState::Connected, DeviceState::Disconnected)
        );
        if !allowed {
            return Err(DeviceError::InvalidTransition { from, to });
        }

        self.state = to;
        match to {
            DeviceState::Connecting => {
                self.last_connect_request_at = Some(now);
                // Discovery is never reused across connections
                self.characteristics = DiscoveredCharacteristics::default();
                self.write_queue.clear();
            }
            DeviceState::Connected => self.last_connected_at = Some(now),
            DeviceState::Disconnected => {
                self.last_disconnected_at = Some(now);
                self.write_queue.clear();
            }
        }
        self.touch(now);
        Ok(true)
    }

    /// Claim the device for a new connection. Only a disconnected device
    /// can be claimed, so at most one connection is ever open to it.
    pub fn begin_connect(&mut self, now: SystemTime) -> Result<(), DeviceError> {
        if self.state != DeviceState::Disconnected {
            return Err(DeviceError::ConnectionInProgress(self.state));
        }
        self.transition(DeviceState::Connecting, now)?;
        Ok(())
    }

    /// Unconditional return to disconnected, used by timeouts and stuck
    /// connection recovery
    pub fn force_disconnected(&mut self, now: SystemTime) -> bool {
        if self.state == DeviceState::Disconnected {
            return false;
        }
        self.state = DeviceState::Disconnected;
        self.last_disconnected_at = Some(now);
        self.write_queue.clear();
        self.touch(now);
        true
    }

    /// Set the operating system. `Ignore` starts or extends the ignore
    /// backoff; a confirmed OS resets it.
    pub fn set_operating_system(
        &mut self,
        operating_system: DeviceOperatingSystem,
        now: SystemTime,
        backoff: &IgnoreBackoff,
    ) -> bool {
        match operating_system {
            DeviceOperatingSystem::Ignore => {
                let duration = backoff.next(self.ignore_for);
                self.ignore_for = Some(duration);
                self.ignore_until = Some(now + duration);
            }
            DeviceOperatingSystem::Android | DeviceOperatingSystem::Ios => {
                self.ignore_for = None;
                self.ignore_until = None;
            }
            _ => {}
        }
        let changed = self.operating_system != operating_system;
        self.operating_system = operating_system;
        self.touch(now);
        changed
    }

    pub fn set_payload(&mut self, payload: PayloadData, now: SystemTime) {
        self.payload = Some(payload);
        self.payload_updated_at = Some(now);
        self.touch(now);
    }

    pub fn set_rssi(&mut self, rssi: i16, now: SystemTime) {
        self.rssi = Some(rssi);
        self.touch(now);
    }
}

/// Shared, lock-protected device handle.
///
/// Attribute updates made through `update` are published on the registry
/// event stream while the device lock is held, so observers see updates in
/// mutation order.
#[derive(Clone)]
pub struct SharedDevice {
    inner: Arc<DeviceCell>,
}

struct DeviceCell {
    device: RwLock<Device>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl SharedDevice {
    pub(crate) fn new(device: Device, events: mpsc::UnboundedSender<RegistryEvent>) -> Self {
        Self {
            inner: Arc::new(DeviceCell {
                device: RwLock::new(device),
                events,
            }),
        }
    }

    pub fn identifier(&self) -> TargetIdentifier {
        self.inner.device.read().identifier.clone()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Device> {
        self.inner.device.read()
    }

    /// Point-in-time copy of the device
    pub fn snapshot(&self) -> Device {
        self.inner.device.read().clone()
    }

    pub fn ptr_eq(&self, other: &SharedDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Mutate and publish an update for `attribute`
    pub fn update<R>(&self, attribute: DeviceAttribute, f: impl FnOnce(&mut Device) -> R) -> R {
        let mut device = self.inner.device.write();
        let result = f(&mut device);
        let _ = self
            .inner
            .events
            .send(RegistryEvent::Updated(self.clone(), attribute));
        result
    }

    /// Mutate without publishing (bookkeeping fields only)
    pub fn modify<R>(&self, f: impl FnOnce(&mut Device) -> R) -> R {
        let mut device = self.inner.device.write();
        f(&mut device)
    }

    pub(crate) fn publish(&self, event: RegistryEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn set_rssi(&self, rssi: i16, now: SystemTime) {
        self.update(DeviceAttribute::Rssi, |d| d.set_rssi(rssi, now));
    }

    pub fn set_tx_power(&self, tx_power: i16, now: SystemTime) {
        let changed = self.modify(|d| d.tx_power != Some(tx_power));
        if changed {
            self.update(DeviceAttribute::TxPower, |d| {
                d.tx_power = Some(tx_power);
                d.touch(now);
            });
        }
    }

    pub fn set_payload(&self, payload: PayloadData, now: SystemTime) {
        self.update(DeviceAttribute::Payload, |d| d.set_payload(payload, now));
    }

    pub fn set_operating_system(
        &self,
        operating_system: DeviceOperatingSystem,
        now: SystemTime,
        backoff: &IgnoreBackoff,
    ) {
        let mut device = self.inner.device.write();
        let previous = device.operating_system;
        if device.set_operating_system(operating_system, now, backoff) {
            tracing::debug!(
                "Device {} operating system {} -> {}",
                device.identifier,
                previous,
                operating_system
            );
            let _ = self.inner.events.send(RegistryEvent::Updated(
                self.clone(),
                DeviceAttribute::OperatingSystem,
            ));
        }
    }

    pub fn set_role(&self, role: DeviceRole, now: SystemTime) {
        let mut device = self.inner.device.write();
        if device.role != role {
            device.role = role;
            device.touch(now);
            let _ = self
                .inner
                .events
                .send(RegistryEvent::Updated(self.clone(), DeviceAttribute::Role));
        }
    }

    pub fn set_state(&self, state: DeviceState, now: SystemTime) -> Result<(), DeviceError> {
        let mut device = self.inner.device.write();
        if device.transition(state, now)? {
            let _ = self
                .inner
                .events
                .send(RegistryEvent::Updated(self.clone(), DeviceAttribute::State));
        }
        Ok(())
    }

    /// `Device::begin_connect` under the write lock
    pub fn try_begin_connect(&self, now: SystemTime) -> Result<(), DeviceError> {
        let mut device = self.inner.device.write();
        device.begin_connect(now)?;
        let _ = self
            .inner
            .events
            .send(RegistryEvent::Updated(self.clone(), DeviceAttribute::State));
        Ok(())
    }

    pub fn force_disconnected(&self, now: SystemTime) {
        let mut device = self.inner.device.write();
        if device.force_disconnected(now) {
            let _ = self
                .inner
                .events
                .send(RegistryEvent::Updated(self.clone(), DeviceAttribute::State));
        }
    }
}

impl fmt::Debug for SharedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let device = self.inner.device.read();
        f.debug_struct("SharedDevice")
            .field("identifier", &device.identifier)
            .field("state", &device.state)
            .field("operating_system", &device.operating_system)
            .finish()
    }
}
