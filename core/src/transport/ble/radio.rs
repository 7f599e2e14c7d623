/// BLE radio driver abstraction
///
/// The host platform owns the actual radio. It implements `BleRadio` for the
/// commands the protocol issues (scan, advertise, GATT client and server
/// lifecycle) and feeds radio events back through the session
/// (`on_scan_result`, `on_radio_state`, and the `GattServer` callbacks).
/// Every command completes asynchronously with success or an error.

use super::advert::{AdvertData, AdvertError, ManufacturerData};
use super::beacon::AdvertisingData;
use super::gatt::{GattError, GattServiceDefinition};
use crate::config::ProximityConfig;
use crate::device::{CharacteristicRef, TargetIdentifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Bluetooth powered off")]
    PoweredOff,
    #[error("Operation not supported: {0}")]
    Unsupported(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Radio operation failed: {0}")]
    OperationFailed(String),
    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),
}

/// Power state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    Unknown,
    PoweredOn,
    PoweredOff,
    Unsupported,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Unknown => write!(f, "unknown"),
            RadioState::PoweredOn => write!(f, "powered_on"),
            RadioState::PoweredOff => write!(f, "powered_off"),
            RadioState::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Characteristic write style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// One scan result as delivered by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub identifier: TargetIdentifier,
    pub rssi: i16,
    pub tx_power: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Vec<ManufacturerData>,
    pub local_name: Option<String>,
}

impl ScanRecord {
    pub fn new(identifier: TargetIdentifier, rssi: i16) -> Self {
        Self {
            identifier,
            rssi,
            tx_power: None,
            service_uuids: Vec::new(),
            manufacturer_data: Vec::new(),
            local_name: None,
        }
    }

    /// Build from raw advertisement bytes
    pub fn from_raw(identifier: TargetIdentifier, rssi: i16, raw: &[u8]) -> Result<Self, AdvertError> {
        let advert = AdvertData::parse(raw)?;
        Ok(Self {
            identifier,
            rssi,
            tx_power: advert.tx_power().map(i16::from),
            service_uuids: advert.service_uuids(),
            manufacturer_data: advert.manufacturer_data(),
            local_name: advert.local_name(),
        })
    }

    /// Manufacturer data bytes for `manufacturer_id`, if present
    pub fn manufacturer(&self, manufacturer_id: u16) -> Option<&[u8]> {
        self.manufacturer_data
            .iter()
            .find(|m| m.manufacturer_id == manufacturer_id)
            .map(|m| m.data.as_slice())
    }
}

/// Scan filter: a record passes if it matches any entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_ids: Vec<u16>,
}

impl ScanFilter {
    /// Cooperating vendor code, proximity service, and the legacy service
    /// when interop is enabled
    pub fn for_config(config: &ProximityConfig) -> Self {
        let mut filter = Self {
            service_uuids: vec![config.service_uuid],
            manufacturer_ids: vec![config.cooperating_manufacturer_id],
        };
        if config.interop.enabled {
            filter.service_uuids.push(config.interop.service_uuid);
            filter.manufacturer_ids.push(config.interop.manufacturer_id);
        }
        filter
    }

    pub fn accepts(&self, record: &ScanRecord) -> bool {
        record
            .service_uuids
            .iter()
            .any(|uuid| self.service_uuids.contains(uuid))
            || record
                .manufacturer_data
                .iter()
                .any(|m| self.manufacturer_ids.contains(&m.manufacturer_id))
    }
}

/// Service found on a remote GATT server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl DiscoveredService {
    pub fn characteristic_refs(&self) -> impl Iterator<Item = CharacteristicRef> + '_ {
        self.characteristics.iter().map(move |c| CharacteristicRef {
            service: self.uuid,
            characteristic: *c,
        })
    }
}

/// Platform-specific BLE radio
#[async_trait]
pub trait BleRadio: Send + Sync {
    fn state(&self) -> RadioState;

    /// Whether this device can advertise (peripheral role)
    fn is_transmit_supported(&self) -> bool;

    async fn start_scan(&self, filter: &ScanFilter) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn start_advertising(&self, data: &AdvertisingData) -> Result<(), RadioError>;

    async fn stop_advertising(&self) -> Result<(), RadioError>;

    async fn start_gatt_server(&self, services: &[GattServiceDefinition]) -> Result<(), RadioError>;

    async fn stop_gatt_server(&self) -> Result<(), RadioError>;

    async fn connect(&self, device: &TargetIdentifier) -> Result<(), RadioError>;

    async fn disconnect(&self, device: &TargetIdentifier) -> Result<(), RadioError>;

    async fn discover_services(
        &self,
        device: &TargetIdentifier,
    ) -> Result<Vec<DiscoveredService>, RadioError>;

    /// Returns the negotiated MTU
    async fn request_mtu(&self, device: &TargetIdentifier, mtu: u16) -> Result<u16, RadioError>;

    async fn read_characteristic(
        &self,
        device: &TargetIdentifier,
        characteristic: CharacteristicRef,
    ) -> Result<Vec<u8>, RadioError>;

    async fn write_characteristic(
        &self,
        device: &TargetIdentifier,
        characteristic: CharacteristicRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_record_from_raw() {
        let config = ProximityConfig::default();
        let raw = AdvertData::default()
            .with_service_uuid(config.service_uuid)
            .with_manufacturer_data(config.sensor_manufacturer_id, &[1, 2, 3, 4, 5, 6])
            .with_tx_power(-4)
            .encode()
            .expect("encode");

        let record = ScanRecord::from_raw("AA".into(), -60, &raw).expect("record");
        assert_eq!(record.service_uuids, vec![config.service_uuid]);
        assert_eq!(record.tx_power, Some(-4));
        assert_eq!(
            record.manufacturer(config.sensor_manufacturer_id),
            Some(&[1u8, 2, 3, 4, 5, 6][..])
        );
        assert!(record.manufacturer(76).is_none());
    }

    #[test]
    fn test_scan_filter() {
        let mut config = ProximityConfig::default();
        let filter = ScanFilter::for_config(&config);

        let mut apple = ScanRecord::new("A".into(), -50);
        apple.manufacturer_data.push(ManufacturerData {
            manufacturer_id: 76,
            data: vec![],
        });
        let mut legacy = ScanRecord::new("L".into(), -50);
        legacy.service_uuids.push(config.interop.service_uuid);

        assert!(filter.accepts(&apple));
        assert!(!filter.accepts(&legacy));
        assert!(!filter.accepts(&ScanRecord::new("X".into(), -50)));

        config.interop.enabled = true;
        assert!(ScanFilter::for_config(&config).accepts(&legacy));
    }

    #[test]
    fn test_radio_state() {
        assert!(RadioState::PoweredOn.is_powered_on());
        assert!(!RadioState::Unknown.is_powered_on());
        assert_eq!(RadioState::PoweredOff.to_string(), "powered_off");
    }
}
