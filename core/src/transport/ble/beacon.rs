/// Proximity beacon: the advertisement we broadcast
///
/// The beacon carries the proximity service UUID and, under the sensor
/// manufacturer code, a six-byte pseudo-address. The pseudo-address rotates
/// every refresh period (default 15 minutes) so peers can follow us across
/// radio address changes without a long-lived identifier.

use super::advert::AdvertData;
use super::radio::ScanRecord;
use crate::config::ProximityConfig;
use crate::device::PseudoDeviceAddress;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Manufacturer payload of the beacon is capped at six bytes
pub const MAX_BEACON_MANUFACTURER_BYTES: usize = PseudoDeviceAddress::LENGTH;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleBeaconError {
    #[error("Manufacturer payload of {0} bytes exceeds beacon limit")]
    PayloadTooLong(usize),
}

/// Advertising parameters handed to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingData {
    pub service_uuid: Uuid,
    pub manufacturer_id: u16,
    pub manufacturer_data: Vec<u8>,
}

impl AdvertisingData {
    pub fn new(
        service_uuid: Uuid,
        manufacturer_id: u16,
        manufacturer_data: Vec<u8>,
    ) -> Result<Self, BleBeaconError> {
        if manufacturer_data.len() > MAX_BEACON_MANUFACTURER_BYTES {
            return Err(BleBeaconError::PayloadTooLong(manufacturer_data.len()));
        }
        Ok(Self {
            service_uuid,
            manufacturer_id,
            manufacturer_data,
        })
    }

    /// Advertisement segments as they go on air
    pub fn to_advert(&self) -> AdvertData {
        AdvertData::default()
            .with_service_uuid(self.service_uuid)
            .with_manufacturer_data(self.manufacturer_id, &self.manufacturer_data)
    }

    pub fn pseudo_address(&self) -> Option<PseudoDeviceAddress> {
        PseudoDeviceAddress::from_bytes(&self.manufacturer_data)
    }
}

/// Builds beacons and rotates the pseudo-address
#[derive(Debug)]
pub struct BeaconBuilder {
    service_uuid: Uuid,
    manufacturer_id: u16,
    rotation_period: Duration,
    current: Option<(PseudoDeviceAddress, SystemTime)>,
}

impl BeaconBuilder {
    pub fn new(config: &ProximityConfig) -> Self {
        Self {
            service_uuid: config.service_uuid,
            manufacturer_id: config.sensor_manufacturer_id,
            rotation_period: Duration::from_secs(config.duty_cycle.advert_refresh_secs),
            current: None,
        }
    }

    pub fn with_rotation_period(mut self, period: Duration) -> Self {
        self.rotation_period = period;
        self
    }

    /// Beacon for `now`, minting a new pseudo-address if none exists yet or
    /// the current one is older than the rotation period
    pub fn build(&mut self, now: SystemTime) -> Result<AdvertisingData, BleBeaconError> {
        let expired = match self.current {
            None => true,
            Some((_, minted)) => now.duration_since(minted).unwrap_or_default() >= self.rotation_period,
        };
        if expired {
            self.rotate(now);
        }
        let address = self
            .current
            .map(|(address, _)| address)
            .unwrap_or_else(PseudoDeviceAddress::random);
        AdvertisingData::new(
            self.service_uuid,
            self.manufacturer_id,
            address.to_bytes().to_vec(),
        )
    }

    /// Force a fresh pseudo-address
    pub fn rotate(&mut self, now: SystemTime) -> PseudoDeviceAddress {
        let address = PseudoDeviceAddress::random();
        debug!("Beacon pseudo-address rotated to {}", address);
        self.current = Some((address, now));
        address
    }

    pub fn current_address(&self) -> Option<PseudoDeviceAddress> {
        self.current.map(|(address, _)| address)
    }
}

/// Extracts the pseudo-address from scan records of sensor beacons
#[derive(Debug, Clone)]
pub struct BeaconParser {
    manufacturer_id: u16,
}

impl BeaconParser {
    pub fn new(config: &ProximityConfig) -> Self {
        Self {
            manufacturer_id: config.sensor_manufacturer_id,
        }
    }

    pub fn pseudo_address(&self, record: &ScanRecord) -> Option<PseudoDeviceAddress> {
        record
            .manufacturer(self.manufacturer_id)
            .and_then(PseudoDeviceAddress::from_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_reuses_address_within_period() {
        let config = ProximityConfig::default();
        let mut builder = BeaconBuilder::new(&config);
        let now = SystemTime::now();

        let first = builder.build(now).expect("beacon");
        let second = builder.build(now + Duration::from_secs(60)).expect("beacon");
        assert_eq!(first, second);
        assert_eq!(first.manufacturer_data.len(), 6);
        assert_eq!(first.manufacturer_id, 65530);
    }

    #[test]
    fn test_build_rotates_after_period() {
        let config = ProximityConfig::default();
        let mut builder = BeaconBuilder::new(&config).with_rotation_period(Duration::from_secs(10));
        let now = SystemTime::now();

        let first = builder.build(now).expect("beacon");
        let rotated = builder.build(now + Duration::from_secs(11)).expect("beacon");
        assert_ne!(first.pseudo_address(), rotated.pseudo_address());
        assert_eq!(builder.current_address(), rotated.pseudo_address());
    }

    #[test]
    fn test_payload_limit() {
        let result = AdvertisingData::new(Uuid::nil(), 1, vec![0; 7]);
        assert_eq!(result, Err(BleBeaconError::PayloadTooLong(7)));
    }

    #[test]
    fn test_parser_reads_broadcast_address() {
        let config = ProximityConfig::default();
        let mut builder = BeaconBuilder::new(&config);
        let beacon = builder.build(SystemTime::now()).expect("beacon");
        let raw = beacon.to_advert().encode().expect("encode");

        let record = ScanRecord::from_raw("peer".into(), -50, &raw).expect("record");
        let parser = BeaconParser::new(&config);
        assert_eq!(parser.pseudo_address(&record), builder.current_address());
        assert!(record.service_uuids.contains(&config.service_uuid));
    }
}
