/// In-memory radio with scripted peers
///
/// Each peer answers scans with an advert matching its behaviour and serves
/// the GATT layout a real device of that kind exposes. Every command is
/// recorded so tests can assert on the exact radio traffic.

use super::advert::AdvertData;
use super::beacon::AdvertisingData;
use super::codec::SignalMessage;
use super::gatt::GattServiceDefinition;
use super::radio::{BleRadio, DiscoveredService, RadioError, RadioState, ScanFilter, ScanRecord, WriteType};
use crate::config::{ProximityConfig, MODEL_CHARACTERISTIC_UUID};
use crate::device::{CharacteristicRef, PseudoDeviceAddress, TargetIdentifier};
use crate::payload::PayloadData;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// How a simulated peer looks and behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedBehaviour {
    /// Proximity service, sensor beacon, android signal characteristic
    Android,
    /// Proximity service, Apple manufacturer data, ios signal characteristic
    Ios,
    /// Predecessor protocol only
    Legacy,
    /// Advertises like an android peer but never completes a connect
    Hang,
    /// Advertises like an android peer, connect fails straight away
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    pub identifier: TargetIdentifier,
    pub behaviour: SimulatedBehaviour,
    pub payload: PayloadData,
    pub rssi: i16,
    pub pseudo_address: PseudoDeviceAddress,
    pub model: Option<String>,
}

impl SimulatedPeer {
    pub fn new(identifier: &str, behaviour: SimulatedBehaviour, payload: PayloadData) -> Self {
        Self {
            identifier: TargetIdentifier::from(identifier),
            behaviour,
            payload,
            rssi: -60,
            pseudo_address: PseudoDeviceAddress::random(),
            model: None,
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    fn advert(&self, config: &ProximityConfig) -> AdvertData {
        match self.behaviour {
            SimulatedBehaviour::Ios => AdvertData::default()
                .with_service_uuid(config.service_uuid)
                .with_manufacturer_data(config.cooperating_manufacturer_id, &[0x01, 0x01, 0x80]),
            SimulatedBehaviour::Legacy => AdvertData::default()
                .with_service_uuid(config.interop.service_uuid)
                .with_manufacturer_data(config.interop.manufacturer_id, &[0x01]),
            _ => AdvertData::default()
                .with_service_uuid(config.service_uuid)
                .with_manufacturer_data(
                    config.sensor_manufacturer_id,
                    &self.pseudo_address.to_bytes(),
                ),
        }
    }

    fn services(&self, config: &ProximityConfig) -> Vec<DiscoveredService> {
        let mut services = match self.behaviour {
            SimulatedBehaviour::Legacy => vec![DiscoveredService {
                uuid: config.interop.service_uuid,
                characteristics: vec![config.interop.payload_characteristic_uuid],
            }],
            SimulatedBehaviour::Ios => vec![DiscoveredService {
                uuid: config.service_uuid,
                characteristics: vec![
                    config.ios_signal_characteristic_uuid,
                    config.payload_characteristic_uuid,
                ],
            }],
            _ => vec![DiscoveredService {
                uuid: config.service_uuid,
                characteristics: vec![
                    config.android_signal_characteristic_uuid,
                    config.payload_characteristic_uuid,
                ],
            }],
        };
        if self.model.is_some() {
            services.push(DiscoveredService {
                uuid: Uuid::from_u128(0x0000180A_0000_1000_8000_00805F9B34FB),
                characteristics: vec![MODEL_CHARACTERISTIC_UUID],
            });
        }
        services
    }
}

/// Every command issued to the simulated radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan,
    StopScan,
    StartAdvertising(AdvertisingData),
    StopAdvertising,
    StartGattServer(usize),
    StopGattServer,
    Connect(TargetIdentifier),
    Disconnect(TargetIdentifier),
    DiscoverServices(TargetIdentifier),
    RequestMtu(TargetIdentifier, u16),
    Read(TargetIdentifier, Uuid),
    Write(TargetIdentifier, Uuid, usize),
}

type ScanCallback = Box<dyn Fn(ScanRecord) + Send + Sync>;

pub struct SimulatedRadio {
    config: ProximityConfig,
    state: RwLock<RadioState>,
    transmit_supported: AtomicBool,
    latency: RwLock<Duration>,
    peers: RwLock<Vec<SimulatedPeer>>,
    calls: Mutex<Vec<RadioCall>>,
    written: Mutex<HashMap<TargetIdentifier, Vec<u8>>>,
    connected: Mutex<HashSet<TargetIdentifier>>,
    on_scan_result: RwLock<Option<ScanCallback>>,
}

impl SimulatedRadio {
    pub fn new(config: ProximityConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RadioState::PoweredOn),
            transmit_supported: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
            peers: RwLock::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            written: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            on_scan_result: RwLock::new(None),
        }
    }

    pub fn add_peer(&self, peer: SimulatedPeer) {
        self.peers.write().push(peer);
    }

    pub fn peers(&self) -> Vec<SimulatedPeer> {
        self.peers.read().clone()
    }

    pub fn set_state(&self, state: RadioState) {
        *self.state.write() = state;
    }

    pub fn set_transmit_supported(&self, supported: bool) {
        self.transmit_supported.store(supported, Ordering::SeqCst);
    }

    /// Delay applied to every GATT client operation
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Where scan results go once scanning starts
    pub fn set_on_scan_result(&self, callback: ScanCallback) {
        *self.on_scan_result.write() = Some(callback);
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn is_connected(&self, identifier: &TargetIdentifier) -> bool {
        self.connected.lock().contains(identifier)
    }

    /// Bytes written to `identifier`, decoded back into signal messages
    pub fn received_messages(&self, identifier: &TargetIdentifier) -> Vec<SignalMessage> {
        let bytes = self.written.lock().get(identifier).cloned().unwrap_or_default();
        let mut messages = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let message = match SignalMessage::decode(&bytes[at..]) {
                Ok(message) => message,
                Err(_) => break,
            };
            at += message.encode().map(|b| b.len()).unwrap_or(bytes.len());
            messages.push(message);
        }
        messages
    }

    /// Scan records the peers would produce right now
    pub fn scan_records(&self) -> Vec<ScanRecord> {
        self.peers
            .read()
            .iter()
            .filter_map(|peer| {
                let raw = peer.advert(&self.config).encode().ok()?;
                ScanRecord::from_raw(peer.identifier.clone(), peer.rssi, &raw).ok()
            })
            .collect()
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().push(call);
    }

    fn ensure_powered(&self) -> Result<(), RadioError> {
        if self.state.read().is_powered_on() {
            Ok(())
        } else {
            Err(RadioError::PoweredOff)
        }
    }

    fn peer(&self, identifier: &TargetIdentifier) -> Result<SimulatedPeer, RadioError> {
        self.peers
            .read()
            .iter()
            .find(|p| &p.identifier == identifier)
            .cloned()
            .ok_or_else(|| RadioError::ConnectionFailed(format!("no such peer {}", identifier)))
    }

    fn ensure_connected(&self, identifier: &TargetIdentifier) -> Result<SimulatedPeer, RadioError> {
        if !self.is_connected(identifier) {
            return Err(RadioError::NotConnected);
        }
        self.peer(identifier)
    }

    async fn delay(&self) {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BleRadio for SimulatedRadio {
    fn state(&self) -> RadioState {
        *self.state.read()
    }

    fn is_transmit_supported(&self) -> bool {
        self.transmit_supported.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<(), RadioError> {
        self.record(RadioCall::StartScan);
        self.ensure_powered()?;
        let records: Vec<ScanRecord> = self
            .scan_records()
            .into_iter()
            .filter(|r| filter.accepts(r))
            .collect();
        if let Some(callback) = self.on_scan_result.read().as_ref() {
            for record in records {
                callback(record);
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.record(RadioCall::StopScan);
        Ok(())
    }

    async fn start_advertising(&self, data: &AdvertisingData) -> Result<(), RadioError> {
        self.record(RadioCall::StartAdvertising(data.clone()));
        self.ensure_powered()?;
        if !self.is_transmit_supported() {
            return Err(RadioError::Unsupported("advertising".to_string()));
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        self.record(RadioCall::StopAdvertising);
        Ok(())
    }

    async fn start_gatt_server(&self, services: &[GattServiceDefinition]) -> Result<(), RadioError> {
        self.record(RadioCall::StartGattServer(services.len()));
        self.ensure_powered()
    }

    async fn stop_gatt_server(&self) -> Result<(), RadioError> {
        self.record(RadioCall::StopGattServer);
        Ok(())
    }

    async fn connect(&self, device: &TargetIdentifier) -> Result<(), RadioError> {
        self.record(RadioCall::Connect(device.clone()));
        self.ensure_powered()?;
        let peer = self.peer(device)?;
        self.delay().await;
        match peer.behaviour {
            SimulatedBehaviour::Hang => futures::future::pending::<Result<(), RadioError>>().await,
            SimulatedBehaviour::Unreachable => {
                Err(RadioError::ConnectionFailed(format!("{} unreachable", device)))
            }
            _ => {
                self.connected.lock().insert(device.clone());
                debug!("Simulated connect to {}", device);
                Ok(())
            }
        }
    }

    async fn disconnect(&self, device: &TargetIdentifier) -> Result<(), RadioError> {
        self.record(RadioCall::Disconnect(device.clone()));
        self.connected.lock().remove(device);
        Ok(())
    }

    async fn discover_services(
        &self,
        device: &TargetIdentifier,
    ) -> Result<Vec<DiscoveredService>, RadioError> {
        self.record(RadioCall::DiscoverServices(device.clone()));
        let peer = self.ensure_connected(device)?;
        self.delay().await;
        Ok(peer.services(&self.config))
    }

    async fn request_mtu(&self, device: &TargetIdentifier, mtu: u16) -> Result<u16, RadioError> {
        self.record(RadioCall::RequestMtu(device.clone(), mtu));
        self.ensure_connected(device)?;
        Ok(mtu)
    }

    async fn read_characteristic(
        &self,
        device: &TargetIdentifier,
        characteristic: CharacteristicRef,
    ) -> Result<Vec<u8>, RadioError> {
        self.record(RadioCall::Read(device.clone(), characteristic.characteristic));
        let peer = self.ensure_connected(device)?;
        self.delay().await;

        let uuid = characteristic.characteristic;
        if uuid == self.config.payload_characteristic_uuid
            || uuid == self.config.interop.payload_characteristic_uuid
        {
            return Ok(peer.payload.as_bytes().to_vec());
        }
        if uuid == MODEL_CHARACTERISTIC_UUID {
            if let Some(model) = peer.model {
                return Ok(model.into_bytes());
            }
        }
        Err(RadioError::OperationFailed(format!("{} not readable", uuid)))
    }

    async fn write_characteristic(
        &self,
        device: &TargetIdentifier,
        characteristic: CharacteristicRef,
        data: &[u8],
        _write_type: WriteType,
    ) -> Result<(), RadioError> {
        self.record(RadioCall::Write(
            device.clone(),
            characteristic.characteristic,
            data.len(),
        ));
        self.ensure_connected(device)?;
        self.delay().await;
        self.written
            .lock()
            .entry(device.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_emits_filtered_records() {
        let config = ProximityConfig::default();
        let radio = SimulatedRadio::new(config.clone());
        radio.add_peer(SimulatedPeer::new("a", SimulatedBehaviour::Android, PayloadData::new(vec![1; 8])));
        radio.add_peer(SimulatedPeer::new("l", SimulatedBehaviour::Legacy, PayloadData::new(vec![2; 8])));

        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        radio.set_on_scan_result(Box::new(move |r| sink.lock().push(r.identifier)));
        radio
            .start_scan(&ScanFilter::for_config(&config))
            .await
            .expect("scan");

        // legacy peer filtered out while interop is disabled
        assert_eq!(*seen.lock(), vec![TargetIdentifier::from("a")]);
        assert_eq!(radio.calls(), vec![RadioCall::StartScan]);
    }

    #[tokio::test]
    async fn test_gatt_requires_connection() {
        let radio = SimulatedRadio::new(ProximityConfig::default());
        radio.add_peer(SimulatedPeer::new("a", SimulatedBehaviour::Android, PayloadData::new(vec![1; 8])));
        let id = TargetIdentifier::from("a");

        assert_eq!(radio.discover_services(&id).await, Err(RadioError::NotConnected));
        radio.connect(&id).await.expect("connect");
        assert!(radio.is_connected(&id));
        assert_eq!(radio.discover_services(&id).await.expect("services").len(), 1);
        radio.disconnect(&id).await.expect("disconnect");
        assert!(!radio.is_connected(&id));
    }

    #[tokio::test]
    async fn test_powered_off_rejects() {
        let radio = SimulatedRadio::new(ProximityConfig::default());
        radio.set_state(RadioState::PoweredOff);
        assert_eq!(
            radio.start_scan(&ScanFilter::default()).await,
            Err(RadioError::PoweredOff)
        );
    }

    #[tokio::test]
    async fn test_received_messages_decode_concatenated_writes() {
        let config = ProximityConfig::default();
        let radio = SimulatedRadio::new(config.clone());
        radio.add_peer(SimulatedPeer::new("a", SimulatedBehaviour::Android, PayloadData::new(vec![1; 8])));
        let id = TargetIdentifier::from("a");
        let signal = CharacteristicRef {
            service: config.service_uuid,
            characteristic: config.android_signal_characteristic_uuid,
        };
        radio.connect(&id).await.expect("connect");

        let rssi = SignalMessage::Rssi(-30).encode().expect("encode");
        let payload = SignalMessage::Payload(PayloadData::new(vec![5; 30])).encode().expect("encode");
        radio.write_characteristic(&id, signal, &rssi, WriteType::WithResponse).await.expect("write");
        for chunk in payload.chunks(20) {
            radio.write_characteristic(&id, signal, chunk, WriteType::WithResponse).await.expect("write");
        }

        assert_eq!(
            radio.received_messages(&id),
            vec![
                SignalMessage::Rssi(-30),
                SignalMessage::Payload(PayloadData::new(vec![5; 30]))
            ]
        );
    }
}
