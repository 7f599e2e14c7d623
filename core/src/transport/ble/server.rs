/// GATT server side of the proximity service
///
/// Peers connect to us and write signal messages (their payload, RSSI,
/// relayed payloads, immediate-send data) or read our identity payload.
/// Writes may arrive in fixed-size chunks and are reassembled per central.

use super::codec::{SignalMessage, SignalReassembler};
use super::gatt::{GattError, GattServer, GattServiceDefinition};
use crate::config::ProximityConfig;
use crate::device::{
    DeviceOperatingSystem, DeviceRegistry, DeviceRole, IgnoreBackoff, SharedDevice,
    TargetIdentifier,
};
use crate::payload::{PayloadData, PayloadSupplier};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbound signal events that are not plain device updates
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// `from` relayed payloads of the listed devices
    Shared {
        from: SharedDevice,
        devices: Vec<SharedDevice>,
    },
    /// `from` sent immediate-send data
    Received { from: SharedDevice, data: Vec<u8> },
}

pub struct SignalServer {
    registry: DeviceRegistry,
    supplier: Arc<dyn PayloadSupplier>,
    config: RwLock<Arc<ProximityConfig>>,
    enabled: AtomicBool,
    reassembler: Mutex<SignalReassembler>,
    read_cache: Mutex<HashMap<(TargetIdentifier, Uuid), Vec<u8>>>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl SignalServer {
    pub fn new(
        registry: DeviceRegistry,
        supplier: Arc<dyn PayloadSupplier>,
        config: Arc<ProximityConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                supplier,
                config: RwLock::new(config),
                enabled: AtomicBool::new(false),
                reassembler: Mutex::new(SignalReassembler::new()),
                read_cache: Mutex::new(HashMap::new()),
                events,
            },
            receiver,
        )
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            *self.reassembler.lock() = SignalReassembler::new();
            self.read_cache.lock().clear();
        }
    }

    pub fn set_config(&self, config: Arc<ProximityConfig>) {
        *self.config.write() = config;
    }

    /// Services handed to the radio when the server starts
    pub fn services(&self) -> Vec<GattServiceDefinition> {
        let config = self.config.read().clone();
        let mut services = vec![GattServiceDefinition::proximity(&config)];
        services.extend(GattServiceDefinition::legacy(&config));
        services
    }

    fn is_signal(config: &ProximityConfig, characteristic: Uuid) -> bool {
        characteristic == config.android_signal_characteristic_uuid
            || characteristic == config.ios_signal_characteristic_uuid
    }

    fn handle(&self, central: &TargetIdentifier, message: SignalMessage) {
        let now = SystemTime::now();
        let writer = self.registry.get_or_create_by_session_id(central);
        match message {
            SignalMessage::Rssi(rssi) => {
                debug!("Central {} wrote rssi {}", central, rssi);
                writer.set_role(DeviceRole::ReceiveOnly, now);
                writer.set_rssi(rssi, now);
            }
            SignalMessage::Payload(payload) => {
                debug!("Central {} wrote payload {}", central, payload.short_name());
                writer.set_role(DeviceRole::ReceiveOnly, now);
                writer.set_payload(payload, now);
            }
            SignalMessage::PayloadSharing(sharing) => {
                let own = self.supplier.payload(now, None);
                let backoff = IgnoreBackoff::from(&self.config.read().filter);
                let mut devices = Vec::new();
                for payload in self.supplier.payloads(&sharing.data) {
                    if own.as_ref() == Some(&payload) {
                        continue;
                    }
                    let device = self.registry.get_or_create_by_payload(&payload);
                    if device.ptr_eq(&writer) {
                        continue;
                    }
                    if device.identifier().is_synthesized() {
                        device.set_role(DeviceRole::Relayed, now);
                        if device.read().operating_system == DeviceOperatingSystem::Unknown {
                            device.set_operating_system(DeviceOperatingSystem::Shared, now, &backoff);
                        }
                    }
                    device.set_rssi(sharing.rssi, now);
                    devices.push(device);
                }
                info!("Central {} shared {} payloads", central, devices.len());
                if !devices.is_empty() {
                    let _ = self.events.send(ServerEvent::Shared {
                        from: writer,
                        devices,
                    });
                }
            }
            SignalMessage::ImmediateSend(data) => {
                info!("Central {} sent {} bytes", central, data.len());
                writer.modify(|d| d.touch(now));
                let _ = self.events.send(ServerEvent::Received { from: writer, data });
            }
        }
    }

    fn fresh_value(
        &self,
        central: &TargetIdentifier,
        characteristic: Uuid,
        config: &ProximityConfig,
    ) -> Result<Vec<u8>, GattError> {
        let now = SystemTime::now();
        let payload = if characteristic == config.payload_characteristic_uuid {
            self.supplier.payload(now, Some(central.clone()))
        } else {
            self.supplier.legacy_payload(now, Some(central.clone()))
        };
        payload
            .map(PayloadData::into_bytes)
            .ok_or_else(|| GattError::ReadFailed("no payload available".to_string()))
    }
}

impl GattServer for SignalServer {
    fn on_write(
        &self,
        central: &TargetIdentifier,
        characteristic: Uuid,
        _offset: usize,
        value: &[u8],
    ) -> Result<(), GattError> {
        if !self.is_enabled() {
            return Err(GattError::Disabled);
        }
        let config = self.config.read().clone();
        if !Self::is_signal(&config, characteristic) {
            return Err(GattError::InvalidCharacteristic(characteristic));
        }

        let pushed = self.reassembler.lock().push(central, value, Instant::now());
        match pushed {
            Ok(Some(message)) => {
                self.handle(central, message);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!("Discarding signal from {}: {}", central, e);
                Err(GattError::WriteFailed(e.to_string()))
            }
        }
    }

    fn on_read(
        &self,
        central: &TargetIdentifier,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, GattError> {
        if !self.is_enabled() {
            return Err(GattError::Disabled);
        }
        let config = self.config.read().clone();
        let legacy = config.interop.enabled
            && characteristic == config.interop.payload_characteristic_uuid;
        if characteristic != config.payload_characteristic_uuid && !legacy {
            return Err(GattError::InvalidCharacteristic(characteristic));
        }

        let key = (central.clone(), characteristic);
        let value = {
            let cached = self.read_cache.lock().get(&key).cloned();
            match cached {
                Some(value) if offset > 0 => value,
                _ => {
                    let value = self.fresh_value(central, characteristic, &config)?;
                    self.read_cache.lock().insert(key, value.clone());
                    value
                }
            }
        };

        if offset > value.len() {
            return Err(GattError::InvalidOffset {
                offset,
                length: value.len(),
            });
        }
        Ok(value[offset..].to_vec())
    }

    fn on_disconnect(&self, central: &TargetIdentifier) {
        self.reassembler.lock().discard(central);
        self.read_cache.lock().retain(|(c, _), _| c != central);
        debug!("Central {} disconnected from server", central);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
