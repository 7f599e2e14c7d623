/// GATT service definition for the proximity protocol
///
/// This module provides the proximity service layout (signal, payload and
/// optional legacy characteristics), fixed-size write fragmentation for
/// android-style signal writes, reassembly, the per-device outbound fragment
/// queue and the server-side trait the radio driver calls into.

use crate::config::{PlatformFlavor, ProximityConfig, DEVICE_NAME_CHARACTERISTIC_UUID, MODEL_CHARACTERISTIC_UUID};
use crate::device::{CharacteristicRef, TargetIdentifier};
use crate::transport::ble::radio::WriteType;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use uuid::Uuid;

/// Maximum GATT characteristic value size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// Default maximum queued fragments before backpressure
pub const DEFAULT_MAX_OUTSTANDING_WRITES: usize = 1024;

/// Characteristics the protocol knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattCharacteristic {
    /// Write-only signal characteristic; the flavour sets the write style
    Signal(PlatformFlavor),
    /// Read-only identity payload
    Payload,
    /// Predecessor protocol payload
    LegacyPayload,
    DeviceName,
    Model,
}

impl GattCharacteristic {
    /// Characteristic UUID under `config`
    pub fn uuid(&self, config: &ProximityConfig) -> Uuid {
        match self {
            GattCharacteristic::Signal(PlatformFlavor::Android) => {
                config.android_signal_characteristic_uuid
            }
            GattCharacteristic::Signal(PlatformFlavor::Ios) => config.ios_signal_characteristic_uuid,
            GattCharacteristic::Payload => config.payload_characteristic_uuid,
            GattCharacteristic::LegacyPayload => config.interop.payload_characteristic_uuid,
            GattCharacteristic::DeviceName => DEVICE_NAME_CHARACTERISTIC_UUID,
            GattCharacteristic::Model => MODEL_CHARACTERISTIC_UUID,
        }
    }

    /// Identify a characteristic UUID found during discovery
    pub fn from_uuid(uuid: Uuid, config: &ProximityConfig) -> Option<Self> {
        [
            GattCharacteristic::Signal(PlatformFlavor::Android),
            GattCharacteristic::Signal(PlatformFlavor::Ios),
            GattCharacteristic::Payload,
            GattCharacteristic::LegacyPayload,
            GattCharacteristic::DeviceName,
            GattCharacteristic::Model,
        ]
        .into_iter()
        .find(|c| c.uuid(config) == uuid)
    }
}

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Write queue full (backpressure)")]
    WriteQueueFull,
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
    #[error("Fragmentation error: {0}")]
    FragmentationError(String),
    #[error("Invalid characteristic {0}")]
    InvalidCharacteristic(Uuid),
    #[error("Invalid offset {offset} for value of {length} bytes")]
    InvalidOffset { offset: usize, length: usize },
    #[error("GATT server not enabled")]
    Disabled,
}

/// Properties of a served characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Service handed to the radio when the GATT server starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceDefinition {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristicDefinition>,
}

impl GattServiceDefinition {
    /// Proximity service: our signal characteristic (write) and the payload
    /// characteristic (read)
    pub fn proximity(config: &ProximityConfig) -> Self {
        Self {
            uuid: config.service_uuid,
            characteristics: vec![
                GattCharacteristicDefinition {
                    uuid: config.local_signal_characteristic_uuid(),
                    properties: CharacteristicProperties {
                        read: false,
                        write: true,
                        write_without_response: true,
                    },
                },
                GattCharacteristicDefinition {
                    uuid: config.payload_characteristic_uuid,
                    properties: CharacteristicProperties {
                        read: true,
                        ..CharacteristicProperties::default()
                    },
                },
            ],
        }
    }

    /// Legacy service, served only when interop is enabled
    pub fn legacy(config: &ProximityConfig) -> Option<Self> {
        if !config.interop.enabled {
            return None;
        }
        Some(Self {
            uuid: config.interop.service_uuid,
            characteristics: vec![GattCharacteristicDefinition {
                uuid: config.interop.payload_characteristic_uuid,
                properties: CharacteristicProperties {
                    read: true,
                    ..CharacteristicProperties::default()
                },
            }],
        })
    }
}

/// Splits a signal write into fixed-size chunks. Chunks carry no header:
/// the receiver reassembles by concatenation and the message's own length
/// field tells it when it is complete.
pub struct GattFragmenter;

impl GattFragmenter {
    pub fn fragment(data: &[u8], chunk: usize) -> Result<Vec<Vec<u8>>, GattError> {
        if chunk == 0 {
            return Err(GattError::FragmentationError(
                "Chunk size must be > 0".to_string(),
            ));
        }
        if data.is_empty() {
            return Ok(vec![Vec::new()]);
        }
        Ok(data.chunks(chunk).map(|c| c.to_vec()).collect())
    }
}

/// Collects chunks back into the original buffer
pub struct GattReassembler;

impl GattReassembler {
    pub fn reassemble(fragments: &[Vec<u8>]) -> Vec<u8> {
        fragments.concat()
    }
}

/// One queued characteristic write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWriteRequest {
    pub characteristic: CharacteristicRef,
    pub data: Vec<u8>,
    pub write_type: WriteType,
}

impl GattWriteRequest {
    pub fn new(
        characteristic: CharacteristicRef,
        data: Vec<u8>,
        write_type: WriteType,
    ) -> Result<Self, GattError> {
        if data.len() > MAX_CHARACTERISTIC_SIZE {
            return Err(GattError::FragmentationError(
                "Data exceeds characteristic size".to_string(),
            ));
        }
        Ok(Self {
            characteristic,
            data,
            write_type,
        })
    }
}

/// Outbound fragment queue of the write in flight, with backpressure
#[derive(Debug, Clone)]
pub struct GattWriteQueue {
    queue: VecDeque<GattWriteRequest>,
    max_outstanding: usize,
}

impl GattWriteQueue {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_outstanding,
        }
    }

    pub fn new_default() -> Self {
        Self::new(DEFAULT_MAX_OUTSTANDING_WRITES)
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a write request (returns error if queue is full)
    pub fn enqueue(&mut self, request: GattWriteRequest) -> Result<(), GattError> {
        if self.is_full() {
            return Err(GattError::WriteQueueFull);
        }
        self.queue.push_back(request);
        Ok(())
    }

    /// Queue `data` as `chunk`-sized writes to `characteristic`. Nothing is
    /// queued if the fragments do not all fit.
    pub fn enqueue_fragmented(
        &mut self,
        characteristic: CharacteristicRef,
        data: &[u8],
        chunk: usize,
        write_type: WriteType,
    ) -> Result<usize, GattError> {
        let fragments = GattFragmenter::fragment(data, chunk)?;
        if self.queue.len() + fragments.len() > self.max_outstanding {
            return Err(GattError::WriteQueueFull);
        }
        let count = fragments.len();
        for fragment in fragments {
            self.queue
                .push_back(GattWriteRequest::new(characteristic, fragment, write_type)?);
        }
        Ok(count)
    }

    pub fn dequeue(&mut self) -> Option<GattWriteRequest> {
        self.queue.pop_front()
    }

    pub fn peek(&self) -> Option<&GattWriteRequest> {
        self.queue.front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Server side of the proximity service, called by the radio driver for
/// every request from a connected central
pub trait GattServer: Send + Sync {
    /// Handle a write to a characteristic
    fn on_write(
        &self,
        central: &TargetIdentifier,
        characteristic: Uuid,
        offset: usize,
        value: &[u8],
    ) -> Result<(), GattError>;

    /// Handle a read from a characteristic starting at `offset`
    fn on_read(
        &self,
        central: &TargetIdentifier,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, GattError>;

    /// A central went away; drop anything held for it
    fn on_disconnect(&self, central: &TargetIdentifier);

    /// Check if the GATT service is enabled
    fn is_enabled(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn signal_ref() -> CharacteristicRef {
        let config = ProximityConfig::default();
        CharacteristicRef {
            service: config.service_uuid,
            characteristic: config.android_signal_characteristic_uuid,
        }
    }

    #[test]
    fn test_characteristic_uuids_roundtrip() {
        let mut config = ProximityConfig::default();
        config.interop.enabled = true;
        for characteristic in [
            GattCharacteristic::Signal(PlatformFlavor::Android),
            GattCharacteristic::Signal(PlatformFlavor::Ios),
            GattCharacteristic::Payload,
            GattCharacteristic::LegacyPayload,
            GattCharacteristic::DeviceName,
            GattCharacteristic::Model,
        ] {
            assert_eq!(
                GattCharacteristic::from_uuid(characteristic.uuid(&config), &config),
                Some(characteristic)
            );
        }
        assert_eq!(GattCharacteristic::from_uuid(Uuid::nil(), &config), None);
    }

    #[test]
    fn test_proximity_service_definition() {
        let config = ProximityConfig::default();
        let service = GattServiceDefinition::proximity(&config);

        assert_eq!(service.uuid, config.service_uuid);
        assert_eq!(service.characteristics.len(), 2);
        assert!(service.characteristics[0].properties.write);
        assert!(service.characteristics[1].properties.read);
        assert!(GattServiceDefinition::legacy(&config).is_none());
    }

    #[test]
    fn test_fragmenter_fixed_chunks() {
        let data: Vec<u8> = (0..45).collect();
        let fragments = GattFragmenter::fragment(&data, 20).expect("Fragmentation");

        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].len(), 20);
        assert_eq!(fragments[2].len(), 5);
    }

    #[test]
    fn test_fragmenter_rejects_zero_chunk() {
        assert!(GattFragmenter::fragment(&[1, 2, 3], 0).is_err());
    }

    #[test]
    fn test_fragmenter_empty_message() {
        let fragments = GattFragmenter::fragment(&[], 20).expect("Fragmentation");
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_empty());
    }

    #[test]
    fn test_write_request_max_size() {
        let data = vec![0u8; MAX_CHARACTERISTIC_SIZE + 1];
        assert!(GattWriteRequest::new(signal_ref(), data, WriteType::WithResponse).is_err());
    }

    #[test]
    fn test_write_queue_fragmented_fifo() {
        let mut queue = GattWriteQueue::new_default();
        let data: Vec<u8> = (0..50).collect();
        let count = queue
            .enqueue_fragmented(signal_ref(), &data, 20, WriteType::WithResponse)
            .expect("Enqueue");

        assert_eq!(count, 3);
        assert_eq!(queue.peek().expect("Peek").data[0], 0);
        assert_eq!(queue.dequeue().expect("Dequeue").data.len(), 20);
        assert_eq!(queue.dequeue().expect("Dequeue").data[0], 20);
        assert_eq!(queue.dequeue().expect("Dequeue").data.len(), 10);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_write_queue_backpressure_is_all_or_nothing() {
        let mut queue = GattWriteQueue::new(2);
        let result = queue.enqueue_fragmented(signal_ref(), &[0u8; 60], 20, WriteType::WithResponse);

        assert_eq!(result, Err(GattError::WriteQueueFull));
        assert!(queue.is_empty());

        queue
            .enqueue(GattWriteRequest::new(signal_ref(), vec![1], WriteType::WithResponse).expect("Request"))
            .expect("Enqueue");
        queue
            .enqueue(GattWriteRequest::new(signal_ref(), vec![2], WriteType::WithResponse).expect("Request"))
            .expect("Enqueue");
        assert!(queue.is_full());
        queue.clear();
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_fragment_then_reassemble_is_identity(
            data in proptest::collection::vec(any::<u8>(), 0..1024),
            chunk in 1usize..64,
        ) {
            let fragments = GattFragmenter::fragment(&data, chunk).expect("Fragmentation");
            prop_assert!(fragments.iter().all(|f| f.len() <= chunk));
            prop_assert_eq!(GattReassembler::reassemble(&fragments), data);
        }
    }
}
