/// Advertisement data codec
///
/// Raw BLE advertisement / scan response bytes are a sequence of
/// `[length][type][data...]` segments, where `length` covers the type byte
/// and the data. This module parses those segments, builds them for our own
/// adverts, and splits Apple manufacturer data into its
/// `[type][length][data...]` sub-segments for the device filter.

use thiserror::Error;
use uuid::Uuid;

/// Flags (0x01)
pub const SEGMENT_FLAGS: u8 = 0x01;
/// Incomplete / complete list of 16-bit service UUIDs
pub const SEGMENT_SERVICE_UUID16_INCOMPLETE: u8 = 0x02;
pub const SEGMENT_SERVICE_UUID16_COMPLETE: u8 = 0x03;
/// Incomplete / complete list of 32-bit service UUIDs
pub const SEGMENT_SERVICE_UUID32_INCOMPLETE: u8 = 0x04;
pub const SEGMENT_SERVICE_UUID32_COMPLETE: u8 = 0x05;
/// Incomplete / complete list of 128-bit service UUIDs
pub const SEGMENT_SERVICE_UUID128_INCOMPLETE: u8 = 0x06;
pub const SEGMENT_SERVICE_UUID128_COMPLETE: u8 = 0x07;
/// Shortened / complete local name
pub const SEGMENT_NAME_SHORT: u8 = 0x08;
pub const SEGMENT_NAME_COMPLETE: u8 = 0x09;
/// TX power level (0x0A)
pub const SEGMENT_TX_POWER: u8 = 0x0A;
/// Manufacturer specific data (0xFF)
pub const SEGMENT_MANUFACTURER_DATA: u8 = 0xFF;

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertError {
    #[error("Segment at offset {offset} declares {declared} bytes, only {available} remain")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("Segment data too long: {0} bytes")]
    SegmentTooLong(usize),
}

/// One advertisement segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertSegment {
    pub segment_type: u8,
    pub data: Vec<u8>,
}

impl AdvertSegment {
    pub fn new(segment_type: u8, data: Vec<u8>) -> Self {
        Self { segment_type, data }
    }
}

/// Manufacturer specific data: LE company identifier + payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub manufacturer_id: u16,
    pub data: Vec<u8>,
}

/// Parsed advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertData {
    pub segments: Vec<AdvertSegment>,
}

fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

impl AdvertData {
    /// Parse raw advertisement bytes. A zero length byte ends the data
    /// (trailing padding).
    pub fn parse(raw: &[u8]) -> Result<Self, AdvertError> {
        let mut segments = Vec::new();
        let mut offset = 0;
        while offset < raw.len() {
            let length = raw[offset] as usize;
            if length == 0 {
                break;
            }
            let available = raw.len() - offset - 1;
            if length > available {
                return Err(AdvertError::Truncated {
                    offset,
                    declared: length,
                    available,
                });
            }
            let segment_type = raw[offset + 1];
            let data = raw[offset + 2..offset + 1 + length].to_vec();
            segments.push(AdvertSegment { segment_type, data });
            offset += 1 + length;
        }
        Ok(Self { segments })
    }

    /// Serialize segments back to raw bytes
    pub fn encode(&self) -> Result<Vec<u8>, AdvertError> {
        let mut raw = Vec::new();
        for segment in &self.segments {
            // length byte covers type + data
            if segment.data.len() > u8::MAX as usize - 1 {
                return Err(AdvertError::SegmentTooLong(segment.data.len()));
            }
            raw.push((segment.data.len() + 1) as u8);
            raw.push(segment.segment_type);
            raw.extend_from_slice(&segment.data);
        }
        Ok(raw)
    }

    pub fn push(&mut self, segment: AdvertSegment) {
        self.segments.push(segment);
    }

    /// Add a complete 128-bit service UUID list with one entry
    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        let mut data = uuid.as_bytes().to_vec();
        data.reverse();
        self.push(AdvertSegment::new(SEGMENT_SERVICE_UUID128_COMPLETE, data));
        self
    }

    pub fn with_manufacturer_data(mut self, manufacturer_id: u16, payload: &[u8]) -> Self {
        let mut data = manufacturer_id.to_le_bytes().to_vec();
        data.extend_from_slice(payload);
        self.push(AdvertSegment::new(SEGMENT_MANUFACTURER_DATA, data));
        self
    }

    pub fn with_tx_power(mut self, tx_power: i8) -> Self {
        self.push(AdvertSegment::new(SEGMENT_TX_POWER, vec![tx_power as u8]));
        self
    }

    pub fn with_local_name(mut self, name: &str) -> Self {
        self.push(AdvertSegment::new(SEGMENT_NAME_COMPLETE, name.as_bytes().to_vec()));
        self
    }

    /// All advertised service UUIDs, expanded to 128 bits
    pub fn service_uuids(&self) -> Vec<Uuid> {
        let mut uuids = Vec::new();
        for segment in &self.segments {
            match segment.segment_type {
                SEGMENT_SERVICE_UUID16_INCOMPLETE | SEGMENT_SERVICE_UUID16_COMPLETE => {
                    for chunk in segment.data.chunks_exact(2) {
                        let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                        uuids.push(uuid_from_short(short as u32));
                    }
                }
                SEGMENT_SERVICE_UUID32_INCOMPLETE | SEGMENT_SERVICE_UUID32_COMPLETE => {
                    for chunk in segment.data.chunks_exact(4) {
                        let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        uuids.push(uuid_from_short(short));
                    }
                }
                SEGMENT_SERVICE_UUID128_INCOMPLETE | SEGMENT_SERVICE_UUID128_COMPLETE => {
                    for chunk in segment.data.chunks_exact(16) {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(chunk);
                        bytes.reverse();
                        uuids.push(Uuid::from_bytes(bytes));
                    }
                }
                _ => {}
            }
        }
        uuids
    }

    pub fn manufacturer_data(&self) -> Vec<ManufacturerData> {
        self.segments
            .iter()
            .filter(|s| s.segment_type == SEGMENT_MANUFACTURER_DATA && s.data.len() >= 2)
            .map(|s| ManufacturerData {
                manufacturer_id: u16::from_le_bytes([s.data[0], s.data[1]]),
                data: s.data[2..].to_vec(),
            })
            .collect()
    }

    pub fn tx_power(&self) -> Option<i8> {
        self.segments
            .iter()
            .find(|s| s.segment_type == SEGMENT_TX_POWER && !s.data.is_empty())
            .map(|s| s.data[0] as i8)
    }

    pub fn local_name(&self) -> Option<String> {
        self.segments
            .iter()
            .find(|s| {
                s.segment_type == SEGMENT_NAME_COMPLETE || s.segment_type == SEGMENT_NAME_SHORT
            })
            .map(|s| String::from_utf8_lossy(&s.data).into_owned())
    }
}

/// Sub-segment of Apple manufacturer data: `[type][length][data...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppleSegment {
    pub segment_type: u8,
    pub data: Vec<u8>,
    /// Type, length and data as received
    pub raw: Vec<u8>,
}

impl AppleSegment {
    /// Split manufacturer data (without company id) into sub-segments. A
    /// truncated trailing segment is dropped.
    pub fn parse_all(data: &[u8]) -> Vec<AppleSegment> {
        let mut segments = Vec::new();
        let mut offset = 0;
        while offset + 2 <= data.len() {
            let segment_type = data[offset];
            let length = data[offset + 1] as usize;
            let end = offset + 2 + length;
            if end > data.len() {
                break;
            }
            segments.push(AppleSegment {
                segment_type,
                data: data[offset + 2..end].to_vec(),
                raw: data[offset..end].to_vec(),
            });
            offset = end;
        }
        segments
    }

    /// Upper-case hex of the raw sub-segment; the filter matches against this
    pub fn hex(&self) -> String {
        hex::encode_upper(&self.raw)
    }
}
