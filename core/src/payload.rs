//! Identity payloads and the external payload supplier seam
//!
//! Payload bytes are opaque to the protocol. Producing them (and splitting a
//! payload-sharing buffer back into individual payloads) is the job of the
//! application's `PayloadSupplier`.

use crate::device::TargetIdentifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Opaque identity payload
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PayloadData(Vec<u8>);

impl PayloadData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Short hex prefix for log lines
    pub fn short_name(&self) -> String {
        let end = self.0.len().min(6);
        hex::encode(&self.0[..end])
    }
}

impl From<Vec<u8>> for PayloadData {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for PayloadData {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for PayloadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadData({}, {}B)", self.short_name(), self.0.len())
    }
}

/// Concatenated payloads forwarded to a peer, plus that peer's own RSSI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSharingData {
    pub rssi: i16,
    pub data: Vec<u8>,
}

impl PayloadSharingData {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Application-side producer of identity payloads.
#[cfg_attr(test, mockall::automock)]
pub trait PayloadSupplier: Send + Sync {
    /// This device's current identity payload, optionally varying by the
    /// requesting peer.
    fn payload(&self, timestamp: SystemTime, device: Option<TargetIdentifier>) -> Option<PayloadData>;

    /// Split a payload-sharing buffer into individual payloads. Payload
    /// length is implicit in each payload's own encoding.
    fn payloads(&self, data: &[u8]) -> Vec<PayloadData>;

    /// Payload served on the legacy interop characteristic
    fn legacy_payload(
        &self,
        _timestamp: SystemTime,
        _device: Option<TargetIdentifier>,
    ) -> Option<PayloadData> {
        None
    }
}

/// Supplier for fixed-length payloads: each call returns the configured
/// payload, and sharing buffers split into consecutive fixed-size chunks.
#[derive(Debug, Clone)]
pub struct FixedLengthPayloadSupplier {
    payload: PayloadData,
}

impl FixedLengthPayloadSupplier {
    pub fn new(payload: PayloadData) -> Self {
        Self { payload }
    }

    /// Deterministic payload of `length` bytes derived from `seed`
    pub fn from_seed(seed: u64, length: usize) -> Self {
        let bytes = (0..length)
            .map(|i| (seed.wrapping_mul(31).wrapping_add(i as u64) & 0xFF) as u8)
            .collect();
        Self::new(PayloadData::new(bytes))
    }

    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn payload_data(&self) -> PayloadData {
        self.payload.clone()
    }
}

impl PayloadSupplier for FixedLengthPayloadSupplier {
    fn payload(&self, _timestamp: SystemTime, _device: Option<TargetIdentifier>) -> Option<PayloadData> {
        Some(self.payload.clone())
    }

    fn payloads(&self, data: &[u8]) -> Vec<PayloadData> {
        let length = self.payload.len();
        if length == 0 {
            return Vec::new();
        }
        // Trailing bytes shorter than one payload are dropped
        data.chunks_exact(length).map(PayloadData::from).collect()
    }
}
