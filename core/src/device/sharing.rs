//! Payload sharing: which known payloads to forward to a given peer
//!
//! Peers that cannot scan for (or connect to) everything nearby learn about
//! those devices through us. Only fresh, fully-discovered devices whose
//! payloads the peer could not collect itself are forwarded.

use super::{DeviceOperatingSystem, DeviceRegistry, DeviceRole, SharedDevice};
use crate::config::ProximityConfig;
use crate::payload::{PayloadData, PayloadSharingData};
use std::collections::HashSet;
use std::time::SystemTime;
use tracing::debug;

/// Sharing candidates for one peer, each list most recently updated first
#[derive(Debug, Default)]
pub struct PayloadSharingSet {
    /// Payloads the peer has not been sent yet
    pub unknown: Vec<SharedDevice>,
    /// Payloads already sent to the peer
    pub known: Vec<SharedDevice>,
}

impl PayloadSharingSet {
    pub fn is_empty(&self) -> bool {
        self.unknown.is_empty() && self.known.is_empty()
    }

    pub fn len(&self) -> usize {
        self.unknown.len() + self.known.len()
    }
}

impl DeviceRegistry {
    /// Select the devices whose payloads should be forwarded to `peer`.
    ///
    /// Empty when the peer's RSSI is unknown: the receiver needs it to
    /// attribute the relayed sightings.
    pub fn compute_payload_sharing_set(
        &self,
        peer: &SharedDevice,
        now: SystemTime,
        config: &ProximityConfig,
    ) -> PayloadSharingSet {
        let (peer_payload, peer_rssi, already_shared) = {
            let device = peer.read();
            (
                device.payload.clone(),
                device.rssi,
                device.shared_payloads.clone(),
            )
        };
        if peer_rssi.is_none() {
            return PayloadSharingSet::default();
        }

        let window = config.payload_sharing_expiry();
        let mut candidates: Vec<(SystemTime, bool, SharedDevice)> = Vec::new();
        for device in self.list_all() {
            if device.ptr_eq(peer) {
                continue;
            }
            let snapshot = device.read();
            if snapshot.time_since_last_update(now) > window {
                continue;
            }
            let payload = match snapshot.payload.as_ref() {
                Some(payload) if !payload.is_empty() => payload,
                _ => continue,
            };
            let relay_worthy = snapshot.operating_system == DeviceOperatingSystem::Android
                || snapshot.role == DeviceRole::ReceiveOnly;
            if !relay_worthy || snapshot.role == DeviceRole::Relayed {
                continue;
            }
            if peer_payload.as_ref() == Some(payload) {
                continue;
            }
            let known = already_shared.contains(payload);
            candidates.push((snapshot.last_updated_at, known, device.clone()));
        }

        // Most recently updated first
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        let mut set = PayloadSharingSet::default();
        for (_, known, device) in candidates {
            if known {
                set.known.push(device);
            } else {
                set.unknown.push(device);
            }
        }
        set
    }

    /// Build the payload-sharing buffer for `peer`, unknown payloads first,
    /// stopping at the first payload that would overflow the cap. Included
    /// payloads are recorded as shared with the peer.
    pub fn payload_sharing_data(
        &self,
        peer: &SharedDevice,
        now: SystemTime,
        config: &ProximityConfig,
    ) -> Option<PayloadSharingData> {
        let rssi = peer.read().rssi?;
        let set = self.compute_payload_sharing_set(peer, now, config);
        if set.is_empty() {
            return None;
        }

        let cap = config.payload_sharing_max_bytes;
        let mut data = Vec::new();
        let mut included: Vec<PayloadData> = Vec::new();
        let mut seen: HashSet<PayloadData> = HashSet::new();
        for device in set.unknown.iter().chain(set.known.iter()) {
            let payload = match device.read().payload.clone() {
                Some(payload) => payload,
                None => continue,
            };
            if seen.contains(&payload) {
                continue;
            }
            if data.len() + payload.len() > cap {
                break;
            }
            data.extend_from_slice(payload.as_bytes());
            seen.insert(payload.clone());
            included.push(payload);
        }

        if included.is_empty() {
            return None;
        }
        debug!(
            "Payload sharing for {}: {} payloads, {} bytes",
            peer.identifier(),
            included.len(),
            data.len()
        );
        peer.modify(|d| d.shared_payloads.extend(included));
        Some(PayloadSharingData { rssi, data })
    }
}
