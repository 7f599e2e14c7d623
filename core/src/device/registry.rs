//! Device registry, the authoritative map of session identifier to device
//!
//! All devices live here, keyed by session identifier, with reverse indices
//! by pseudo-address (to re-identify peers that rotate their radio address)
//! and by payload (to find or synthesize a device for a relayed payload).
//!
//! Every creation, update and deletion is published on a single unbounded
//! channel. Creations and deletions are sent while the registry write lock
//! is held and updates while the device lock is held, so the consumer of
//! `RegistryEvents` sees one total order of events.

use super::{Device, DeviceAttribute, DeviceOperatingSystem, PseudoDeviceAddress, SharedDevice, TargetIdentifier};
use crate::payload::PayloadData;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Registry notification
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Created(SharedDevice),
    Updated(SharedDevice, DeviceAttribute),
    Deleted(SharedDevice),
}

impl RegistryEvent {
    pub fn device(&self) -> &SharedDevice {
        match self {
            RegistryEvent::Created(device)
            | RegistryEvent::Updated(device, _)
            | RegistryEvent::Deleted(device) => device,
        }
    }
}

/// Ordered stream of registry notifications
pub struct RegistryEvents {
    receiver: mpsc::UnboundedReceiver<RegistryEvent>,
}

impl RegistryEvents {
    /// Wait for the next event; `None` once the registry is dropped
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<RegistryEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<TargetIdentifier, SharedDevice>,
    by_pseudo_address: HashMap<PseudoDeviceAddress, TargetIdentifier>,
    /// Hint only: entries are verified against the device before use
    by_payload: HashMap<PayloadData, TargetIdentifier>,
}

impl RegistryState {
    fn insert(&mut self, device: SharedDevice) {
        let identifier = device.identifier();
        if let Some(address) = device.read().pseudo_address {
            self.by_pseudo_address.insert(address, identifier.clone());
        }
        self.devices.insert(identifier, device);
    }

    fn remove(&mut self, identifier: &TargetIdentifier) -> Option<SharedDevice> {
        let device = self.devices.remove(identifier)?;
        self.by_pseudo_address.retain(|_, id| id != identifier);
        self.by_payload.retain(|_, id| id != identifier);
        Some(device)
    }

    fn find_by_payload(&self, payload: &PayloadData) -> Option<SharedDevice> {
        if let Some(device) = self
            .by_payload
            .get(payload)
            .and_then(|id| self.devices.get(id))
        {
            if device.read().payload.as_ref() == Some(payload) {
                return Some(device.clone());
            }
        }
        self.devices
            .values()
            .find(|d| d.read().payload.as_ref() == Some(payload))
            .cloned()
    }
}

/// Thread-safe device registry
#[derive(Clone)]
pub struct DeviceRegistry {
    state: Arc<RwLock<RegistryState>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a registry and the stream of its notifications
    pub fn new() -> (Self, RegistryEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(RwLock::new(RegistryState::default())),
                events,
            },
            RegistryEvents { receiver },
        )
    }

    fn new_device(&self, device: Device) -> SharedDevice {
        SharedDevice::new(device, self.events.clone())
    }

    /// Look up a device by session identifier
    pub fn get(&self, identifier: &TargetIdentifier) -> Option<SharedDevice> {
        self.state.read().devices.get(identifier).cloned()
    }

    /// Look up or create a device by session identifier. Concurrent callers
    /// with the same identifier get the same device and only one `Created`
    /// event is published.
    pub fn get_or_create_by_session_id(&self, identifier: &TargetIdentifier) -> SharedDevice {
        if let Some(device) = self.get(identifier) {
            return device;
        }

        let mut state = self.state.write();
        if let Some(device) = state.devices.get(identifier) {
            return device.clone();
        }
        let device = self.new_device(Device::new(identifier.clone(), SystemTime::now()));
        state.insert(device.clone());
        debug!("Device created: {}", identifier);
        device.publish(RegistryEvent::Created(device.clone()));
        device
    }

    /// Look up or create a device advertising `address`.
    ///
    /// A known address seen under a new session identifier re-binds the
    /// existing device to that identifier instead of creating a second one.
    pub fn get_or_create_by_pseudo_address(
        &self,
        identifier: &TargetIdentifier,
        address: PseudoDeviceAddress,
    ) -> SharedDevice {
        let mut state = self.state.write();
        let holder = state.by_pseudo_address.get(&address).cloned();

        // Session identifier already known
        if let Some(device) = state.devices.get(identifier).cloned() {
            match holder {
                Some(ref holder_id) if holder_id == identifier => {}
                Some(holder_id) => {
                    // Same physical device seen under an older address; keep
                    // the device bound to the live identifier
                    if let Some(stale) = state.remove(&holder_id) {
                        let stale_payload = stale.read().payload.clone();
                        if let Some(payload) = stale_payload {
                            if device.read().payload.is_none() {
                                device.set_payload(payload, SystemTime::now());
                            }
                        }
                        info!("Device {} superseded by {} ({})", holder_id, identifier, address);
                        stale.publish(RegistryEvent::Deleted(stale.clone()));
                    }
                    self.assign_pseudo_address(&mut state, &device, identifier, address);
                }
                None => self.assign_pseudo_address(&mut state, &device, identifier, address),
            }
            return device;
        }

        // Known address, new session identifier: re-bind
        if let Some(holder_id) = holder {
            if let Some(device) = state.devices.remove(&holder_id) {
                device.update(DeviceAttribute::SessionIdentifier, |d| {
                    d.identifier = identifier.clone();
                    d.touch(SystemTime::now());
                });
                state.by_payload.retain(|_, id| id != &holder_id);
                state.by_pseudo_address.insert(address, identifier.clone());
                state.devices.insert(identifier.clone(), device.clone());
                debug!("Device {} re-bound to {} ({})", holder_id, identifier, address);
                return device;
            }
        }

        // Unknown address: only our own android flavour advertises one
        let mut fresh = Device::new(identifier.clone(), SystemTime::now());
        fresh.pseudo_address = Some(address);
        fresh.operating_system = DeviceOperatingSystem::Android;
        let device = self.new_device(fresh);
        state.insert(device.clone());
        debug!("Device created: {} ({})", identifier, address);
        device.publish(RegistryEvent::Created(device.clone()));
        device
    }

    fn assign_pseudo_address(
        &self,
        state: &mut RegistryState,
        device: &SharedDevice,
        identifier: &TargetIdentifier,
        address: PseudoDeviceAddress,
    ) {
        if device.read().pseudo_address != Some(address) {
            state
                .by_pseudo_address
                .retain(|_, id| id != identifier);
            device.update(DeviceAttribute::PseudoAddress, |d| {
                d.pseudo_address = Some(address);
                d.touch(SystemTime::now());
            });
        }
        state.by_pseudo_address.insert(address, identifier.clone());
    }

    /// Look up the device holding `payload`, or synthesize one with a fresh
    /// identifier when the payload has never been seen.
    pub fn get_or_create_by_payload(&self, payload: &PayloadData) -> SharedDevice {
        if let Some(device) = self.state.read().find_by_payload(payload) {
            return device;
        }

        let mut state = self.state.write();
        if let Some(device) = state.find_by_payload(payload) {
            let identifier = device.identifier();
            state.by_payload.insert(payload.clone(), identifier);
            return device;
        }
        let now = SystemTime::now();
        let identifier = TargetIdentifier::synthesized();
        let mut fresh = Device::new(identifier.clone(), now);
        fresh.set_payload(payload.clone(), now);
        let device = self.new_device(fresh);
        state.insert(device.clone());
        state.by_payload.insert(payload.clone(), identifier.clone());
        debug!("Device synthesized: {} for payload {}", identifier, payload.short_name());
        device.publish(RegistryEvent::Created(device.clone()));
        device
    }

    /// All live devices
    pub fn list_all(&self) -> Vec<SharedDevice> {
        self.state.read().devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().devices.is_empty()
    }

    /// Remove a device, publishing `Deleted`
    pub fn delete(&self, identifier: &TargetIdentifier) -> Option<SharedDevice> {
        let mut state = self.state.write();
        let device = state.remove(identifier)?;
        debug!("Device deleted: {}", identifier);
        device.publish(RegistryEvent::Deleted(device.clone()));
        Some(device)
    }

    /// Delete every device not updated within `max_age`
    pub fn expire_stale(&self, now: SystemTime, max_age: Duration) -> Vec<SharedDevice> {
        let stale: Vec<TargetIdentifier> = self
            .state
            .read()
            .devices
            .iter()
            .filter(|(_, device)| device.read().time_since_last_update(now) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let removed: Vec<SharedDevice> = stale.iter().filter_map(|id| self.delete(id)).collect();
        if !removed.is_empty() {
            info!("Expired {} stale devices", removed.len());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> TargetIdentifier {
        TargetIdentifier::from(value)
    }

    fn created_count(events: &[RegistryEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, RegistryEvent::Created(_)))
            .count()
    }

    #[test]
    fn test_get_absent_is_none() {
        let (registry, _events) = DeviceRegistry::new();
        assert!(registry.get(&id("missing")).is_none());
    }

    #[test]
    fn test_create_by_session_id_is_idempotent() {
        let (registry, mut events) = DeviceRegistry::new();
        let a = registry.get_or_create_by_session_id(&id("A"));
        let b = registry.get_or_create_by_session_id(&id("A"));

        assert!(a.ptr_eq(&b));
        assert_eq!(created_count(&events.drain()), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pseudo_address_rebinds_to_new_session_id() {
        let (registry, mut events) = DeviceRegistry::new();
        let address = PseudoDeviceAddress::new([1, 2, 3, 4, 5, 6]);

        let first = registry.get_or_create_by_pseudo_address(&id("A"), address);
        let second = registry.get_or_create_by_pseudo_address(&id("B"), address);

        assert!(first.ptr_eq(&second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id("A")).is_none());
        assert_eq!(second.identifier(), id("B"));
        assert_eq!(second.read().operating_system, DeviceOperatingSystem::Android);

        let events = events.drain();
        assert_eq!(created_count(&events), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            RegistryEvent::Updated(_, DeviceAttribute::SessionIdentifier)
        )));
    }

    #[test]
    fn test_pseudo_address_on_known_session_id_supersedes_stale_holder() {
        let (registry, _events) = DeviceRegistry::new();
        let address = PseudoDeviceAddress::new([9, 9, 9, 9, 9, 9]);

        let stale = registry.get_or_create_by_pseudo_address(&id("OLD"), address);
        stale.set_payload(PayloadData::new(vec![7; 8]), SystemTime::now());
        let live = registry.get_or_create_by_session_id(&id("NEW"));

        let device = registry.get_or_create_by_pseudo_address(&id("NEW"), address);
        assert!(device.ptr_eq(&live));
        assert_eq!(registry.len(), 1);
        assert_eq!(device.read().pseudo_address, Some(address));
        assert_eq!(device.read().payload, Some(PayloadData::new(vec![7; 8])));
    }

    #[test]
    fn test_get_or_create_by_payload() {
        let (registry, mut events) = DeviceRegistry::new();
        let payload = PayloadData::new(vec![1, 2, 3]);

        let synthesized = registry.get_or_create_by_payload(&payload);
        assert!(synthesized.identifier().is_synthesized());
        assert!(registry.get_or_create_by_payload(&payload).ptr_eq(&synthesized));

        let known = registry.get_or_create_by_session_id(&id("A"));
        let other = PayloadData::new(vec![4, 5, 6]);
        known.set_payload(other.clone(), SystemTime::now());
        assert!(registry.get_or_create_by_payload(&other).ptr_eq(&known));

        assert_eq!(created_count(&events.drain()), 2);
    }

    #[test]
    fn test_payload_index_follows_payload_changes() {
        let (registry, _events) = DeviceRegistry::new();
        let first = PayloadData::new(vec![1]);
        let device = registry.get_or_create_by_payload(&first);
        device.set_payload(PayloadData::new(vec![2]), SystemTime::now());

        let fresh = registry.get_or_create_by_payload(&first);
        assert!(!fresh.ptr_eq(&device));
    }

    #[test]
    fn test_delete_publishes_event() {
        let (registry, mut events) = DeviceRegistry::new();
        registry.get_or_create_by_session_id(&id("A"));
        events.drain();

        assert!(registry.delete(&id("A")).is_some());
        assert!(registry.delete(&id("A")).is_none());
        let events = events.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RegistryEvent::Deleted(_)));
    }

    #[test]
    fn test_expiry_removes_only_stale_devices() {
        let (registry, _events) = DeviceRegistry::new();
        let now = SystemTime::now();

        let old = registry.get_or_create_by_session_id(&id("OLD"));
        old.modify(|d| d.last_updated_at = now - Duration::from_secs(16 * 60));
        let recent = registry.get_or_create_by_session_id(&id("RECENT"));
        recent.modify(|d| d.last_updated_at = now - Duration::from_secs(10 * 60));

        let removed = registry.expire_stale(now, Duration::from_secs(15 * 60));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].identifier(), id("OLD"));
        assert!(registry.get(&id("RECENT")).is_some());
    }

    #[test]
    fn test_updates_follow_creation_in_order() {
        let (registry, mut events) = DeviceRegistry::new();
        let device = registry.get_or_create_by_session_id(&id("A"));
        device.set_rssi(-60, SystemTime::now());
        registry.delete(&id("A"));

        let events = events.drain();
        assert!(matches!(events[0], RegistryEvent::Created(_)));
        assert!(matches!(events[1], RegistryEvent::Updated(_, DeviceAttribute::Rssi)));
        assert!(matches!(events[2], RegistryEvent::Deleted(_)));
    }
}
