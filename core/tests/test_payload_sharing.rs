//! Payload sharing selection and buffer construction

use proptest::prelude::*;
use proximity_core::{
    DeviceOperatingSystem, DeviceRegistry, DeviceRole, PayloadData, ProximityConfig, SharedDevice,
    TargetIdentifier,
};
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

fn device(
    registry: &DeviceRegistry,
    id: &str,
    os: DeviceOperatingSystem,
    payload: Option<PayloadData>,
) -> SharedDevice {
    let device = registry.get_or_create_by_session_id(&TargetIdentifier::from(id));
    device.modify(|d| {
        d.operating_system = os;
        d.payload = payload;
    });
    device
}

fn peer(registry: &DeviceRegistry, payload: PayloadData) -> SharedDevice {
    let peer = device(registry, "ios-peer", DeviceOperatingSystem::Ios, Some(payload));
    peer.set_rssi(-65, SystemTime::now());
    peer
}

fn payload(byte: u8, len: usize) -> PayloadData {
    PayloadData::new(vec![byte; len])
}

#[test]
fn test_candidate_rules() {
    let (registry, _events) = DeviceRegistry::new();
    let config = ProximityConfig::default();
    let now = SystemTime::now();
    let ours = payload(0xFF, 16);
    let peer = peer(&registry, ours.clone());

    let android = device(&registry, "android", DeviceOperatingSystem::Android, Some(payload(1, 16)));
    device(&registry, "ios", DeviceOperatingSystem::Ios, Some(payload(2, 16)));
    device(&registry, "no-payload", DeviceOperatingSystem::Android, None);
    device(&registry, "empty", DeviceOperatingSystem::Android, Some(PayloadData::new(Vec::new())));
    // same payload as the peer itself
    device(&registry, "echo", DeviceOperatingSystem::Android, Some(ours));

    let receive_only = device(&registry, "receive-only", DeviceOperatingSystem::Unknown, Some(payload(3, 16)));
    receive_only.set_role(DeviceRole::ReceiveOnly, now);

    let relayed = registry.get_or_create_by_payload(&payload(4, 16));
    relayed.modify(|d| d.operating_system = DeviceOperatingSystem::Android);
    relayed.set_role(DeviceRole::Relayed, now);

    let stale = device(&registry, "stale", DeviceOperatingSystem::Android, Some(payload(5, 16)));
    stale.modify(|d| d.last_updated_at = now - config.payload_sharing_expiry() - Duration::from_secs(1));

    let set = registry.compute_payload_sharing_set(&peer, now, &config);
    let selected: HashSet<TargetIdentifier> = set
        .unknown
        .iter()
        .chain(set.known.iter())
        .map(|d| d.identifier())
        .collect();
    let expected: HashSet<TargetIdentifier> = [android.identifier(), receive_only.identifier()]
        .into_iter()
        .collect();
    assert_eq!(selected, expected);
    assert!(set.known.is_empty());
}

#[test]
fn test_no_sharing_without_peer_rssi() {
    let (registry, _events) = DeviceRegistry::new();
    let config = ProximityConfig::default();
    let peer = device(&registry, "peer", DeviceOperatingSystem::Ios, Some(payload(0xFF, 16)));
    device(&registry, "android", DeviceOperatingSystem::Android, Some(payload(1, 16)));

    let now = SystemTime::now();
    assert!(registry.compute_payload_sharing_set(&peer, now, &config).is_empty());
    assert!(registry.payload_sharing_data(&peer, now, &config).is_none());
}

#[test]
fn test_successive_calls_move_payloads_to_known() {
    let (registry, _events) = DeviceRegistry::new();
    let config = ProximityConfig::default();
    let peer = peer(&registry, payload(0xFF, 16));
    for i in 0..3u8 {
        device(&registry, &format!("android-{}", i), DeviceOperatingSystem::Android, Some(payload(i, 16)));
    }
    let now = SystemTime::now();

    let first = registry.payload_sharing_data(&peer, now, &config).expect("first share");
    assert_eq!(first.rssi, -65);
    assert_eq!(first.data.len(), 48);

    let set = registry.compute_payload_sharing_set(&peer, now, &config);
    assert!(set.unknown.is_empty());
    assert_eq!(set.known.len(), 3);

    // a newcomer is shared ahead of payloads the peer already has
    device(&registry, "android-new", DeviceOperatingSystem::Android, Some(payload(9, 16)));
    let second = registry.payload_sharing_data(&peer, now, &config).expect("second share");
    assert_eq!(&second.data[..16], payload(9, 16).as_bytes());
    let set = registry.compute_payload_sharing_set(&peer, now, &config);
    assert!(set.unknown.is_empty());
}

#[test]
fn test_overflow_stops_at_first_payload_that_does_not_fit() {
    let (registry, _events) = DeviceRegistry::new();
    let mut config = ProximityConfig::default();
    config.payload_sharing_max_bytes = 40;
    let peer = peer(&registry, payload(0xFF, 16));
    for i in 0..4u8 {
        device(&registry, &format!("android-{}", i), DeviceOperatingSystem::Android, Some(payload(i, 16)));
    }

    let data = registry
        .payload_sharing_data(&peer, SystemTime::now(), &config)
        .expect("share");
    assert_eq!(data.data.len(), 32);
    assert_eq!(peer.read().shared_payloads.len(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_buffer_bounded_and_excludes_peer(
        lengths in proptest::collection::vec(1usize..120, 0..24),
        peer_len in 1usize..64,
    ) {
        let (registry, _events) = DeviceRegistry::new();
        let config = ProximityConfig::default();
        let peer_payload = payload(0xFF, peer_len);
        let peer = peer(&registry, peer_payload.clone());
        for (i, len) in lengths.iter().enumerate() {
            device(&registry, &format!("android-{}", i), DeviceOperatingSystem::Android, Some(payload(i as u8, *len)));
        }
        // the peer's own payload seen on another device is never echoed back
        device(&registry, "echo", DeviceOperatingSystem::Android, Some(peer_payload.clone()));

        match registry.payload_sharing_data(&peer, SystemTime::now(), &config) {
            Some(data) => {
                prop_assert!(data.data.len() <= config.payload_sharing_max_bytes);
                prop_assert!(!data.data.is_empty());
                let shared = peer.read().shared_payloads.clone();
                prop_assert!(!shared.contains(&peer_payload));
                let total: usize = shared.iter().map(PayloadData::len).sum();
                prop_assert_eq!(total, data.data.len());
            }
            None => prop_assert!(lengths.is_empty()),
        }
    }
}
