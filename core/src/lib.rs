// Proximity Core: BLE proximity session engine
#![allow(clippy::empty_line_after_doc_comments)]
//
// Every device is both scanner and advertiser. Peers are found by scanning,
// classified from advert data, then connected to for a short exchange of
// identity payloads over one GATT service.

pub mod config;
pub mod device;
pub mod payload;
pub mod session;
pub mod transport;

use thiserror::Error;

pub use config::{ConfigError, PlatformFlavor, ProximityConfig};
pub use device::{
    Device, DeviceFilter, DeviceOperatingSystem, DeviceRegistry, DeviceRole, DeviceState,
    PseudoDeviceAddress, RegistryEvent, SharedDevice, TargetIdentifier,
};
pub use payload::{FixedLengthPayloadSupplier, PayloadData, PayloadSharingData, PayloadSupplier};
pub use session::{ProximitySession, SensorDelegate};
pub use transport::ble::{
    BleRadio, CodecError, ConnectionError, GattError, GattServer, RadioError, RadioState,
    ScanRecord, SignalMessage,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ProximityError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Unknown device {0}")]
    UnknownDevice(String),
    #[error("Already running")]
    AlreadyRunning,
    #[error("Not running")]
    NotRunning,
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
