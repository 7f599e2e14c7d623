// Transport module: BLE proximity protocol

pub mod ble;

pub use ble::{BleRadio, RadioError, RadioState, ScanRecord};
