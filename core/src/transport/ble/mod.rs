/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level logic of the proximity service. The platform radio stack
/// stays behind `BleRadio`; everything here is testable without hardware.
///
/// - **advert**: raw advertisement segments and Apple sub-segments
/// - **beacon**: pseudo-address beacon construction and parsing
/// - **codec**: signal characteristic wire messages and reassembly
/// - **gatt**: service layout, write fragmentation and the server trait
/// - **radio**: the radio driver seam and scan records
/// - **scanner** / **advertiser**: the two duty-cycle state machines
/// - **connection**: the per-connection task protocol
/// - **server**: inbound signal writes and payload reads
/// - **simulated**: in-memory radio with scripted peers

pub mod advert;
pub mod advertiser;
pub mod beacon;
pub mod codec;
pub mod connection;
pub mod gatt;
pub mod radio;
pub mod scanner;
pub mod server;
pub mod simulated;

// Re-export commonly used types
pub use advert::{AdvertData, AdvertError, AppleSegment, ManufacturerData};

pub use advertiser::{AdvertCommand, AdvertLoop, AdvertLoopState};

pub use beacon::{AdvertisingData, BeaconBuilder, BeaconParser, BleBeaconError};

pub use codec::{CodecError, SignalAction, SignalMessage, SignalReassembler, MAX_SIGNAL_MESSAGE_BYTES};

pub use connection::{
    next_task_for_device, ConnectionDriver, ConnectionError, ConnectionOutcome, DeviceTask,
    TaskContext,
};

pub use gatt::{
    GattCharacteristic, GattError, GattFragmenter, GattReassembler, GattServer,
    GattServiceDefinition, GattWriteQueue, GattWriteRequest, MAX_CHARACTERISTIC_SIZE,
};

pub use radio::{BleRadio, DiscoveredService, RadioError, RadioState, ScanFilter, ScanRecord, WriteType};

pub use scanner::{ScanCommand, ScanCycleProcessor, ScanLoop, ScanResultBuffer, ScannerState};

pub use server::{ServerEvent, SignalServer};

pub use simulated::{RadioCall, SimulatedBehaviour, SimulatedPeer, SimulatedRadio};
