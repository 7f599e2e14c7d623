//! Proximity protocol configuration
//!
//! Everything the protocol reads at runtime lives here: service and
//! characteristic UUIDs, manufacturer codes, duty-cycle timings, refresh and
//! expiry intervals, filter patterns and feature toggles. The session hands
//! out `Arc<ProximityConfig>` snapshots so a scan or advert cycle never sees
//! a value change halfway through.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Largest payload-sharing buffer that fits the default negotiated transfer
/// limit of a write-with-response.
pub const MAX_PAYLOAD_SHARING_BYTES: usize = 510;

/// Standard GAP device name characteristic (0x2A00)
pub const DEVICE_NAME_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00002A00_0000_1000_8000_00805F9B34FB);

/// Standard device information model number characteristic (0x2A24)
pub const MODEL_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00002A24_0000_1000_8000_00805F9B34FB);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("Invalid filter pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Which signal characteristic flavour this device exposes.
///
/// The flavour determines the write style peers use against us: android
/// peers receive fragmented writes, ios peers receive the whole buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformFlavor {
    Android,
    Ios,
}

impl std::fmt::Display for PlatformFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformFlavor::Android => write!(f, "android"),
            PlatformFlavor::Ios => write!(f, "ios"),
        }
    }
}

/// Predecessor advert-only protocol, still read for backward compatibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteropConfig {
    pub enabled: bool,
    pub service_uuid: Uuid,
    pub payload_characteristic_uuid: Uuid,
    pub manufacturer_id: u16,
    /// MTU requested before the legacy payload read
    pub mtu: u16,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_uuid: Uuid::from_u128(0xb82ab3fc_1595_4f6a_80f0_fe094cc218f9),
            payload_characteristic_uuid: Uuid::from_u128(0x117bdd58_57ce_4e7a_8e87_7cccdda2a804),
            manufacturer_id: 1023,
            mtu: 512,
        }
    }
}

/// Scan and advert duty-cycle timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyCycleConfig {
    pub tick_interval_ms: u64,
    pub scan_on_ms: u64,
    pub scan_rest_ms: u64,
    pub scan_off_ms: u64,
    pub advert_off_ms: u64,
    /// Advertising and the GATT server restart after this long, rotating the
    /// pseudo-address
    pub advert_refresh_secs: u64,
    pub processing_budget_ms: u64,
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            scan_on_ms: 4_000,
            scan_rest_ms: 1_000,
            scan_off_ms: 2_000,
            advert_off_ms: 4_000,
            advert_refresh_secs: 15 * 60,
            processing_budget_ms: 60_000,
        }
    }
}

/// Connection budgets and per-task re-send intervals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub connection_ceiling_ms: u64,
    /// A device reported connected for longer than this is forced back to
    /// disconnected by the scan cycle
    pub stuck_connected_secs: u64,
    /// `None` means a payload is read once and never refreshed
    pub payload_refresh_secs: Option<u64>,
    pub write_payload_interval_secs: u64,
    pub write_rssi_interval_secs: u64,
    pub write_payload_sharing_interval_secs: u64,
    /// Fragment size for android-style signal writes
    pub android_write_chunk_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 8_000,
            connection_ceiling_ms: 60_000,
            stuck_connected_secs: 60,
            payload_refresh_secs: None,
            write_payload_interval_secs: 5 * 60,
            write_rssi_interval_secs: 15,
            write_payload_sharing_interval_secs: 15,
            android_write_chunk_bytes: 20,
        }
    }
}

/// Device classification and ignore backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Regular expressions over upper-case hex Apple manufacturer
    /// sub-segments; a match marks the device as ignorable
    pub patterns: Vec<String>,
    pub training_enabled: bool,
    pub ignore_initial_secs: u64,
    pub ignore_backoff_factor: f64,
    pub ignore_max_secs: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            patterns: [
                "^10....04", "^10....14", "^0100000000000000000000000000000000", "^05", "^07",
                "^09", "^00", "^1002", "^06", "^08", "^03", "^0C", "^0D", "^0F", "^0E", "^0B",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            training_enabled: false,
            ignore_initial_secs: 60,
            ignore_backoff_factor: 1.2,
            ignore_max_secs: 3 * 60,
        }
    }
}

/// Complete protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityConfig {
    pub platform: PlatformFlavor,
    pub service_uuid: Uuid,
    pub android_signal_characteristic_uuid: Uuid,
    pub ios_signal_characteristic_uuid: Uuid,
    pub payload_characteristic_uuid: Uuid,
    /// Manufacturer code carrying our pseudo-address
    pub sensor_manufacturer_id: u16,
    /// Vendor code of the cooperating platform family (Apple)
    pub cooperating_manufacturer_id: u16,
    /// Read model and device name characteristics when a peer offers them
    pub introspection_enabled: bool,
    pub device_expiry_secs: u64,
    pub payload_sharing_expiry_secs: u64,
    pub payload_sharing_max_bytes: usize,
    pub duty_cycle: DutyCycleConfig,
    pub connection: ConnectionConfig,
    pub filter: FilterConfig,
    pub interop: InteropConfig,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            platform: PlatformFlavor::Android,
            service_uuid: Uuid::from_u128(0x428132af_4746_42d3_801e_4572d65bfd9b),
            android_signal_characteristic_uuid: Uuid::from_u128(
                0xf617b813_092e_437a_8324_e09a80821a11,
            ),
            ios_signal_characteristic_uuid: Uuid::from_u128(0x0eb0d5f2_eae4_4a9a_8af3_a4adb02d4363),
            payload_characteristic_uuid: Uuid::from_u128(0x3e98c0f8_8f05_4829_a121_43e38f8933e7),
            sensor_manufacturer_id: 65530,
            cooperating_manufacturer_id: 76,
            introspection_enabled: false,
            device_expiry_secs: 15 * 60,
            payload_sharing_expiry_secs: 5 * 60,
            payload_sharing_max_bytes: MAX_PAYLOAD_SHARING_BYTES,
            duty_cycle: DutyCycleConfig::default(),
            connection: ConnectionConfig::default(),
            filter: FilterConfig::default(),
            interop: InteropConfig::default(),
        }
    }
}

impl ProximityConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dc = &self.duty_cycle;
        if dc.tick_interval_ms == 0
            || dc.scan_on_ms == 0
            || dc.processing_budget_ms == 0
            || dc.advert_refresh_secs == 0
        {
            return Err(ConfigError::Invalid(
                "duty cycle timings must be > 0".to_string(),
            ));
        }

        let conn = &self.connection;
        if conn.connect_timeout_ms == 0 || conn.connection_ceiling_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection timeouts must be > 0".to_string(),
            ));
        }
        if conn.connect_timeout_ms >= conn.connection_ceiling_ms {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be below connection_ceiling_ms".to_string(),
            ));
        }
        if conn.android_write_chunk_bytes == 0 {
            return Err(ConfigError::Invalid(
                "android_write_chunk_bytes must be >= 1".to_string(),
            ));
        }

        if self.payload_sharing_max_bytes == 0
            || self.payload_sharing_max_bytes > MAX_PAYLOAD_SHARING_BYTES
        {
            return Err(ConfigError::Invalid(format!(
                "payload_sharing_max_bytes must be within 1..={}",
                MAX_PAYLOAD_SHARING_BYTES
            )));
        }
        if self.device_expiry_secs == 0 {
            return Err(ConfigError::Invalid(
                "device_expiry_secs must be > 0".to_string(),
            ));
        }

        let filter = &self.filter;
        if filter.ignore_initial_secs == 0 || filter.ignore_max_secs < filter.ignore_initial_secs {
            return Err(ConfigError::Invalid(
                "ignore_max_secs must be >= ignore_initial_secs > 0".to_string(),
            ));
        }
        let factor = filter.ignore_backoff_factor;
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(ConfigError::Invalid(
                "ignore_backoff_factor must be finite and >= 1.0".to_string(),
            ));
        }
        for pattern in &filter.patterns {
            regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }

        if self.interop.enabled && self.interop.mtu < 23 {
            return Err(ConfigError::Invalid(format!(
                "interop mtu {} below BLE minimum",
                self.interop.mtu
            )));
        }

        Ok(())
    }

    /// Signal characteristic exposed by our own GATT server
    pub fn local_signal_characteristic_uuid(&self) -> Uuid {
        match self.platform {
            PlatformFlavor::Android => self.android_signal_characteristic_uuid,
            PlatformFlavor::Ios => self.ios_signal_characteristic_uuid,
        }
    }

    pub fn device_expiry(&self) -> Duration {
        Duration::from_secs(self.device_expiry_secs)
    }

    pub fn payload_sharing_expiry(&self) -> Duration {
        Duration::from_secs(self.payload_sharing_expiry_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.duty_cycle.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }

    pub fn connection_ceiling(&self) -> Duration {
        Duration::from_millis(self.connection.connection_ceiling_ms)
    }

    pub fn stuck_connected(&self) -> Duration {
        Duration::from_secs(self.connection.stuck_connected_secs)
    }

    pub fn payload_refresh(&self) -> Option<Duration> {
        self.connection.payload_refresh_secs.map(Duration::from_secs)
    }

    pub fn processing_budget(&self) -> Duration {
        Duration::from_millis(self.duty_cycle.processing_budget_ms)
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ProximityConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.validate()?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
