//! Operating system inference and the trained device filter
//!
//! Scan data alone decides a tentative operating system for each device.
//! The filter recognises advert signatures of devices that never carry the
//! proximity service (watches, headphones, hand-off beacons) so they can be
//! ignored instead of connected to.

use super::DeviceOperatingSystem;
use crate::config::{ConfigError, FilterConfig, ProximityConfig};
use crate::transport::ble::advert::AppleSegment;
use crate::transport::ble::radio::ScanRecord;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Classification inputs extracted from one scan record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSignals {
    /// Proximity service UUID (or legacy service / manufacturer id when
    /// interop is enabled) is advertised
    pub has_service: bool,
    /// Cooperating platform vendor code is advertised
    pub has_cooperating_vendor: bool,
    /// Filter pattern that matched a vendor sub-segment, if any
    pub pattern_match: Option<String>,
}

impl ScanSignals {
    pub fn from_record(record: &ScanRecord, config: &ProximityConfig, filter: &DeviceFilter) -> Self {
        let mut has_service = record.service_uuids.contains(&config.service_uuid);
        if config.interop.enabled {
            has_service = has_service
                || record.service_uuids.contains(&config.interop.service_uuid)
                || record
                    .manufacturer_data
                    .iter()
                    .any(|m| m.manufacturer_id == config.interop.manufacturer_id);
        }
        let has_cooperating_vendor = record
            .manufacturer_data
            .iter()
            .any(|m| m.manufacturer_id == config.cooperating_manufacturer_id);
        let pattern_match = if has_cooperating_vendor {
            filter.matches(&vendor_features(record, config))
        } else {
            None
        };
        Self {
            has_service,
            has_cooperating_vendor,
            pattern_match,
        }
    }
}

/// Upper-case hex sub-segments of the cooperating vendor's manufacturer data
pub fn vendor_features(record: &ScanRecord, config: &ProximityConfig) -> Vec<String> {
    record
        .manufacturer_data
        .iter()
        .filter(|m| m.manufacturer_id == config.cooperating_manufacturer_id)
        .flat_map(|m| AppleSegment::parse_all(&m.data))
        .map(|segment| segment.hex())
        .collect()
}

/// Decide the operating system implied by scan data. `None` leaves the
/// current value unchanged. First matching rule wins.
pub fn classify(
    current: DeviceOperatingSystem,
    signals: &ScanSignals,
) -> Option<DeviceOperatingSystem> {
    use DeviceOperatingSystem::*;

    match (signals.has_service, signals.has_cooperating_vendor) {
        (true, true) => Some(Ios),
        (true, false) => {
            if current == Android {
                None
            } else {
                Some(AndroidTbc)
            }
        }
        (false, true) => {
            if signals.pattern_match.is_some() {
                Some(Ignore)
            } else if current == Unknown {
                Some(IosTbc)
            } else {
                None
            }
        }
        (false, false) => {
            if current.is_confirmed() {
                None
            } else {
                Some(Ignore)
            }
        }
    }
}

/// Labelled observations of one advert signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub feature: String,
    /// Connections that found the payload characteristic
    pub positive: u32,
    /// Connections that did not
    pub negative: u32,
}

/// Pattern filter over vendor manufacturer sub-segments
pub struct DeviceFilter {
    patterns: Vec<(String, Regex)>,
    training_enabled: bool,
    samples: Mutex<BTreeMap<String, TrainingSample>>,
}

impl DeviceFilter {
    pub fn new(config: &FilterConfig) -> Result<Self, ConfigError> {
        let patterns = config
            .patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map(|regex| (pattern.clone(), regex))
                    .map_err(|e| ConfigError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            training_enabled: config.training_enabled,
            samples: Mutex::new(BTreeMap::new()),
        })
    }

    /// First pattern matching any feature
    pub fn matches(&self, features: &[String]) -> Option<String> {
        for feature in features {
            for (pattern, regex) in &self.patterns {
                if regex.is_match(feature) {
                    debug!("Filter pattern {} matched {}", pattern, feature);
                    return Some(pattern.clone());
                }
            }
        }
        None
    }

    pub fn is_training(&self) -> bool {
        self.training_enabled
    }

    /// Record a connection outcome for each feature. Samples are only
    /// logged and exported; live decisions never read them.
    pub fn train(&self, features: &[String], payload_characteristic_found: bool) {
        if !self.training_enabled || features.is_empty() {
            return;
        }
        let mut samples = self.samples.lock();
        for feature in features {
            let sample = samples
                .entry(feature.clone())
                .or_insert_with(|| TrainingSample {
                    feature: feature.clone(),
                    ..TrainingSample::default()
                });
            if payload_characteristic_found {
                sample.positive += 1;
            } else {
                sample.negative += 1;
            }
            info!(
                "Filter training: feature={} positive={} negative={}",
                sample.feature, sample.positive, sample.negative
            );
        }
    }

    pub fn samples(&self) -> Vec<TrainingSample> {
        self.samples.lock().values().cloned().collect()
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.samples())
    }
}

impl std::fmt::Debug for DeviceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFilter")
            .field("patterns", &self.patterns.len())
            .field("training_enabled", &self.training_enabled)
            .finish()
    }
}
