// Configuration management for the proximity CLI
//
// The session configuration is stored as JSON in:
// - macOS: ~/Library/Application Support/proximity/config.json
// - Linux: ~/.config/proximity/config.json
// - Windows: %APPDATA%\proximity\config.json

use anyhow::{Context, Result};
use proximity_core::{PlatformFlavor, ProximityConfig};
use std::path::{Path, PathBuf};

/// Config directory, created on first use
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("proximity");

    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load from `path`, falling back to defaults when the file does not exist
pub fn load(path: &Path) -> Result<ProximityConfig> {
    if !path.exists() {
        return Ok(ProximityConfig::default());
    }
    ProximityConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

pub fn save(config: &ProximityConfig, path: &Path) -> Result<()> {
    config
        .save(path)
        .with_context(|| format!("Failed to write config to {}", path.display()))
}

fn parse_bool(value: &str) -> Result<bool> {
    value.parse().context("Invalid boolean value")
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid number: {}", value))
}

/// Set one value by its dotted key
pub fn set(config: &mut ProximityConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "platform" => {
            config.platform = match value {
                "android" => PlatformFlavor::Android,
                "ios" => PlatformFlavor::Ios,
                _ => anyhow::bail!("Invalid platform: {} (expected android or ios)", value),
            };
        }
        "introspection_enabled" => config.introspection_enabled = parse_bool(value)?,
        "device_expiry_secs" => config.device_expiry_secs = parse_number(value)?,
        "payload_sharing_expiry_secs" => config.payload_sharing_expiry_secs = parse_number(value)?,
        "payload_sharing_max_bytes" => config.payload_sharing_max_bytes = parse_number(value)?,
        "duty_cycle.scan_on_ms" => config.duty_cycle.scan_on_ms = parse_number(value)?,
        "duty_cycle.scan_off_ms" => config.duty_cycle.scan_off_ms = parse_number(value)?,
        "duty_cycle.advert_refresh_secs" => {
            config.duty_cycle.advert_refresh_secs = parse_number(value)?
        }
        "connection.connect_timeout_ms" => {
            config.connection.connect_timeout_ms = parse_number(value)?
        }
        "connection.payload_refresh_secs" => {
            config.connection.payload_refresh_secs = if value.is_empty() || value == "none" {
                None
            } else {
                Some(parse_number(value)?)
            };
        }
        "filter.patterns" => {
            config.filter.patterns = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        "filter.training_enabled" => config.filter.training_enabled = parse_bool(value)?,
        "interop.enabled" => config.interop.enabled = parse_bool(value)?,
        "interop.mtu" => config.interop.mtu = parse_number(value)?,
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    config.validate()?;
    Ok(())
}

/// Every settable key with its current value
pub fn list(config: &ProximityConfig) -> Vec<(String, String)> {
    vec![
        ("platform".to_string(), config.platform.to_string()),
        (
            "introspection_enabled".to_string(),
            config.introspection_enabled.to_string(),
        ),
        (
            "device_expiry_secs".to_string(),
            config.device_expiry_secs.to_string(),
        ),
        (
            "payload_sharing_expiry_secs".to_string(),
            config.payload_sharing_expiry_secs.to_string(),
        ),
        (
            "payload_sharing_max_bytes".to_string(),
            config.payload_sharing_max_bytes.to_string(),
        ),
        (
            "duty_cycle.scan_on_ms".to_string(),
            config.duty_cycle.scan_on_ms.to_string(),
        ),
        (
            "duty_cycle.scan_off_ms".to_string(),
            config.duty_cycle.scan_off_ms.to_string(),
        ),
        (
            "duty_cycle.advert_refresh_secs".to_string(),
            config.duty_cycle.advert_refresh_secs.to_string(),
        ),
        (
            "connection.connect_timeout_ms".to_string(),
            config.connection.connect_timeout_ms.to_string(),
        ),
        (
            "connection.payload_refresh_secs".to_string(),
            config
                .connection
                .payload_refresh_secs
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
        ),
        ("filter.patterns".to_string(), config.filter.patterns.join(",")),
        (
            "filter.training_enabled".to_string(),
            config.filter.training_enabled.to_string(),
        ),
        ("interop.enabled".to_string(), config.interop.enabled.to_string()),
        ("interop.mtu".to_string(), config.interop.mtu.to_string()),
    ]
}

pub fn get(config: &ProximityConfig, key: &str) -> Option<String> {
    list(config)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

/// Scale every duty-cycle and connection timing down by `factor`, for
/// simulations that should finish in seconds
pub fn accelerate(config: &mut ProximityConfig, factor: u64) {
    let factor = factor.max(1);
    let scale = |ms: u64| (ms / factor).max(1);
    let dc = &mut config.duty_cycle;
    dc.tick_interval_ms = scale(dc.tick_interval_ms);
    dc.scan_on_ms = scale(dc.scan_on_ms);
    dc.scan_rest_ms = scale(dc.scan_rest_ms);
    dc.scan_off_ms = scale(dc.scan_off_ms);
    dc.advert_off_ms = scale(dc.advert_off_ms);
    dc.processing_budget_ms = scale(dc.processing_budget_ms);
    let conn = &mut config.connection;
    conn.connect_timeout_ms = scale(conn.connect_timeout_ms);
    conn.connection_ceiling_ms = scale(conn.connection_ceiling_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut config = ProximityConfig::default();
        set(&mut config, "interop.enabled", "true").expect("set");
        set(&mut config, "platform", "ios").expect("set");
        set(&mut config, "filter.patterns", "^10....04, ^01").expect("set");

        assert_eq!(get(&config, "interop.enabled").as_deref(), Some("true"));
        assert_eq!(config.platform, PlatformFlavor::Ios);
        assert_eq!(config.filter.patterns, vec!["^10....04", "^01"]);
        assert!(get(&config, "nope").is_none());
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = ProximityConfig::default();
        assert!(set(&mut config, "interop.mtu", "lots").is_err());
        assert!(set(&mut config, "platform", "symbian").is_err());
        assert!(set(&mut config, "unknown", "1").is_err());
        assert!(set(&mut config, "payload_sharing_max_bytes", "0").is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load(&dir.path().join("missing.json")).expect("load");
        assert_eq!(config, ProximityConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = ProximityConfig::default();
        config.introspection_enabled = true;
        save(&config, &path).expect("save");
        assert_eq!(load(&path).expect("load"), config);
    }

    #[test]
    fn test_accelerate_keeps_config_valid() {
        let mut config = ProximityConfig::default();
        accelerate(&mut config, 10);
        assert_eq!(config.duty_cycle.scan_on_ms, 400);
        assert_eq!(config.connection.connect_timeout_ms, 800);
        assert!(config.validate().is_ok());
    }
}
