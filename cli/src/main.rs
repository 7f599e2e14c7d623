// proximity-cli: inspect configuration, decode wire data and run simulations
//
// Talks to no hardware. `simulate` drives a full session against the
// in-memory radio so duty cycles and the connection protocol can be watched
// end to end.

mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use proximity_core::device::classifier::vendor_features;
use proximity_core::device::{classify, ScanSignals};
use proximity_core::transport::ble::{AdvertData, AppleSegment, BeaconParser};
use proximity_core::{
    DeviceFilter, DeviceOperatingSystem, ProximityConfig, ScanRecord, SignalMessage,
    TargetIdentifier,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "proximity")]
#[command(about = "BLE proximity session engine tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the session configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Decode a signal characteristic message from hex
    Decode { hex: String },
    /// Parse and classify raw advertisement bytes from hex
    Advert { hex: String },
    /// Run a session against simulated peers
    Simulate(simulate::SimulateArgs),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
    Show,
    Validate,
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_file()?,
    };

    match cli.command {
        Commands::Config { action } => cmd_config(action, &config_path),
        Commands::Decode { hex } => cmd_decode(&hex),
        Commands::Advert { hex } => cmd_advert(&hex, &config_path),
        Commands::Simulate(args) => {
            let config = config::load(&config_path)?;
            simulate::run(config, args).await
        }
    }
}

fn cmd_config(action: ConfigAction, path: &std::path::Path) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force)", path.display());
            }
            config::save(&ProximityConfig::default(), path)?;
            println!("{} Wrote {}", "✓".green(), path.display().to_string().bright_cyan());
        }

        ConfigAction::Show => {
            let config = config::load(path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        ConfigAction::Validate => {
            let config = config::load(path)?;
            config.validate()?;
            DeviceFilter::new(&config.filter)?;
            println!("{} {} is valid", "✓".green(), path.display());
        }

        ConfigAction::Set { key, value } => {
            let mut config = config::load(path)?;
            config::set(&mut config, &key, &value)?;
            config::save(&config, path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            let config = config::load(path)?;
            match config::get(&config, &key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }

        ConfigAction::List => {
            let config = config::load(path)?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config::list(&config) {
                println!("  {:<34} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let cleaned = cleaned.trim_start_matches("0x");
    hex::decode(cleaned).context("Invalid hex input")
}

fn cmd_decode(input: &str) -> Result<()> {
    let bytes = parse_hex(input)?;
    let message = SignalMessage::decode(&bytes)?;

    println!("{} {}", "Action:".bold(), message.action());
    match &message {
        SignalMessage::Payload(payload) => {
            println!("  Payload: {} ({} bytes)", payload.short_name().bright_cyan(), payload.len());
        }
        SignalMessage::Rssi(rssi) => println!("  RSSI:    {}", rssi),
        SignalMessage::PayloadSharing(sharing) => {
            println!("  RSSI:    {}", sharing.rssi);
            println!("  Data:    {} bytes", sharing.data.len());
            println!("  Hex:     {}", hex::encode(&sharing.data).dimmed());
        }
        SignalMessage::ImmediateSend(data) => {
            println!("  Data:    {} bytes", data.len());
            println!("  Hex:     {}", hex::encode(data).dimmed());
        }
    }

    let consumed = message.encode()?.len();
    if consumed < bytes.len() {
        println!(
            "{} {} trailing bytes ignored",
            "!".yellow(),
            bytes.len() - consumed
        );
    }
    Ok(())
}

fn cmd_advert(input: &str, path: &std::path::Path) -> Result<()> {
    let config = config::load(path)?;
    let filter = DeviceFilter::new(&config.filter)?;
    let raw = parse_hex(input)?;
    let advert = AdvertData::parse(&raw)?;
    let record = ScanRecord::from_raw(TargetIdentifier::from("advert"), 0, &raw)?;

    println!("{} ({} segments)", "Advertisement".bold(), advert.segments.len());
    for segment in &advert.segments {
        println!(
            "  type 0x{:02X}  {}",
            segment.segment_type,
            hex::encode_upper(&segment.data).dimmed()
        );
    }
    println!();

    for uuid in &record.service_uuids {
        println!("  Service:      {}", uuid.to_string().bright_cyan());
    }
    for manufacturer in &record.manufacturer_data {
        println!(
            "  Manufacturer: {} {}",
            manufacturer.manufacturer_id,
            hex::encode_upper(&manufacturer.data)
        );
        if manufacturer.manufacturer_id == config.cooperating_manufacturer_id {
            for segment in AppleSegment::parse_all(&manufacturer.data) {
                println!("    segment 0x{:02X}  {}", segment.segment_type, segment.hex());
            }
        }
    }
    if let Some(tx_power) = record.tx_power {
        println!("  TX power:     {}", tx_power);
    }
    if let Some(name) = &record.local_name {
        println!("  Name:         {}", name);
    }
    if let Some(address) = BeaconParser::new(&config).pseudo_address(&record) {
        println!("  Pseudo-addr:  {}", address.to_string().bright_yellow());
    }

    let signals = ScanSignals::from_record(&record, &config, &filter);
    if let Some(pattern) = &signals.pattern_match {
        println!("  Filtered by:  {}", pattern.bright_red());
    }
    let features = vendor_features(&record, &config);
    if !features.is_empty() {
        println!("  Features:     {}", features.join(" "));
    }
    let operating_system =
        classify(DeviceOperatingSystem::Unknown, &signals).unwrap_or(DeviceOperatingSystem::Unknown);
    println!();
    println!("{} {}", "Classified as:".bold(), operating_system.to_string().bright_green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_accepts_separators() {
        assert_eq!(parse_hex("0x01:02 03").expect("hex"), vec![1, 2, 3]);
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["proximity", "-v", "decode", "02c4ff"]).expect("parse");
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Decode { .. }));

        let cli = Cli::try_parse_from(["proximity", "simulate", "--android", "3", "--seconds", "2"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Simulate(_)));
    }
}
