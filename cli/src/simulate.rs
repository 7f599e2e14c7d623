// Session simulation against scripted in-memory peers

use crate::config;
use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use proximity_core::transport::ble::{SimulatedBehaviour, SimulatedPeer, SimulatedRadio};
use proximity_core::{
    Device, FixedLengthPayloadSupplier, PayloadData, ProximityConfig, ProximitySession,
    RadioState, SensorDelegate,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Peers running the android flavour
    #[arg(long, default_value = "2")]
    pub android: usize,

    /// Peers running the ios flavour
    #[arg(long, default_value = "1")]
    pub ios: usize,

    /// Advert-only legacy peers (needs interop enabled to be seen)
    #[arg(long, default_value = "0")]
    pub legacy: usize,

    /// Peers that never complete a connection
    #[arg(long, default_value = "0")]
    pub hang: usize,

    /// Enable the legacy interop protocol for this run
    #[arg(long)]
    pub interop: bool,

    /// Wall-clock run time in seconds
    #[arg(short, long, default_value = "3")]
    pub seconds: u64,

    /// Divide every duty-cycle timing by this factor
    #[arg(long, default_value = "10")]
    pub speedup: u64,

    /// Print the device table as JSON
    #[arg(long)]
    pub json: bool,
}

/// Prints every session event as it happens
struct EventPrinter;

impl SensorDelegate for EventPrinter {
    fn did_detect(&self, device: &Device) {
        println!("{} detect  {}", "+".bright_green(), device.identifier);
    }

    fn did_read(&self, payload: &PayloadData, device: &Device) {
        println!(
            "{} read    {} {}",
            "←".bright_blue(),
            device.identifier,
            payload.short_name().bright_cyan()
        );
    }

    fn did_measure(&self, rssi: i16, device: &Device) {
        println!("{} rssi    {} {}", "~".dimmed(), device.identifier, rssi);
    }

    fn did_share(&self, payloads: &[PayloadData], device: &Device) {
        println!(
            "{} share   {} relayed {} payloads",
            "⇄".bright_yellow(),
            device.identifier,
            payloads.len()
        );
    }

    fn did_receive(&self, data: &[u8], device: &Device) {
        println!("{} receive {} {} bytes", "←".bright_blue(), device.identifier, data.len());
    }

    fn did_delete(&self, device: &Device) {
        println!("{} delete  {}", "-".bright_red(), device.identifier);
    }

    fn did_update_state(&self, state: RadioState) {
        println!("{} radio   {}", "*".bold(), state);
    }
}

fn peers(args: &SimulateArgs) -> Vec<SimulatedPeer> {
    let groups = [
        ("android", SimulatedBehaviour::Android, args.android),
        ("ios", SimulatedBehaviour::Ios, args.ios),
        ("legacy", SimulatedBehaviour::Legacy, args.legacy),
        ("hang", SimulatedBehaviour::Hang, args.hang),
    ];
    let mut peers = Vec::new();
    let mut seed = 1u64;
    for (name, behaviour, count) in groups {
        for i in 0..count {
            let payload = FixedLengthPayloadSupplier::from_seed(seed, 16);
            seed += 1;
            let rssi = -45 - (seed as i16 % 40);
            peers.push(
                SimulatedPeer::new(&format!("{}-{}", name, i), behaviour, payload.payload_data())
                    .with_rssi(rssi),
            );
        }
    }
    peers
}

pub async fn run(mut proximity: ProximityConfig, args: SimulateArgs) -> Result<()> {
    config::accelerate(&mut proximity, args.speedup);
    if args.interop {
        proximity.interop.enabled = true;
    }
    proximity.validate()?;

    let radio = Arc::new(SimulatedRadio::new(proximity.clone()));
    for peer in peers(&args) {
        radio.add_peer(peer);
    }
    let supplier = Arc::new(FixedLengthPayloadSupplier::from_seed(0, 16));
    let session = ProximitySession::new(proximity, radio.clone(), supplier)
        .context("Failed to create session")?;

    let feed = session.clone();
    radio.set_on_scan_result(Box::new(move |record| feed.on_scan_result(record)));
    session.add_delegate(Arc::new(EventPrinter));

    println!(
        "{} {} peers for {}s",
        "Simulating".bold(),
        radio.peers().len(),
        args.seconds
    );
    println!();

    session.start()?;
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    session.stop().await?;

    let mut devices: Vec<Device> = session
        .registry()
        .list_all()
        .into_iter()
        .map(|d| d.snapshot())
        .collect();
    devices.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    info!("Simulation finished with {} devices", devices.len());

    println!();
    if args.json {
        let rows: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "identifier": d.identifier,
                    "operating_system": d.operating_system,
                    "role": d.role,
                    "state": d.state,
                    "rssi": d.rssi,
                    "payload": d.payload.as_ref().map(|p| hex::encode(p.as_bytes())),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{} ({} total)", "Devices".bold(), devices.len());
    println!(
        "  {:<40} {:<12} {:<13} {:>5}  {}",
        "identifier", "os", "state", "rssi", "payload"
    );
    for device in devices {
        println!(
            "  {:<40} {:<12} {:<13} {:>5}  {}",
            device.identifier.to_string().bright_cyan(),
            device.operating_system.to_string(),
            device.state.to_string(),
            device
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
            device
                .payload
                .map(|p| p.short_name())
                .unwrap_or_else(|| "-".dimmed().to_string()),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            android: 2,
            ios: 1,
            legacy: 1,
            hang: 0,
            interop: false,
            seconds: 1,
            speedup: 10,
            json: false,
        }
    }

    #[test]
    fn test_peer_groups() {
        let peers = peers(&args());
        assert_eq!(peers.len(), 4);
        assert_eq!(peers[0].identifier.as_str(), "android-0");
        assert_eq!(peers[3].behaviour, SimulatedBehaviour::Legacy);
        // every peer gets a distinct payload
        assert_ne!(peers[0].payload, peers[1].payload);
    }
}
