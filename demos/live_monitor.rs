//! Live OBD-II telemetry monitor
//!
//! Run with: cargo run --example live_monitor [config.toml]
//!
//! Set `OBD_SESSION_ID` to publish snapshots to the configured collector.

use obd_ble_monitor::{DeviceManager, Error, MonitorConfig, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => MonitorConfig::load(path)?,
        None => MonitorConfig::default(),
    };

    println!("OBD-II Live Monitor");
    println!("===================\n");
    println!("Scanning for {:?}...\n", config.scan_window());

    let manager = DeviceManager::new(config.clone()).await?;

    for device in manager.scan(None).await? {
        println!(
            "  {:<24} {:>5} dBm  {}",
            device.display_name(),
            device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into()),
            device.id
        );
    }

    let adapter = manager
        .nearest_device()
        .ok_or_else(|| Error::DeviceNotFound {
            identifier: "any".to_string(),
        })?;

    println!("\nConnecting to {}...", adapter.display_name());
    manager.connect(&adapter.id).await?;

    if let Ok(session_id) = std::env::var("OBD_SESSION_ID") {
        println!("Syncing telemetry under session {}", session_id);
        manager.set_sync_session(Some(session_id));
    }

    if !manager.start_monitoring(config.pids.clone()).await? {
        println!("Monitoring did not start");
        manager.shutdown().await?;
        return Ok(());
    }

    println!("Monitoring {:?}. Press Ctrl+C to exit.\n", config.pids);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n\nExiting...");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !manager.is_monitoring() {
                    println!("\nSession ended");
                    break;
                }
                display_telemetry(&manager);
            }
        }
    }

    manager.shutdown().await?;

    Ok(())
}

fn display_telemetry(manager: &DeviceManager) {
    // Clear screen and move cursor to top
    print!("\x1B[2J\x1B[1;1H");

    println!("=== OBD-II Live Telemetry ===\n");

    let telemetry = manager.telemetry();
    if telemetry.is_empty() {
        println!("  Waiting for replies...");
    }
    for (name, metric) in telemetry.iter() {
        println!("  {:<20} {:>8.1} {}", name, metric.value, metric.unit);
    }

    let stats = manager.stats();
    println!(
        "\nTicks: {}  Decoded: {}  Ignored: {}  Write failures: {}",
        stats.ticks, stats.replies_decoded, stats.replies_ignored, stats.write_failures
    );
}
