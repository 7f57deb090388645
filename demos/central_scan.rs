//! Scan for the sampler service, connect to the first device found and
//! print every value it sends.
//!
//! Run with: cargo run --example central_scan

use ble_sampler::ble::HostCentral;
use ble_sampler::{CentralConfig, CentralDriver, Notice, Result};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_sampler=debug".parse().unwrap()),
        )
        .init();

    println!("Scanning for sampler peripherals...");

    let config = CentralConfig::default().with_scan_timeout(Duration::from_secs(5));
    let (transport, events) = HostCentral::new(&config).await?;
    let central = CentralDriver::new(config, Arc::new(transport)).spawn(events);
    let mut notices = central.subscribe();

    // The host transport reports the radio first; give it a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;
    central.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let snapshot = central.snapshot().await?;
    println!("\nFound {} device(s):", snapshot.devices.len());
    for device in &snapshot.devices {
        println!(
            "  {} ({}) RSSI: {:?}",
            device.display_name(),
            device.id,
            device.rssi
        );
    }

    let Some(device) = snapshot.devices.first() else {
        println!("Nothing to connect to.");
        central.teardown().await?;
        return Ok(());
    };

    println!("\nConnecting to {}...", device.display_name());
    central.connect(&device.id).await?;

    let listen = async {
        while let Ok(notice) = notices.recv().await {
            match notice {
                Notice::StateChanged { peripheral, state } => {
                    println!("[{}] {}", peripheral, state);
                }
                Notice::ValueChanged { peripheral, value } => {
                    println!("[{}] value: {}", peripheral, value.as_text().unwrap_or("<undecodable>"));
                }
                Notice::Fault(fault) if fault.is_user_visible() => {
                    println!("Fault: {}", fault);
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = listen => {}
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    println!("\nDisconnecting...");
    central.teardown().await?;
    Ok(())
}
