//! Run a central and a peripheral session against each other through the
//! in-memory transport.
//!
//! Run with: cargo run --example loopback

use ble_sampler::ble::{MemoryTransport, RadioState, TransportEvent};
use ble_sampler::{
    CentralConfig, CentralDriver, Emission, Notice, PeripheralConfig, PeripheralDescriptor,
    PeripheralDriver, Result,
};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_sampler=info".parse().unwrap()),
        )
        .init();

    let (central_tx, central_rx) = mpsc::unbounded_channel();
    let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
    for events in [&central_tx, &peripheral_tx] {
        let _ = events.send(TransportEvent::RadioStateChanged(RadioState::PoweredOn));
    }

    let peripheral_config = PeripheralConfig::default().with_local_name("loopback");
    let air = Arc::new(
        MemoryTransport::new()
            .with_central_events(central_tx)
            .with_peripheral_events(peripheral_tx)
            .with_peer(PeripheralDescriptor::new(
                "loopback-peripheral",
                Some(peripheral_config.advertising.local_name.clone()),
            )),
    );

    let peripheral = PeripheralDriver::new(peripheral_config, air.clone()).spawn(peripheral_rx);
    let central = CentralDriver::new(CentralConfig::default(), air.clone()).spawn(central_rx);
    let mut notices = central.subscribe();

    peripheral.set_service_enabled(true).await?;
    peripheral.start_advertising().await?;
    println!("Peripheral: {}", peripheral.snapshot().await?.state);

    central.start_scan().await?;
    let snapshot = central.snapshot().await?;
    for device in &snapshot.devices {
        println!("Central found {} ({})", device.display_name(), device.id);
        central.connect(&device.id).await?;
    }
    println!("Central: {}", central.snapshot().await?.state);
    println!("Peripheral: {}", peripheral.snapshot().await?.state);

    for emission in Emission::ALL {
        peripheral.emit(emission).await?;
    }
    // Let the central drain the forwarded values.
    central.snapshot().await?;

    while let Ok(notice) = notices.try_recv() {
        if let Notice::ValueChanged { peripheral, value } = notice {
            println!("Central received {:?} from {}", value.as_text(), peripheral);
        }
    }

    central.teardown().await?;
    peripheral.teardown().await?;
    Ok(())
}
