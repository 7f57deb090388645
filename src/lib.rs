// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-sampler
//!
//! Radio-independent Bluetooth Low Energy session state machines for a
//! one-service, one-characteristic sampler, with a host transport built on
//! `btleplug`.
//!
//! ## Features
//!
//! - **Central session**: scan, connect, discover the sampler service and
//!   characteristic, subscribe, and stream values as UTF-8 text
//! - **Peripheral session**: publish the service, advertise, track
//!   subscribers, and push values
//! - **Device registry**: de-duplicated peripherals in first-seen order
//! - **Transports**: a host central over `btleplug` and an in-memory double
//!   that can loop a central and a peripheral together
//! - **Drivers**: tokio tasks that serialize requests and transport events
//!   into a session and own the scan timer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_sampler::ble::HostCentral;
//! use ble_sampler::{CentralConfig, CentralDriver, Notice, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = CentralConfig::default();
//!     let (transport, events) = HostCentral::new(&config).await?;
//!     let central = CentralDriver::new(config, Arc::new(transport)).spawn(events);
//!     let mut notices = central.subscribe();
//!
//!     central.start_scan().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//!
//!     if let Some(device) = central.snapshot().await?.devices.first() {
//!         central.connect(&device.id).await?;
//!     }
//!
//!     while let Ok(notice) = notices.recv().await {
//!         if let Notice::ValueChanged { peripheral, value } = notice {
//!             println!("{}: {:?}", peripheral, value.as_text());
//!         }
//!     }
//!
//!     central.teardown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! Only the central role runs on the host stack. The peripheral session is
//! driven through any [`ble::PeripheralTransport`]; this crate ships the
//! in-memory one.
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod driver;
pub mod error;
pub mod registry;
pub mod session;

// Re-exports for convenience
pub use config::{
    AdvertisingConfig, CentralConfig, DecodeFailurePolicy, PeripheralConfig, ReconnectPolicy,
};
pub use driver::{
    CentralDriver, CentralHandle, CentralSnapshot, PeripheralDriver, PeripheralHandle,
    PeripheralSnapshot,
};
pub use error::{Error, Fault, Result};
pub use registry::{DeviceRegistry, PeripheralDescriptor};
pub use session::{
    CentralSession, CentralState, CharacteristicValue, Emission, Notice, PeripheralSession,
    PeripheralState,
};
