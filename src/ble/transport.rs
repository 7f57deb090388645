//! Transport capability traits and the commands issued through them.
//!
//! The session machines never call a radio directly. They return
//! [`CentralCommand`]s and [`PeripheralCommand`]s, which a driver applies to
//! whatever implements [`CentralTransport`] or [`PeripheralTransport`]: the
//! host stack in production, an in-memory double in tests.
//!
//! All methods are fire-and-forget. Results come back later as
//! [`TransportEvent`](crate::ble::event::TransportEvent)s.

use bytes::Bytes;
use uuid::Uuid;

use crate::ble::types::{CentralToken, PeripheralId};
use crate::config::AdvertisingConfig;

/// Central-role capabilities of a BLE stack.
#[cfg_attr(test, mockall::automock)]
pub trait CentralTransport: Send + Sync {
    /// Start scanning for peripherals advertising `service`.
    fn start_scan(&self, service: Uuid);

    /// Stop scanning.
    fn stop_scan(&self);

    /// Open a link to a peripheral.
    fn connect(&self, peripheral: &PeripheralId);

    /// Close the link to a peripheral.
    fn disconnect(&self, peripheral: &PeripheralId);

    /// Discover `service` on a connected peripheral.
    fn discover_services(&self, peripheral: &PeripheralId, service: Uuid);

    /// Discover `characteristic` within `service`.
    fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid);

    /// Enable or disable notifications for a characteristic.
    fn set_notify(&self, peripheral: &PeripheralId, characteristic: Uuid, enabled: bool);

    /// Request the current value of a characteristic.
    fn read_value(&self, peripheral: &PeripheralId, characteristic: Uuid);

    /// Write a characteristic value with response.
    fn write_value(&self, peripheral: &PeripheralId, characteristic: Uuid, value: Bytes);

    /// Look up peripherals the stack already knows by identifier.
    fn retrieve_peripherals(&self, peripherals: Vec<PeripheralId>);
}

/// Peripheral-role capabilities of a BLE stack.
#[cfg_attr(test, mockall::automock)]
pub trait PeripheralTransport: Send + Sync {
    /// Publish a primary service holding one notify-capable, readable
    /// characteristic with no initial value.
    fn publish_service(&self, service: Uuid, characteristic: Uuid);

    /// Remove every published service.
    fn unpublish_all(&self);

    /// Start advertising.
    fn start_advertising(&self, config: &AdvertisingConfig);

    /// Stop advertising.
    fn stop_advertising(&self);

    /// Push a new characteristic value. `targets == None` broadcasts to
    /// every subscribed central.
    fn update_value(&self, characteristic: Uuid, value: Bytes, targets: Option<Vec<CentralToken>>);
}

/// A command for a [`CentralTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCommand {
    /// See [`CentralTransport::start_scan`].
    StartScan {
        /// Scan filter.
        service: Uuid,
    },
    /// See [`CentralTransport::stop_scan`].
    StopScan,
    /// See [`CentralTransport::connect`].
    Connect(PeripheralId),
    /// See [`CentralTransport::disconnect`].
    Disconnect(PeripheralId),
    /// See [`CentralTransport::discover_services`].
    DiscoverServices {
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Service to discover.
        service: Uuid,
    },
    /// See [`CentralTransport::discover_characteristics`].
    DiscoverCharacteristics {
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Owning service.
        service: Uuid,
        /// Characteristic to discover.
        characteristic: Uuid,
    },
    /// See [`CentralTransport::set_notify`].
    SetNotify {
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Characteristic concerned.
        characteristic: Uuid,
        /// Desired notification state.
        enabled: bool,
    },
    /// See [`CentralTransport::read_value`].
    ReadValue {
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Characteristic to read.
        characteristic: Uuid,
    },
    /// See [`CentralTransport::write_value`].
    WriteValue {
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Characteristic to write.
        characteristic: Uuid,
        /// Payload.
        value: Bytes,
    },
    /// See [`CentralTransport::retrieve_peripherals`].
    RetrievePeripherals(Vec<PeripheralId>),
}

impl CentralCommand {
    /// Issue this command on a transport.
    pub fn apply<T: CentralTransport + ?Sized>(self, transport: &T) {
        match self {
            Self::StartScan { service } => transport.start_scan(service),
            Self::StopScan => transport.stop_scan(),
            Self::Connect(peripheral) => transport.connect(&peripheral),
            Self::Disconnect(peripheral) => transport.disconnect(&peripheral),
            Self::DiscoverServices {
                peripheral,
                service,
            } => transport.discover_services(&peripheral, service),
            Self::DiscoverCharacteristics {
                peripheral,
                service,
                characteristic,
            } => transport.discover_characteristics(&peripheral, service, characteristic),
            Self::SetNotify {
                peripheral,
                characteristic,
                enabled,
            } => transport.set_notify(&peripheral, characteristic, enabled),
            Self::ReadValue {
                peripheral,
                characteristic,
            } => transport.read_value(&peripheral, characteristic),
            Self::WriteValue {
                peripheral,
                characteristic,
                value,
            } => transport.write_value(&peripheral, characteristic, value),
            Self::RetrievePeripherals(peripherals) => transport.retrieve_peripherals(peripherals),
        }
    }
}

/// A command for a [`PeripheralTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCommand {
    /// See [`PeripheralTransport::publish_service`].
    PublishService {
        /// Service to publish.
        service: Uuid,
        /// Its single characteristic.
        characteristic: Uuid,
    },
    /// See [`PeripheralTransport::unpublish_all`].
    UnpublishAll,
    /// See [`PeripheralTransport::start_advertising`].
    StartAdvertising(AdvertisingConfig),
    /// See [`PeripheralTransport::stop_advertising`].
    StopAdvertising,
    /// See [`PeripheralTransport::update_value`].
    UpdateValue {
        /// Characteristic to update.
        characteristic: Uuid,
        /// New value.
        value: Bytes,
        /// Recipients; `None` means every subscriber.
        targets: Option<Vec<CentralToken>>,
    },
}

impl PeripheralCommand {
    /// Issue this command on a transport.
    pub fn apply<T: PeripheralTransport + ?Sized>(self, transport: &T) {
        match self {
            Self::PublishService {
                service,
                characteristic,
            } => transport.publish_service(service, characteristic),
            Self::UnpublishAll => transport.unpublish_all(),
            Self::StartAdvertising(config) => transport.start_advertising(&config),
            Self::StopAdvertising => transport.stop_advertising(),
            Self::UpdateValue {
                characteristic,
                value,
                targets,
            } => transport.update_value(characteristic, value, targets),
        }
    }
}
