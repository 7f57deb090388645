//! Events delivered by a transport.
//!
//! Every asynchronous callback of the radio stack arrives as one
//! [`TransportEvent`]. Both session machines accept the full enum and ignore
//! the variants that belong to the other role.

use bytes::Bytes;
use uuid::Uuid;

use crate::ble::types::{
    CentralToken, DiscoveredCharacteristic, ErrorCode, PeripheralId, RadioState,
};
use crate::registry::PeripheralDescriptor;

/// An event reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The radio changed power or permission state.
    RadioStateChanged(RadioState),

    /// A scan reported a peripheral advertising the scanned service.
    DeviceDiscovered(PeripheralDescriptor),

    /// Answer to a retrieve request, in the order the transport knows them.
    PeripheralsRetrieved(Vec<PeripheralDescriptor>),

    /// A connect command succeeded.
    Connected(PeripheralId),

    /// A connect command failed.
    ConnectFailed {
        /// Target of the failed connect.
        peripheral: PeripheralId,
        /// Transport error code, if any.
        code: Option<ErrorCode>,
    },

    /// The link closed, on request or not.
    Disconnected {
        /// The peripheral whose link closed.
        peripheral: PeripheralId,
        /// Set when the link closed because of an error.
        code: Option<ErrorCode>,
    },

    /// Service discovery finished.
    ServicesDiscovered {
        /// The peripheral that was queried.
        peripheral: PeripheralId,
        /// Every service the peripheral reported.
        services: Vec<Uuid>,
    },

    /// Characteristic discovery for one service finished.
    CharacteristicsDiscovered {
        /// The peripheral that was queried.
        peripheral: PeripheralId,
        /// The service whose characteristics were listed.
        service: Uuid,
        /// The characteristics and their capabilities.
        characteristics: Vec<DiscoveredCharacteristic>,
    },

    /// Service or characteristic discovery failed.
    DiscoveryFailed {
        /// The peripheral that was queried.
        peripheral: PeripheralId,
        /// Transport error code.
        code: ErrorCode,
    },

    /// The remote acknowledged a change of its notification state.
    NotifyStateChanged {
        /// The peripheral that acknowledged.
        peripheral: PeripheralId,
        /// The characteristic concerned.
        characteristic: Uuid,
        /// Whether notifications are now enabled.
        enabled: bool,
    },

    /// A read completed or a notification arrived.
    ValueUpdated {
        /// The peripheral that sent the value.
        peripheral: PeripheralId,
        /// The characteristic concerned.
        characteristic: Uuid,
        /// The payload. `None` when the stack delivered an event without one.
        value: Option<Bytes>,
    },

    /// A remote central subscribed to a local characteristic.
    CentralSubscribed {
        /// The subscribing central.
        central: CentralToken,
        /// The local characteristic.
        characteristic: Uuid,
    },

    /// A remote central unsubscribed from a local characteristic.
    CentralUnsubscribed {
        /// The unsubscribing central.
        central: CentralToken,
        /// The local characteristic.
        characteristic: Uuid,
    },

    /// Advertising started.
    AdvertisingStarted,

    /// Advertising could not be started.
    AdvertisingFailed(ErrorCode),

    /// Result of publishing a service; `Some` carries the failure code.
    ServiceAdded(Option<ErrorCode>),
}

impl TransportEvent {
    /// The remote peripheral this event concerns, if it is a central-role event.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            Self::DeviceDiscovered(descriptor) => Some(&descriptor.id),
            Self::Connected(peripheral) => Some(peripheral),
            Self::ConnectFailed { peripheral, .. }
            | Self::Disconnected { peripheral, .. }
            | Self::ServicesDiscovered { peripheral, .. }
            | Self::CharacteristicsDiscovered { peripheral, .. }
            | Self::DiscoveryFailed { peripheral, .. }
            | Self::NotifyStateChanged { peripheral, .. }
            | Self::ValueUpdated { peripheral, .. } => Some(peripheral),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_peripheral() {
        let id = PeripheralId::from("AA");
        let event = TransportEvent::Disconnected {
            peripheral: id.clone(),
            code: None,
        };
        assert_eq!(event.peripheral(), Some(&id));
        assert_eq!(TransportEvent::AdvertisingStarted.peripheral(), None);
        assert_eq!(
            TransportEvent::RadioStateChanged(RadioState::PoweredOn).peripheral(),
            None
        );
    }
}
