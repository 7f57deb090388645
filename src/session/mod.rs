//! Protocol state machines for the two BLE roles.
//!
//! Both machines are plain values: feed them an operation or a
//! [`TransportEvent`](crate::ble::event::TransportEvent) and they return the
//! effects to carry out, in order. They perform no I/O and read no clock,
//! so a sequence of inputs always produces the same effects.

pub mod central;
pub mod peripheral;

pub use central::{CentralEffect, CentralSession, CentralState, ConnectionSnapshot};
pub use peripheral::{Emission, PeripheralEffect, PeripheralSession, PeripheralState};

use crate::ble::types::{PeripheralId, RadioState};
use crate::error::Fault;

/// A decoded characteristic value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CharacteristicValue {
    /// UTF-8 text.
    Text(String),
    /// The last value could not be decoded.
    Undecodable,
}

impl CharacteristicValue {
    /// The text, if the value was decodable.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Undecodable => None,
        }
    }
}

/// Something a presentation layer may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The radio changed state.
    RadioStateChanged(RadioState),
    /// Registry content or order changed.
    RegistryChanged,
    /// A connection moved to a new state.
    StateChanged {
        /// The peripheral concerned.
        peripheral: PeripheralId,
        /// Its new state.
        state: CentralState,
    },
    /// A new characteristic value was stored.
    ValueChanged {
        /// The peripheral that sent it.
        peripheral: PeripheralId,
        /// The stored value.
        value: CharacteristicValue,
    },
    /// The local service was published or withdrawn.
    ServicePublishedChanged {
        /// Whether a service is now published.
        published: bool,
    },
    /// Advertising was switched on or off.
    AdvertisingChanged {
        /// Whether advertising is now active.
        active: bool,
    },
    /// The number of subscribed centrals changed.
    SubscribersChanged {
        /// The new count.
        count: usize,
    },
    /// A non-fatal fault the user should see.
    Fault(Fault),
}
