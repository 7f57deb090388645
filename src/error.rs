//! Error types for the ble-sampler crate.
//!
//! Two kinds of failure live here. [`Error`] is returned when an operation is
//! refused outright. [`Fault`] describes the non-fatal protocol outcomes a
//! session reacts to and, where a user should know, reports as a notice.

use thiserror::Error;

use crate::ble::types::{ErrorCode, PeripheralId, RadioState};

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter could be acquired on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The radio is not powered on; commands are suspended until it is.
    #[error("Radio unavailable (state: {state})")]
    RadioUnavailable {
        /// The radio state at the time of the request.
        state: RadioState,
    },

    /// The peripheral is not in the device registry.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: PeripheralId,
    },

    /// Service or characteristic discovery is already running for the peripheral.
    #[error("Discovery already in progress for {identifier}")]
    DiscoveryInProgress {
        /// The peripheral being discovered.
        identifier: PeripheralId,
    },

    /// Operation requires a ready connection but the peripheral has none.
    #[error("Peripheral not connected: {identifier}")]
    NotConnected {
        /// The peripheral the operation targeted.
        identifier: PeripheralId,
    },

    /// The requested operation is not supported.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// Advertising was requested before a service was published.
    #[error("No service published")]
    ServiceNotPublished,

    /// The session driver has stopped and no longer accepts requests.
    #[error("Session driver closed")]
    ChannelClosed,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal protocol outcomes.
///
/// None of these ends the process. Each one is logged where it happens;
/// the ones a user should see are forwarded as
/// [`Notice::Fault`](crate::session::Notice::Fault).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The radio left the powered-on state.
    #[error("Bluetooth radio unavailable: {state}")]
    RadioUnavailable {
        /// The new radio state.
        state: RadioState,
    },

    /// A connection attempt failed.
    #[error("Failed to connect to {peripheral} (code {code:?})")]
    ConnectFailed {
        /// The peripheral that could not be connected.
        peripheral: PeripheralId,
        /// Transport error code, if one was reported.
        code: Option<ErrorCode>,
    },

    /// The link timed out and the reconnect policy allowed no further attempt.
    #[error("Connection to {peripheral} timed out")]
    ConnectionTimeout {
        /// The peripheral whose link timed out.
        peripheral: PeripheralId,
    },

    /// Service discovery, characteristic discovery or the subscribe request
    /// failed on a live link.
    #[error("Discovery on {peripheral} failed (code {code})")]
    DiscoveryFailed {
        /// The peripheral being discovered.
        peripheral: PeripheralId,
        /// Transport error code.
        code: ErrorCode,
    },

    /// The link closed with an error other than a timeout.
    #[error("The connection to {peripheral} closed (code {code})")]
    OtherDisconnect {
        /// The peripheral that disconnected.
        peripheral: PeripheralId,
        /// Transport error code.
        code: ErrorCode,
    },

    /// The transport could not start advertising.
    #[error("Failed to start advertising (code {code})")]
    AdvertisingFailed {
        /// Transport error code.
        code: ErrorCode,
    },

    /// The transport rejected the published service.
    #[error("Failed to add service (code {code})")]
    ServiceAddFailed {
        /// Transport error code.
        code: ErrorCode,
    },

    /// A characteristic value was missing or not valid UTF-8.
    #[error("Undecodable value from {peripheral}")]
    ValueDecodeFailure {
        /// The peripheral that sent the value.
        peripheral: PeripheralId,
    },
}

impl Fault {
    /// Whether the fault should be shown to the user.
    ///
    /// Connect, discovery and decode failures are only logged.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::DiscoveryFailed { .. }
                | Self::ValueDecodeFailure { .. }
        )
    }
}
