//! Value types shared by the transport layer and the session machines.

use std::fmt;

use bitflags::bitflags;
use uuid::Uuid;

/// Stable identifier of a remote peripheral for the current scan session.
///
/// The value is opaque; it only has to be unique per physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of a remote central subscribed to the local peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralToken(String);

impl CentralToken {
    /// Create a token from any string-like value.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl From<&str> for CentralToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl fmt::Display for CentralToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error code reported by the transport alongside a failure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorCode(pub i64);

impl ErrorCode {
    /// Unclassified failure.
    pub const UNKNOWN: ErrorCode = ErrorCode(0);

    /// The link was lost because the remote stopped answering.
    ///
    /// A disconnect carrying this code triggers an immediate reconnect.
    pub const CONNECTION_TIMEOUT: ErrorCode = ErrorCode(10);

    /// Check if this is the connection-timeout code.
    pub fn is_connection_timeout(&self) -> bool {
        *self == Self::CONNECTION_TIMEOUT
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Power and permission state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// State not yet reported.
    #[default]
    Unknown,
    /// The stack is restarting.
    Resetting,
    /// The hardware has no BLE support.
    Unsupported,
    /// The application may not use Bluetooth.
    Unauthorized,
    /// The radio is off.
    PoweredOff,
    /// The radio is on and accepts commands.
    PoweredOn,
}

impl RadioState {
    /// Check if commands may be issued.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// Check if the state reports a lasting lack of radio access, as opposed
    /// to a transitional one.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unsupported | Self::Unauthorized | Self::PoweredOff
        )
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Link-level connection state of a registry entry, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// A connect command is outstanding.
    Connecting,
    /// The link is up.
    Connected,
    /// A disconnect command is outstanding.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

bitflags! {
    /// GATT characteristic property bits, using the on-air bit positions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CharacteristicProperties: u8 {
        /// The value may be broadcast in advertisements.
        const BROADCAST = 0x01;
        /// The value can be read.
        const READ = 0x02;
        /// The value can be written without a response.
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// The value can be written with a response.
        const WRITE = 0x08;
        /// The value can be pushed to subscribers without acknowledgement.
        const NOTIFY = 0x10;
        /// The value can be pushed to subscribers with acknowledgement.
        const INDICATE = 0x20;
        /// Signed writes are accepted.
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        /// Extended properties descriptor present.
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// A characteristic reported by characteristic discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Capability bits.
    pub properties: CharacteristicProperties,
}

impl DiscoveredCharacteristic {
    /// Create a discovered characteristic.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }
}
