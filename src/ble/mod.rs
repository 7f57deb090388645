//! BLE transport layer.
//!
//! The traits and value types the session machines talk through, plus two
//! implementations: [`host::HostCentral`] over the host Bluetooth stack and
//! [`memory::MemoryTransport`] for tests and in-process loopback.

pub mod event;
pub mod host;
pub mod memory;
pub mod transport;
pub mod types;
pub mod uuids;

pub use event::TransportEvent;
pub use host::HostCentral;
pub use memory::MemoryTransport;
pub use transport::{CentralCommand, CentralTransport, PeripheralCommand, PeripheralTransport};
pub use types::{
    CentralToken, CharacteristicProperties, ConnectionState, DiscoveredCharacteristic, ErrorCode,
    PeripheralId, RadioState,
};
pub use uuids::*;
