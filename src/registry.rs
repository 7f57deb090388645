//! Registry of peripherals seen while scanning.
//!
//! Entries are keyed by [`PeripheralId`] and kept in first-seen order, which
//! is the order a presentation layer lists them in.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::ble::types::{ConnectionState, PeripheralId};

/// Name shown for peripherals that did not advertise one.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// A remote device seen during scanning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralDescriptor {
    /// Stable identifier.
    pub id: PeripheralId,
    /// Advertised local name.
    pub name: Option<String>,
    /// Link state, owned by the central session.
    pub connection: ConnectionState,
    /// Signal strength in dBm at discovery time.
    pub rssi: Option<i16>,
    /// When the transport first reported the device.
    pub discovered_at: DateTime<Utc>,
}

impl PeripheralDescriptor {
    /// Create a disconnected descriptor discovered now.
    pub fn new(id: impl Into<PeripheralId>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            connection: ConnectionState::Disconnected,
            rssi: None,
            discovered_at: Utc::now(),
        }
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Set the connection state.
    pub fn with_connection(mut self, connection: ConnectionState) -> Self {
        self.connection = connection;
        self
    }

    /// Name to display, falling back to [`UNKNOWN_DEVICE_NAME`].
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

/// De-duplicated, insertion-ordered collection of discovered peripherals.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    entries: Vec<PeripheralDescriptor>,
    index: HashMap<PeripheralId, usize>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor unless its identifier is already present.
    ///
    /// Returns `true` if the descriptor was added. The first occurrence
    /// wins; later ones are ignored entirely.
    pub fn upsert(&mut self, descriptor: PeripheralDescriptor) -> bool {
        if self.index.contains_key(&descriptor.id) {
            return false;
        }
        self.index
            .insert(descriptor.id.clone(), self.entries.len());
        self.entries.push(descriptor);
        true
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Replace the content with `descriptors`, keeping their order and
    /// dropping duplicates.
    pub fn replace_all(&mut self, descriptors: impl IntoIterator<Item = PeripheralDescriptor>) {
        self.clear();
        for descriptor in descriptors {
            self.upsert(descriptor);
        }
    }

    /// Look up an entry.
    pub fn get(&self, id: &PeripheralId) -> Option<&PeripheralDescriptor> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Check if an entry exists.
    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.index.contains_key(id)
    }

    /// Entries in first-seen order.
    pub fn list_ordered(&self) -> &[PeripheralDescriptor] {
        &self.entries
    }

    /// Identifiers in first-seen order.
    pub fn ids(&self) -> Vec<PeripheralId> {
        self.entries.iter().map(|d| d.id.clone()).collect()
    }

    /// Identifiers of entries whose link is up, in first-seen order.
    pub fn connected_ids(&self) -> Vec<PeripheralId> {
        self.entries
            .iter()
            .filter(|d| d.connection.is_connected())
            .map(|d| d.id.clone())
            .collect()
    }

    /// Update the connection state of an entry.
    ///
    /// Does nothing if the entry is absent: the device may have vanished
    /// while a transition was in flight.
    pub fn set_connection_state(&mut self, id: &PeripheralId, state: ConnectionState) {
        if let Some(&i) = self.index.get(id) {
            self.entries[i].connection = state;
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
