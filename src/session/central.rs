//! Central-role session.
//!
//! Drives scanning and, per peripheral, the sequence
//! `Connecting → Connected → DiscoveringServices → DiscoveringCharacteristics
//! → Subscribing → Ready`. One [`CentralSession`] exists per central screen;
//! it tracks at most one connection per peripheral.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::event::TransportEvent;
use crate::ble::transport::CentralCommand;
use crate::ble::types::{
    CharacteristicProperties, ConnectionState, DiscoveredCharacteristic, ErrorCode,
    PeripheralId, RadioState,
};
use crate::config::{CentralConfig, DecodeFailurePolicy};
use crate::error::{Error, Fault, Result};
use crate::registry::DeviceRegistry;
use crate::session::{CharacteristicValue, Notice};

/// Protocol state of the central role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CentralState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// A scan is running.
    Scanning,
    /// Peripherals were found; none is selected.
    Discovered,
    /// Waiting for the link.
    Connecting,
    /// Link is up.
    Connected,
    /// Looking for the sampler service.
    DiscoveringServices,
    /// Looking for the sampler characteristic.
    DiscoveringCharacteristics,
    /// Notifications requested, waiting for the acknowledgement.
    Subscribing,
    /// Values are streaming in.
    Ready,
    /// Waiting for the link to close.
    Disconnecting,
    /// The last connection attempt failed.
    Failed,
}

impl CentralState {
    /// Check if service or characteristic discovery is under way.
    pub fn is_discovering(&self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::DiscoveringCharacteristics | Self::Subscribing
        )
    }

    /// Link-level state shown in the registry for a connection in this state.
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Connecting => ConnectionState::Connecting,
            Self::Connected
            | Self::DiscoveringServices
            | Self::DiscoveringCharacteristics
            | Self::Subscribing
            | Self::Ready => ConnectionState::Connected,
            Self::Disconnecting => ConnectionState::Disconnecting,
            Self::Idle | Self::Scanning | Self::Discovered | Self::Failed => {
                ConnectionState::Disconnected
            }
        }
    }
}

impl fmt::Display for CentralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Discovered => "Discovered",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::DiscoveringServices => "DiscoveringServices",
            Self::DiscoveringCharacteristics => "DiscoveringCharacteristics",
            Self::Subscribing => "Subscribing",
            Self::Ready => "Ready",
            Self::Disconnecting => "Disconnecting",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Something the caller must do after a central-session step.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEffect {
    /// Issue a transport command.
    Command(CentralCommand),
    /// Arm the scan timer. Replaces any timer already armed.
    ScheduleScanTimeout {
        /// Pass back to [`CentralSession::on_scan_timeout`] when it fires.
        generation: u64,
        /// Delay before firing.
        after: Duration,
    },
    /// Disarm the scan timer.
    CancelScanTimeout,
    /// Inform the presentation layer.
    Notice(Notice),
}

/// Read-only view of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    /// The connected peripheral.
    pub peripheral: PeripheralId,
    /// Its protocol state.
    pub state: CentralState,
    /// Last stored characteristic value.
    pub value: Option<CharacteristicValue>,
    /// Capabilities of the sampler characteristic, once discovered.
    pub properties: Option<CharacteristicProperties>,
}

#[derive(Debug, Clone)]
struct Connection {
    state: CentralState,
    value: Option<CharacteristicValue>,
    properties: Option<CharacteristicProperties>,
    reconnects: u32,
    // Connect requested while the previous link was still closing.
    reconnect_queued: bool,
}

impl Connection {
    fn new() -> Self {
        Self {
            state: CentralState::Connecting,
            value: None,
            properties: None,
            reconnects: 0,
            reconnect_queued: false,
        }
    }
}

/// The central-role state machine.
#[derive(Debug)]
pub struct CentralSession {
    config: CentralConfig,
    radio: RadioState,
    scanning: bool,
    scan_generation: u64,
    registry: DeviceRegistry,
    connections: BTreeMap<PeripheralId, Connection>,
    focused: Option<PeripheralId>,
}

impl CentralSession {
    /// Create an idle session. Commands stay suspended until the transport
    /// reports [`RadioState::PoweredOn`].
    pub fn new(config: CentralConfig) -> Self {
        Self {
            config,
            radio: RadioState::Unknown,
            scanning: false,
            scan_generation: 0,
            registry: DeviceRegistry::new(),
            connections: BTreeMap::new(),
            focused: None,
        }
    }

    // === Queries ===

    /// Get the session configuration.
    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Get the last reported radio state.
    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Get the discovered peripherals.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The peripheral most recently selected for connection, while its
    /// connection is alive.
    pub fn focused(&self) -> Option<&PeripheralId> {
        self.focused.as_ref()
    }

    /// Overall state: the focused connection's state if there is one,
    /// otherwise the scan and registry state.
    pub fn state(&self) -> CentralState {
        if let Some(connection) = self.focused.as_ref().and_then(|id| self.connections.get(id)) {
            return connection.state;
        }
        if self.scanning {
            CentralState::Scanning
        } else if !self.registry.is_empty() {
            CentralState::Discovered
        } else {
            CentralState::Idle
        }
    }

    /// State of the connection to `peripheral`, or `Idle` if there is none.
    pub fn connection_state(&self, peripheral: &PeripheralId) -> CentralState {
        self.connections
            .get(peripheral)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    /// Last stored value from `peripheral`.
    pub fn value(&self, peripheral: &PeripheralId) -> Option<&CharacteristicValue> {
        self.connections
            .get(peripheral)
            .and_then(|c| c.value.as_ref())
    }

    /// Snapshot of the connection to `peripheral`.
    pub fn connection(&self, peripheral: &PeripheralId) -> Option<ConnectionSnapshot> {
        self.connections
            .get(peripheral)
            .map(|c| snapshot(peripheral, c))
    }

    /// Snapshots of every connection, ordered by peripheral identifier.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|(id, c)| snapshot(id, c))
            .collect()
    }

    // === Scanning ===

    /// Clear the registry and scan for the configured service.
    ///
    /// Restarting a running scan re-arms the timeout.
    pub fn start_scan(&mut self) -> Result<Vec<CentralEffect>> {
        self.ensure_powered()?;

        let mut fx = Vec::new();
        if self.scanning {
            debug!("Scan already running, restarting");
            fx.push(CentralEffect::CancelScanTimeout);
        }

        info!("Starting scan for service {}", self.config.service_id);

        self.registry.clear();
        fx.push(CentralEffect::Notice(Notice::RegistryChanged));

        self.scanning = true;
        self.scan_generation = self.scan_generation.wrapping_add(1);
        fx.push(CentralEffect::Command(CentralCommand::StartScan {
            service: self.config.service_id,
        }));
        fx.push(CentralEffect::ScheduleScanTimeout {
            generation: self.scan_generation,
            after: self.config.scan_timeout,
        });

        Ok(fx)
    }

    /// Stop a running scan. Discovered peripherals are kept.
    pub fn stop_scan(&mut self) -> Vec<CentralEffect> {
        if !self.scanning {
            debug!("Not scanning, ignoring stop request");
            return Vec::new();
        }

        info!("Stopping scan ({} peripherals found)", self.registry.len());
        self.scanning = false;
        vec![
            CentralEffect::CancelScanTimeout,
            CentralEffect::Command(CentralCommand::StopScan),
        ]
    }

    /// Handle expiry of the scan timer armed with `generation`.
    ///
    /// Timers from an earlier scan are ignored.
    pub fn on_scan_timeout(&mut self, generation: u64) -> Vec<CentralEffect> {
        if !self.scanning || generation != self.scan_generation {
            debug!("Ignoring stale scan timeout (generation {})", generation);
            return Vec::new();
        }

        info!("Scan timed out ({} peripherals found)", self.registry.len());
        self.scanning = false;
        vec![CentralEffect::Command(CentralCommand::StopScan)]
    }

    /// Ask the transport for its current view of the peripherals in the registry.
    pub fn retrieve_known(&mut self) -> Result<Vec<CentralEffect>> {
        self.ensure_powered()?;

        Ok(vec![CentralEffect::Command(
            CentralCommand::RetrievePeripherals(self.registry.ids()),
        )])
    }

    // === Connections ===

    /// Connect to a registry entry.
    ///
    /// # Errors
    ///
    /// - [`Error::RadioUnavailable`] while the radio is not powered on.
    /// - [`Error::PeripheralNotFound`] if the entry is not in the registry.
    /// - [`Error::DiscoveryInProgress`] if the peripheral is being discovered.
    ///
    /// While the previous link is still closing the request is queued and
    /// issued once the transport reports the disconnect.
    pub fn connect(&mut self, peripheral: &PeripheralId) -> Result<Vec<CentralEffect>> {
        self.ensure_powered()?;

        if !self.registry.contains(peripheral) {
            return Err(Error::PeripheralNotFound {
                identifier: peripheral.clone(),
            });
        }

        if let Some(connection) = self.connections.get_mut(peripheral) {
            if connection.state == CentralState::Disconnecting {
                debug!("{} still disconnecting, queueing connect", peripheral);
                connection.reconnect_queued = true;
                self.focused = Some(peripheral.clone());
                return Ok(Vec::new());
            }
            if connection.state.is_discovering() {
                return Err(Error::DiscoveryInProgress {
                    identifier: peripheral.clone(),
                });
            }
            if matches!(
                connection.state,
                CentralState::Connecting | CentralState::Connected | CentralState::Ready
            ) {
                debug!("{} already {}, ignoring connect", peripheral, connection.state);
                self.focused = Some(peripheral.clone());
                return Ok(Vec::new());
            }
        }

        info!("Connecting to {}", peripheral);

        let mut fx = Vec::new();
        self.begin_connect(peripheral, &mut fx);
        self.focused = Some(peripheral.clone());
        Ok(fx)
    }

    /// Disconnect from a peripheral. Does nothing without a connection.
    ///
    /// A connect queued behind a pending disconnect is cancelled.
    pub fn disconnect(&mut self, peripheral: &PeripheralId) -> Vec<CentralEffect> {
        let connection = match self.connections.get_mut(peripheral) {
            Some(connection) => connection,
            None => {
                debug!("No connection to {}, ignoring disconnect", peripheral);
                return Vec::new();
            }
        };
        if connection.state == CentralState::Disconnecting {
            if connection.reconnect_queued {
                debug!("Cancelling queued connect to {}", peripheral);
                connection.reconnect_queued = false;
            }
            if self.focused.as_ref() == Some(peripheral) {
                self.focused = None;
            }
            return Vec::new();
        }

        info!("Disconnecting from {}", peripheral);

        let mut fx = Vec::new();
        self.set_state(peripheral, CentralState::Disconnecting, &mut fx);
        fx.push(CentralEffect::Command(CentralCommand::Disconnect(
            peripheral.clone(),
        )));
        if self.focused.as_ref() == Some(peripheral) {
            self.focused = None;
        }
        fx
    }

    /// Toggle a registry entry: disconnect it if it is the focused live
    /// connection, connect to it otherwise.
    pub fn select(&mut self, peripheral: &PeripheralId) -> Result<Vec<CentralEffect>> {
        let is_focused = self.focused.as_ref() == Some(peripheral);
        if is_focused && self.connections.contains_key(peripheral) {
            Ok(self.disconnect(peripheral))
        } else {
            self.connect(peripheral)
        }
    }

    /// Write to the sampler characteristic of a ready peripheral.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the connection is `Ready`.
    /// - [`Error::NotSupported`] if the characteristic is not writable.
    pub fn write_value(
        &mut self,
        peripheral: &PeripheralId,
        value: impl Into<Bytes>,
    ) -> Result<Vec<CentralEffect>> {
        self.ensure_powered()?;

        let connection = self
            .connections
            .get(peripheral)
            .filter(|c| c.state == CentralState::Ready)
            .ok_or_else(|| Error::NotConnected {
                identifier: peripheral.clone(),
            })?;

        let writable = connection
            .properties
            .map(|p| p.contains(CharacteristicProperties::WRITE))
            .unwrap_or(false);
        if !writable {
            return Err(Error::NotSupported {
                operation: format!("write to {}", self.config.characteristic_id),
            });
        }

        let value = value.into();
        trace!("Writing {} bytes to {}", value.len(), peripheral);

        Ok(vec![CentralEffect::Command(CentralCommand::WriteValue {
            peripheral: peripheral.clone(),
            characteristic: self.config.characteristic_id,
            value,
        })])
    }

    /// Tear the session down: stop scanning, disconnect every connected
    /// peripheral and clear the registry.
    ///
    /// Tracked links that are up are disconnected even if their registry
    /// entry was lost to a rescan.
    pub fn teardown(&mut self) -> Vec<CentralEffect> {
        let mut fx = Vec::new();

        if self.scanning {
            self.scanning = false;
            fx.push(CentralEffect::CancelScanTimeout);
            fx.push(CentralEffect::Command(CentralCommand::StopScan));
        }

        let mut connected = self.registry.connected_ids();
        for (id, connection) in &self.connections {
            if connection.state.connection_state().is_connected() && !connected.contains(id) {
                connected.push(id.clone());
            }
        }
        info!(
            "Tearing down central session ({} connected)",
            connected.len()
        );
        for peripheral in connected {
            fx.push(CentralEffect::Command(CentralCommand::Disconnect(peripheral)));
        }

        self.registry.clear();
        self.connections.clear();
        self.focused = None;
        fx
    }

    // === Transport events ===

    /// Feed one transport event into the machine.
    ///
    /// Peripheral-role events are ignored. While the radio is not powered
    /// on, no transport command is produced.
    pub fn handle_event(&mut self, event: &TransportEvent) -> Vec<CentralEffect> {
        let mut fx = Vec::new();

        match event {
            TransportEvent::RadioStateChanged(state) => self.on_radio_state(*state, &mut fx),
            TransportEvent::DeviceDiscovered(descriptor) => {
                if self.registry.upsert(descriptor.clone()) {
                    debug!(
                        "Discovered {} ({})",
                        descriptor.display_name(),
                        descriptor.id
                    );
                    if let Some(connection) = self.connections.get(&descriptor.id) {
                        self.registry.set_connection_state(
                            &descriptor.id,
                            connection.state.connection_state(),
                        );
                    }
                    fx.push(CentralEffect::Notice(Notice::RegistryChanged));
                } else {
                    trace!("Duplicate discovery of {}", descriptor.id);
                }
            }
            TransportEvent::PeripheralsRetrieved(descriptors) => {
                self.registry.replace_all(descriptors.iter().cloned());
                for (id, connection) in &self.connections {
                    self.registry
                        .set_connection_state(id, connection.state.connection_state());
                }
                fx.push(CentralEffect::Notice(Notice::RegistryChanged));
            }
            TransportEvent::Connected(peripheral) => self.on_connected(peripheral, &mut fx),
            TransportEvent::ConnectFailed { peripheral, code } => {
                self.on_connect_failed(peripheral, *code, &mut fx)
            }
            TransportEvent::Disconnected { peripheral, code } => {
                self.on_disconnected(peripheral, *code, &mut fx)
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
            } => self.on_services_discovered(peripheral, services, &mut fx),
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
            } => self.on_characteristics_discovered(peripheral, *service, characteristics, &mut fx),
            TransportEvent::DiscoveryFailed { peripheral, code } => {
                self.on_discovery_failed(peripheral, *code, &mut fx)
            }
            TransportEvent::NotifyStateChanged {
                peripheral,
                characteristic,
                enabled,
            } => self.on_notify_state_changed(peripheral, *characteristic, *enabled, &mut fx),
            TransportEvent::ValueUpdated {
                peripheral,
                characteristic,
                value,
            } => self.on_value_updated(peripheral, *characteristic, value.as_ref(), &mut fx),
            TransportEvent::CentralSubscribed { .. }
            | TransportEvent::CentralUnsubscribed { .. }
            | TransportEvent::AdvertisingStarted
            | TransportEvent::AdvertisingFailed(_)
            | TransportEvent::ServiceAdded(_) => {}
        }

        if !self.radio.is_powered_on() {
            let before = fx.len();
            fx.retain(|effect| !matches!(effect, CentralEffect::Command(_)));
            if fx.len() != before {
                debug!("Radio {}, suppressed {} command(s)", self.radio, before - fx.len());
            }
        }

        fx
    }

    fn on_radio_state(&mut self, state: RadioState, fx: &mut Vec<CentralEffect>) {
        if self.radio == state {
            return;
        }

        info!("Central radio state: {} -> {}", self.radio, state);
        self.radio = state;
        fx.push(CentralEffect::Notice(Notice::RadioStateChanged(state)));

        if state.is_powered_on() {
            return;
        }

        if self.scanning {
            self.scanning = false;
            fx.push(CentralEffect::CancelScanTimeout);
        }

        let dropped: Vec<PeripheralId> = std::mem::take(&mut self.connections)
            .into_keys()
            .collect();
        for peripheral in dropped {
            self.registry
                .set_connection_state(&peripheral, ConnectionState::Disconnected);
            fx.push(CentralEffect::Notice(Notice::StateChanged {
                peripheral,
                state: CentralState::Idle,
            }));
        }
        self.focused = None;

        if state.is_unavailable() {
            let fault = Fault::RadioUnavailable { state };
            warn!("{}", fault);
            fx.push(CentralEffect::Notice(Notice::Fault(fault)));
        }
    }

    fn on_connected(&mut self, peripheral: &PeripheralId, fx: &mut Vec<CentralEffect>) {
        match self.connections.get(peripheral).map(|c| c.state) {
            Some(CentralState::Connecting) => {}
            Some(state) => {
                debug!("Ignoring duplicate connect event for {} ({})", peripheral, state);
                return;
            }
            None => {
                debug!("Ignoring connect event for untracked {}", peripheral);
                return;
            }
        }

        info!("Connected to {}", peripheral);
        self.registry
            .set_connection_state(peripheral, ConnectionState::Connected);
        self.set_state(peripheral, CentralState::Connected, fx);

        self.set_state(peripheral, CentralState::DiscoveringServices, fx);
        fx.push(CentralEffect::Command(CentralCommand::DiscoverServices {
            peripheral: peripheral.clone(),
            service: self.config.service_id,
        }));
    }

    fn on_connect_failed(
        &mut self,
        peripheral: &PeripheralId,
        code: Option<ErrorCode>,
        fx: &mut Vec<CentralEffect>,
    ) {
        if self.connection_state(peripheral) != CentralState::Connecting {
            debug!("Ignoring connect failure for {}", peripheral);
            return;
        }

        let fault = Fault::ConnectFailed {
            peripheral: peripheral.clone(),
            code,
        };
        warn!("{}", fault);

        self.set_state(peripheral, CentralState::Failed, fx);
        self.drop_connection(peripheral, fx);
    }

    fn on_disconnected(
        &mut self,
        peripheral: &PeripheralId,
        code: Option<ErrorCode>,
        fx: &mut Vec<CentralEffect>,
    ) {
        let previous = self.connections.get(peripheral).map(|c| c.state);
        let deliberate = previous == Some(CentralState::Disconnecting);
        let queued = deliberate
            && self
                .connections
                .get(peripheral)
                .map(|c| c.reconnect_queued)
                .unwrap_or(false);
        let known = previous.is_some() || self.registry.contains(peripheral);

        self.registry
            .set_connection_state(peripheral, ConnectionState::Disconnected);

        let fault = match code {
            Some(code) if code.is_connection_timeout() => {
                if deliberate || !known || !self.radio.is_powered_on() {
                    None
                } else {
                    let attempts = self
                        .connections
                        .get(peripheral)
                        .map(|c| c.reconnects)
                        .unwrap_or(0);
                    if self.config.reconnect.allows(attempts) {
                        info!(
                            "Connection to {} timed out, reconnecting (attempt {})",
                            peripheral,
                            attempts + 1
                        );
                        self.begin_connect(peripheral, fx);
                        if let Some(connection) = self.connections.get_mut(peripheral) {
                            connection.reconnects = attempts + 1;
                        }
                        return;
                    }
                    Some(Fault::ConnectionTimeout {
                        peripheral: peripheral.clone(),
                    })
                }
            }
            Some(code) => Some(Fault::OtherDisconnect {
                peripheral: peripheral.clone(),
                code,
            }),
            None => None,
        };

        match fault {
            Some(fault) => {
                warn!("{}", fault);
                fx.push(CentralEffect::Notice(Notice::Fault(fault)));
            }
            None => info!("Disconnected from {}", peripheral),
        }

        if previous.is_some() {
            self.drop_connection(peripheral, fx);
        }

        if queued && self.radio.is_powered_on() && self.registry.contains(peripheral) {
            info!("Connecting to {} after disconnect", peripheral);
            self.begin_connect(peripheral, fx);
            self.focused = Some(peripheral.clone());
        }
    }

    fn on_discovery_failed(
        &mut self,
        peripheral: &PeripheralId,
        code: ErrorCode,
        fx: &mut Vec<CentralEffect>,
    ) {
        if !self.connection_state(peripheral).is_discovering() {
            debug!("Ignoring discovery failure for {}", peripheral);
            return;
        }

        let fault = Fault::DiscoveryFailed {
            peripheral: peripheral.clone(),
            code,
        };
        warn!("{}", fault);

        self.set_state(peripheral, CentralState::Failed, fx);
        self.set_state(peripheral, CentralState::Disconnecting, fx);
        fx.push(CentralEffect::Command(CentralCommand::Disconnect(
            peripheral.clone(),
        )));
    }

    fn on_services_discovered(
        &mut self,
        peripheral: &PeripheralId,
        services: &[Uuid],
        fx: &mut Vec<CentralEffect>,
    ) {
        if self.connection_state(peripheral) != CentralState::DiscoveringServices {
            debug!("Ignoring services of {}", peripheral);
            return;
        }
        if !services.contains(&self.config.service_id) {
            debug!("{} does not offer {}", peripheral, self.config.service_id);
            return;
        }

        self.set_state(peripheral, CentralState::DiscoveringCharacteristics, fx);
        fx.push(CentralEffect::Command(
            CentralCommand::DiscoverCharacteristics {
                peripheral: peripheral.clone(),
                service: self.config.service_id,
                characteristic: self.config.characteristic_id,
            },
        ));
    }

    fn on_characteristics_discovered(
        &mut self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: &[DiscoveredCharacteristic],
        fx: &mut Vec<CentralEffect>,
    ) {
        if self.connection_state(peripheral) != CentralState::DiscoveringCharacteristics
            || service != self.config.service_id
        {
            debug!("Ignoring characteristics of {} on {}", service, peripheral);
            return;
        }

        let characteristic_id = self.config.characteristic_id;
        let found = match characteristics.iter().find(|c| c.uuid == characteristic_id) {
            Some(found) => found,
            None => {
                debug!("{} does not offer {}", peripheral, characteristic_id);
                return;
            }
        };

        if let Some(connection) = self.connections.get_mut(peripheral) {
            connection.properties = Some(found.properties);
        }
        if !found.properties.contains(CharacteristicProperties::NOTIFY) {
            debug!("{} on {} cannot notify", characteristic_id, peripheral);
            return;
        }

        self.set_state(peripheral, CentralState::Subscribing, fx);
        fx.push(CentralEffect::Command(CentralCommand::SetNotify {
            peripheral: peripheral.clone(),
            characteristic: characteristic_id,
            enabled: true,
        }));
        fx.push(CentralEffect::Command(CentralCommand::ReadValue {
            peripheral: peripheral.clone(),
            characteristic: characteristic_id,
        }));
    }

    fn on_notify_state_changed(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        enabled: bool,
        fx: &mut Vec<CentralEffect>,
    ) {
        if characteristic != self.config.characteristic_id
            || !enabled
            || self.connection_state(peripheral) != CentralState::Subscribing
        {
            debug!(
                "Ignoring notify state {} for {} on {}",
                enabled, characteristic, peripheral
            );
            return;
        }

        info!("Subscribed to {} on {}", characteristic, peripheral);
        if let Some(connection) = self.connections.get_mut(peripheral) {
            connection.reconnects = 0;
        }
        self.set_state(peripheral, CentralState::Ready, fx);
    }

    fn on_value_updated(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        value: Option<&Bytes>,
        fx: &mut Vec<CentralEffect>,
    ) {
        if characteristic != self.config.characteristic_id {
            trace!("Ignoring value of {} from {}", characteristic, peripheral);
            return;
        }

        let policy = self.config.decode_failure;
        let connection = match self.connections.get_mut(peripheral) {
            Some(c) if matches!(c.state, CentralState::Subscribing | CentralState::Ready) => c,
            _ => {
                debug!("Ignoring value from {} outside a subscription", peripheral);
                return;
            }
        };

        let decoded = value.and_then(|bytes| std::str::from_utf8(bytes).ok());
        let stored = match (decoded, policy) {
            (Some(text), _) => {
                trace!("Value from {}: {:?}", peripheral, text);
                CharacteristicValue::Text(text.to_owned())
            }
            (None, DecodeFailurePolicy::RetainStale) => {
                debug!(
                    "{}, keeping previous value",
                    Fault::ValueDecodeFailure {
                        peripheral: peripheral.clone()
                    }
                );
                return;
            }
            (None, DecodeFailurePolicy::MarkUnknown) => {
                debug!(
                    "{}",
                    Fault::ValueDecodeFailure {
                        peripheral: peripheral.clone()
                    }
                );
                CharacteristicValue::Undecodable
            }
        };

        connection.value = Some(stored.clone());
        fx.push(CentralEffect::Notice(Notice::ValueChanged {
            peripheral: peripheral.clone(),
            value: stored,
        }));
    }

    // === Internal ===

    fn ensure_powered(&self) -> Result<()> {
        if self.radio.is_powered_on() {
            Ok(())
        } else {
            Err(Error::RadioUnavailable { state: self.radio })
        }
    }

    fn begin_connect(&mut self, peripheral: &PeripheralId, fx: &mut Vec<CentralEffect>) {
        self.connections
            .entry(peripheral.clone())
            .or_insert_with(Connection::new);
        self.registry
            .set_connection_state(peripheral, ConnectionState::Connecting);
        self.set_state(peripheral, CentralState::Connecting, fx);
        fx.push(CentralEffect::Command(CentralCommand::Connect(
            peripheral.clone(),
        )));
    }

    fn drop_connection(&mut self, peripheral: &PeripheralId, fx: &mut Vec<CentralEffect>) {
        self.connections.remove(peripheral);
        self.registry
            .set_connection_state(peripheral, ConnectionState::Disconnected);
        if self.focused.as_ref() == Some(peripheral) {
            self.focused = None;
        }
        fx.push(CentralEffect::Notice(Notice::StateChanged {
            peripheral: peripheral.clone(),
            state: CentralState::Idle,
        }));
    }

    fn set_state(
        &mut self,
        peripheral: &PeripheralId,
        state: CentralState,
        fx: &mut Vec<CentralEffect>,
    ) {
        if let Some(connection) = self.connections.get_mut(peripheral) {
            if connection.state != state {
                debug!("{}: {} -> {}", peripheral, connection.state, state);
            }
            connection.state = state;
            fx.push(CentralEffect::Notice(Notice::StateChanged {
                peripheral: peripheral.clone(),
                state,
            }));
        }
    }
}

fn snapshot(peripheral: &PeripheralId, connection: &Connection) -> ConnectionSnapshot {
    ConnectionSnapshot {
        peripheral: peripheral.clone(),
        state: connection.state,
        value: connection.value.clone(),
        properties: connection.properties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{SAMPLER_CHARACTERISTIC_UUID, SAMPLER_SERVICE_UUID};
    use crate::config::ReconnectPolicy;
    use crate::registry::PeripheralDescriptor;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};

    fn id(s: &str) -> PeripheralId {
        PeripheralId::from(s)
    }

    fn powered(config: CentralConfig) -> CentralSession {
        let mut session = CentralSession::new(config);
        session.handle_event(&TransportEvent::RadioStateChanged(RadioState::PoweredOn));
        session
    }

    fn discover(session: &mut CentralSession, peripheral: &str) {
        session.handle_event(&TransportEvent::DeviceDiscovered(PeripheralDescriptor::new(
            peripheral,
            Some(format!("sampler-{peripheral}")),
        )));
    }

    fn commands(fx: &[CentralEffect]) -> Vec<CentralCommand> {
        fx.iter()
            .filter_map(|effect| match effect {
                CentralEffect::Command(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    fn faults(fx: &[CentralEffect]) -> Vec<Fault> {
        fx.iter()
            .filter_map(|effect| match effect {
                CentralEffect::Notice(Notice::Fault(fault)) => Some(fault.clone()),
                _ => None,
            })
            .collect()
    }

    fn sampler_characteristic(properties: CharacteristicProperties) -> TransportEvent {
        TransportEvent::CharacteristicsDiscovered {
            peripheral: id("A"),
            service: SAMPLER_SERVICE_UUID,
            characteristics: vec![DiscoveredCharacteristic::new(
                SAMPLER_CHARACTERISTIC_UUID,
                properties,
            )],
        }
    }

    fn value(peripheral: &str, bytes: Option<&'static [u8]>) -> TransportEvent {
        TransportEvent::ValueUpdated {
            peripheral: id(peripheral),
            characteristic: SAMPLER_CHARACTERISTIC_UUID,
            value: bytes.map(Bytes::from_static),
        }
    }

    /// Drive peripheral "A" from discovery to `Ready`.
    fn ready_session(config: CentralConfig, properties: CharacteristicProperties) -> CentralSession {
        let mut session = powered(config);
        discover(&mut session, "A");
        assert_ok!(session.connect(&id("A")));
        session.handle_event(&TransportEvent::Connected(id("A")));
        session.handle_event(&TransportEvent::ServicesDiscovered {
            peripheral: id("A"),
            services: vec![SAMPLER_SERVICE_UUID],
        });
        session.handle_event(&sampler_characteristic(properties));
        session.handle_event(&TransportEvent::NotifyStateChanged {
            peripheral: id("A"),
            characteristic: SAMPLER_CHARACTERISTIC_UUID,
            enabled: true,
        });
        assert_eq!(session.connection_state(&id("A")), CentralState::Ready);
        session
    }

    #[test]
    fn test_commands_suspended_until_powered_on() {
        let mut session = CentralSession::new(CentralConfig::default());
        let err = assert_err!(session.start_scan());
        assert!(matches!(
            err,
            Error::RadioUnavailable {
                state: RadioState::Unknown
            }
        ));
        assert_eq!(session.state(), CentralState::Idle);
    }

    #[test]
    fn test_start_scan_clears_registry_and_arms_timer() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "old");

        let fx = assert_ok!(session.start_scan());

        assert!(session.registry().is_empty());
        assert!(session.is_scanning());
        assert_eq!(session.state(), CentralState::Scanning);
        assert_eq!(
            commands(&fx),
            vec![CentralCommand::StartScan {
                service: SAMPLER_SERVICE_UUID
            }]
        );
        assert!(fx.contains(&CentralEffect::ScheduleScanTimeout {
            generation: 1,
            after: Duration::from_secs(1),
        }));
    }

    #[test]
    fn test_discovery_deduplicates_in_first_seen_order() {
        let mut session = powered(CentralConfig::default());
        assert_ok!(session.start_scan());
        for peripheral in ["A", "B", "A", "C"] {
            discover(&mut session, peripheral);
        }

        assert_eq!(session.registry().ids(), vec![id("A"), id("B"), id("C")]);
        assert_eq!(session.state(), CentralState::Scanning);
    }

    #[test]
    fn test_scan_timeout_stops_scan_once() {
        let mut session = powered(CentralConfig::default());
        assert_ok!(session.start_scan());
        discover(&mut session, "A");

        let fx = session.on_scan_timeout(1);
        assert_eq!(commands(&fx), vec![CentralCommand::StopScan]);
        assert_eq!(session.state(), CentralState::Discovered);
        assert_eq!(session.registry().len(), 1);

        assert!(session.on_scan_timeout(1).is_empty());
    }

    #[test]
    fn test_manual_stop_cancels_timeout() {
        let mut session = powered(CentralConfig::default());
        assert_ok!(session.start_scan());

        let fx = session.stop_scan();
        assert_eq!(
            fx,
            vec![
                CentralEffect::CancelScanTimeout,
                CentralEffect::Command(CentralCommand::StopScan)
            ]
        );

        assert!(session.on_scan_timeout(1).is_empty());
        assert!(session.stop_scan().is_empty());
    }

    #[test]
    fn test_restart_ignores_previous_timeout() {
        let mut session = powered(CentralConfig::default());
        assert_ok!(session.start_scan());
        let fx = assert_ok!(session.start_scan());

        assert_eq!(fx.first(), Some(&CentralEffect::CancelScanTimeout));
        assert!(session.on_scan_timeout(1).is_empty());
        assert_eq!(commands(&session.on_scan_timeout(2)), vec![CentralCommand::StopScan]);
    }

    #[test]
    fn test_full_handshake_reaches_ready() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");

        let fx = assert_ok!(session.connect(&id("A")));
        assert_eq!(commands(&fx), vec![CentralCommand::Connect(id("A"))]);
        assert_eq!(session.state(), CentralState::Connecting);
        assert_eq!(
            session.registry().get(&id("A")).map(|d| d.connection),
            Some(ConnectionState::Connecting)
        );

        let fx = session.handle_event(&TransportEvent::Connected(id("A")));
        assert_eq!(
            commands(&fx),
            vec![CentralCommand::DiscoverServices {
                peripheral: id("A"),
                service: SAMPLER_SERVICE_UUID
            }]
        );
        assert_eq!(session.state(), CentralState::DiscoveringServices);
        assert_eq!(session.registry().connected_ids(), vec![id("A")]);

        let fx = session.handle_event(&TransportEvent::ServicesDiscovered {
            peripheral: id("A"),
            services: vec![Uuid::new_v4(), SAMPLER_SERVICE_UUID],
        });
        assert_eq!(
            commands(&fx),
            vec![CentralCommand::DiscoverCharacteristics {
                peripheral: id("A"),
                service: SAMPLER_SERVICE_UUID,
                characteristic: SAMPLER_CHARACTERISTIC_UUID
            }]
        );

        let fx = session.handle_event(&sampler_characteristic(CharacteristicProperties::NOTIFY));
        assert_eq!(
            commands(&fx),
            vec![
                CentralCommand::SetNotify {
                    peripheral: id("A"),
                    characteristic: SAMPLER_CHARACTERISTIC_UUID,
                    enabled: true
                },
                CentralCommand::ReadValue {
                    peripheral: id("A"),
                    characteristic: SAMPLER_CHARACTERISTIC_UUID
                }
            ]
        );
        assert_eq!(session.state(), CentralState::Subscribing);

        session.handle_event(&TransportEvent::NotifyStateChanged {
            peripheral: id("A"),
            characteristic: SAMPLER_CHARACTERISTIC_UUID,
            enabled: true,
        });
        assert_eq!(session.state(), CentralState::Ready);

        session.handle_event(&value("A", Some(&b"foo"[..])));
        assert_eq!(
            session.value(&id("A")),
            Some(&CharacteristicValue::Text("foo".to_string()))
        );
    }

    #[test]
    fn test_foreign_service_leaves_session_below_ready() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");
        assert_ok!(session.connect(&id("A")));
        session.handle_event(&TransportEvent::Connected(id("A")));

        let fx = session.handle_event(&TransportEvent::ServicesDiscovered {
            peripheral: id("A"),
            services: vec![Uuid::new_v4()],
        });

        assert!(commands(&fx).is_empty());
        assert_eq!(session.state(), CentralState::DiscoveringServices);
    }

    #[test]
    fn test_characteristic_without_notify_leaves_session_below_ready() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");
        assert_ok!(session.connect(&id("A")));
        session.handle_event(&TransportEvent::Connected(id("A")));
        session.handle_event(&TransportEvent::ServicesDiscovered {
            peripheral: id("A"),
            services: vec![SAMPLER_SERVICE_UUID],
        });

        let fx = session.handle_event(&sampler_characteristic(
            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
        ));
        assert!(commands(&fx).is_empty());

        session.handle_event(&TransportEvent::NotifyStateChanged {
            peripheral: id("A"),
            characteristic: SAMPLER_CHARACTERISTIC_UUID,
            enabled: true,
        });
        assert_eq!(session.state(), CentralState::DiscoveringCharacteristics);
    }

    #[test]
    fn test_ready_requires_notify_acknowledgement() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");
        assert_ok!(session.connect(&id("A")));
        session.handle_event(&TransportEvent::Connected(id("A")));
        session.handle_event(&TransportEvent::ServicesDiscovered {
            peripheral: id("A"),
            services: vec![SAMPLER_SERVICE_UUID],
        });
        session.handle_event(&sampler_characteristic(CharacteristicProperties::NOTIFY));

        // The immediate read lands before the acknowledgement.
        session.handle_event(&value("A", Some(&b"early"[..])));
        assert_eq!(session.state(), CentralState::Subscribing);
        assert_eq!(
            session.value(&id("A")).and_then(|v| v.as_text()),
            Some("early")
        );

        session.handle_event(&TransportEvent::NotifyStateChanged {
            peripheral: id("A"),
            characteristic: SAMPLER_CHARACTERISTIC_UUID,
            enabled: false,
        });
        assert_eq!(session.state(), CentralState::Subscribing);
    }

    #[test]
    fn test_timeout_disconnect_reconnects_once() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        let fx = session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: Some(ErrorCode::CONNECTION_TIMEOUT),
        });

        assert_eq!(commands(&fx), vec![CentralCommand::Connect(id("A"))]);
        assert!(faults(&fx).is_empty());
        assert_eq!(session.state(), CentralState::Connecting);
        assert_eq!(
            session.registry().get(&id("A")).map(|d| d.connection),
            Some(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_other_disconnect_returns_to_idle_with_notice() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        let fx = session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: Some(ErrorCode(7)),
        });

        assert!(commands(&fx).is_empty());
        assert_eq!(
            faults(&fx),
            vec![Fault::OtherDisconnect {
                peripheral: id("A"),
                code: ErrorCode(7)
            }]
        );
        assert_eq!(session.connection_state(&id("A")), CentralState::Idle);
        assert_eq!(session.state(), CentralState::Discovered);
        assert!(session.registry().connected_ids().is_empty());
    }

    #[test]
    fn test_capped_reconnect_gives_up() {
        let config = CentralConfig::default().with_reconnect(ReconnectPolicy::Capped(1));
        let mut session = ready_session(config, CharacteristicProperties::NOTIFY);
        let timeout = TransportEvent::Disconnected {
            peripheral: id("A"),
            code: Some(ErrorCode::CONNECTION_TIMEOUT),
        };

        let fx = session.handle_event(&timeout);
        assert_eq!(commands(&fx), vec![CentralCommand::Connect(id("A"))]);

        let fx = session.handle_event(&timeout);
        assert!(commands(&fx).is_empty());
        assert_eq!(
            faults(&fx),
            vec![Fault::ConnectionTimeout {
                peripheral: id("A")
            }]
        );
        assert_eq!(session.connection_state(&id("A")), CentralState::Idle);
    }

    #[test]
    fn test_deliberate_disconnect_does_not_reconnect() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        let fx = session.disconnect(&id("A"));
        assert_eq!(commands(&fx), vec![CentralCommand::Disconnect(id("A"))]);
        assert_eq!(session.connection_state(&id("A")), CentralState::Disconnecting);

        let fx = session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: Some(ErrorCode::CONNECTION_TIMEOUT),
        });
        assert!(commands(&fx).is_empty());
        assert_eq!(session.connection_state(&id("A")), CentralState::Idle);
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");
        assert_ok!(session.connect(&id("A")));

        let fx = session.handle_event(&TransportEvent::ConnectFailed {
            peripheral: id("A"),
            code: Some(ErrorCode::UNKNOWN),
        });

        assert!(fx.contains(&CentralEffect::Notice(Notice::StateChanged {
            peripheral: id("A"),
            state: CentralState::Failed,
        })));
        assert!(faults(&fx).is_empty());
        assert_eq!(session.connection_state(&id("A")), CentralState::Idle);
        assert_eq!(session.focused(), None);

        // Retry is allowed.
        let fx = assert_ok!(session.connect(&id("A")));
        assert_eq!(commands(&fx), vec![CentralCommand::Connect(id("A"))]);
    }

    #[test]
    fn test_connect_during_discovery_rejected() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");
        assert_ok!(session.connect(&id("A")));
        session.handle_event(&TransportEvent::Connected(id("A")));

        let err = assert_err!(session.connect(&id("A")));
        assert!(matches!(err, Error::DiscoveryInProgress { .. }));

        // A duplicate connected event is coalesced.
        let fx = session.handle_event(&TransportEvent::Connected(id("A")));
        assert!(commands(&fx).is_empty());
        assert_eq!(session.state(), CentralState::DiscoveringServices);
    }

    #[test]
    fn test_connect_unknown_peripheral_rejected() {
        let mut session = powered(CentralConfig::default());
        let err = assert_err!(session.connect(&id("ghost")));
        assert!(matches!(err, Error::PeripheralNotFound { .. }));
    }

    #[test]
    fn test_select_toggles_focused_connection() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        let fx = assert_ok!(session.select(&id("A")));
        assert_eq!(commands(&fx), vec![CentralCommand::Disconnect(id("A"))]);

        session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: None,
        });
        let fx = assert_ok!(session.select(&id("A")));
        assert_eq!(commands(&fx), vec![CentralCommand::Connect(id("A"))]);
    }

    #[test]
    fn test_select_while_disconnecting_reconnects_after_close() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        let fx = assert_ok!(session.select(&id("A")));
        assert_eq!(commands(&fx), vec![CentralCommand::Disconnect(id("A"))]);
        let fx = assert_ok!(session.select(&id("A")));
        assert!(commands(&fx).is_empty());
        assert_eq!(session.connection_state(&id("A")), CentralState::Disconnecting);

        let fx = session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: None,
        });
        assert_eq!(commands(&fx), vec![CentralCommand::Connect(id("A"))]);
        assert_eq!(session.state(), CentralState::Connecting);

        session.handle_event(&TransportEvent::Connected(id("A")));
        assert_eq!(session.state(), CentralState::DiscoveringServices);
        assert_eq!(session.registry().connected_ids(), vec![id("A")]);

        let fx = session.teardown();
        assert_eq!(commands(&fx), vec![CentralCommand::Disconnect(id("A"))]);
    }

    #[test]
    fn test_disconnect_cancels_queued_connect() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);
        session.disconnect(&id("A"));
        assert_ok!(session.connect(&id("A")));
        assert_eq!(session.focused(), Some(&id("A")));

        assert!(session.disconnect(&id("A")).is_empty());
        let fx = session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: None,
        });

        assert!(commands(&fx).is_empty());
        assert_eq!(session.connection_state(&id("A")), CentralState::Idle);
        assert_eq!(session.focused(), None);
    }

    #[test]
    fn test_rescan_keeps_live_connection_for_teardown() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        assert_ok!(session.start_scan());
        discover(&mut session, "A");
        assert_eq!(session.state(), CentralState::Ready);
        assert_eq!(
            session.registry().get(&id("A")).map(|d| d.connection),
            Some(ConnectionState::Connected)
        );

        let fx = session.teardown();
        assert_eq!(
            commands(&fx),
            vec![CentralCommand::StopScan, CentralCommand::Disconnect(id("A"))]
        );
    }

    #[test]
    fn test_teardown_disconnects_link_missing_from_registry() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);
        assert_ok!(session.start_scan());

        let fx = session.teardown();
        assert_eq!(
            commands(&fx),
            vec![CentralCommand::StopScan, CentralCommand::Disconnect(id("A"))]
        );
        assert!(session.connections().is_empty());
    }

    #[test]
    fn test_discovery_failure_closes_link() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");
        assert_ok!(session.connect(&id("A")));
        session.handle_event(&TransportEvent::Connected(id("A")));

        let fx = session.handle_event(&TransportEvent::DiscoveryFailed {
            peripheral: id("A"),
            code: ErrorCode::UNKNOWN,
        });
        assert_eq!(commands(&fx), vec![CentralCommand::Disconnect(id("A"))]);
        assert!(fx.contains(&CentralEffect::Notice(Notice::StateChanged {
            peripheral: id("A"),
            state: CentralState::Failed,
        })));
        assert_eq!(session.connection_state(&id("A")), CentralState::Disconnecting);

        let fx = session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: None,
        });
        assert!(commands(&fx).is_empty());
        assert_eq!(session.connection_state(&id("A")), CentralState::Idle);

        // Retry is allowed.
        let fx = assert_ok!(session.connect(&id("A")));
        assert_eq!(commands(&fx), vec![CentralCommand::Connect(id("A"))]);
    }

    #[test]
    fn test_discovery_failure_outside_discovery_ignored() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        let fx = session.handle_event(&TransportEvent::DiscoveryFailed {
            peripheral: id("A"),
            code: ErrorCode::UNKNOWN,
        });
        assert!(fx.is_empty());
        assert_eq!(session.state(), CentralState::Ready);
    }

    #[test]
    fn test_decode_failure_retains_stale_value() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);
        session.handle_event(&value("A", Some(&b"bar"[..])));

        let fx = session.handle_event(&value("A", Some(&[0xff_u8, 0xfe][..])));
        assert!(fx.is_empty());
        let fx = session.handle_event(&value("A", None));
        assert!(fx.is_empty());

        assert_eq!(
            session.value(&id("A")),
            Some(&CharacteristicValue::Text("bar".to_string()))
        );
    }

    #[test]
    fn test_decode_failure_mark_unknown() {
        let config =
            CentralConfig::default().with_decode_failure(DecodeFailurePolicy::MarkUnknown);
        let mut session = ready_session(config, CharacteristicProperties::NOTIFY);
        session.handle_event(&value("A", Some(&b"bar"[..])));
        session.handle_event(&value("A", None));

        assert_eq!(
            session.value(&id("A")),
            Some(&CharacteristicValue::Undecodable)
        );
    }

    #[test]
    fn test_write_requires_ready_and_write_capability() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);
        let err = assert_err!(session.write_value(&id("A"), "hi"));
        assert!(matches!(err, Error::NotSupported { .. }));
        let err = assert_err!(session.write_value(&id("B"), "hi"));
        assert!(matches!(err, Error::NotConnected { .. }));

        let mut session = ready_session(
            CentralConfig::default(),
            CharacteristicProperties::NOTIFY | CharacteristicProperties::WRITE,
        );
        let fx = assert_ok!(session.write_value(&id("A"), "hi"));
        assert_eq!(
            commands(&fx),
            vec![CentralCommand::WriteValue {
                peripheral: id("A"),
                characteristic: SAMPLER_CHARACTERISTIC_UUID,
                value: Bytes::from_static(b"hi")
            }]
        );
    }

    #[test]
    fn test_teardown_disconnects_connected_peripherals() {
        let mut session = powered(CentralConfig::default());
        assert_ok!(session.start_scan());
        for peripheral in ["A", "B", "C"] {
            discover(&mut session, peripheral);
        }
        for peripheral in ["A", "B"] {
            assert_ok!(session.connect(&id(peripheral)));
            session.handle_event(&TransportEvent::Connected(id(peripheral)));
        }

        let fx = session.teardown();

        let disconnects: Vec<_> = commands(&fx)
            .into_iter()
            .filter(|c| matches!(c, CentralCommand::Disconnect(_)))
            .collect();
        assert_eq!(
            disconnects,
            vec![
                CentralCommand::Disconnect(id("A")),
                CentralCommand::Disconnect(id("B"))
            ]
        );
        assert!(fx.contains(&CentralEffect::CancelScanTimeout));
        assert!(session.registry().is_empty());
        assert!(session.connections().is_empty());
    }

    #[test]
    fn test_radio_loss_drops_connections_and_suspends_commands() {
        let mut session = ready_session(CentralConfig::default(), CharacteristicProperties::NOTIFY);

        let fx = session.handle_event(&TransportEvent::RadioStateChanged(RadioState::PoweredOff));
        assert_eq!(
            faults(&fx),
            vec![Fault::RadioUnavailable {
                state: RadioState::PoweredOff
            }]
        );
        assert!(session.connections().is_empty());
        assert!(session.registry().connected_ids().is_empty());

        // A late timeout must not trigger a reconnect while powered off.
        let fx = session.handle_event(&TransportEvent::Disconnected {
            peripheral: id("A"),
            code: Some(ErrorCode::CONNECTION_TIMEOUT),
        });
        assert!(commands(&fx).is_empty());
        assert!(matches!(
            session.connect(&id("A")),
            Err(Error::RadioUnavailable { .. })
        ));
    }

    #[test]
    fn test_retrieve_known_replaces_registry() {
        let mut session = powered(CentralConfig::default());
        discover(&mut session, "A");
        discover(&mut session, "B");

        let fx = assert_ok!(session.retrieve_known());
        assert_eq!(
            commands(&fx),
            vec![CentralCommand::RetrievePeripherals(vec![id("A"), id("B")])]
        );

        session.handle_event(&TransportEvent::PeripheralsRetrieved(vec![
            PeripheralDescriptor::new("B", None),
        ]));
        assert_eq!(session.registry().ids(), vec![id("B")]);
    }
}
