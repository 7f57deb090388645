//! Central transport over the host Bluetooth stack.
//!
//! [`HostCentral`] forwards every [`CentralCommand`] to a worker task that
//! talks to the first `btleplug` adapter. Scan commands run in order on the
//! worker; per-peripheral commands each get their own task so a slow
//! connect does not hold up the rest. Results and adapter callbacks come
//! back through the [`TransportEvent`] receiver returned by
//! [`HostCentral::new`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::event::TransportEvent;
use crate::ble::transport::{CentralCommand, CentralTransport};
use crate::ble::types::{
    CharacteristicProperties, ConnectionState, DiscoveredCharacteristic, ErrorCode,
    PeripheralId, RadioState,
};
use crate::config::CentralConfig;
use crate::error::{Error, Result};
use crate::registry::PeripheralDescriptor;

/// State shared by the worker, the adapter pump and per-command tasks.
#[derive(Clone)]
struct HostContext {
    adapter: Adapter,
    service: Uuid,
    peripherals: Arc<RwLock<HashMap<PeripheralId, Peripheral>>>,
    listening: Arc<RwLock<HashSet<PeripheralId>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl HostContext {
    fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.peripherals.read().get(id).cloned()
    }
}

/// [`CentralTransport`] backed by the host adapter.
pub struct HostCentral {
    commands: mpsc::UnboundedSender<CentralCommand>,
    tasks: Vec<JoinHandle<()>>,
}

impl HostCentral {
    /// Acquire the first Bluetooth adapter and start listening to it.
    ///
    /// Must be called inside a tokio runtime. The returned receiver yields the
    /// adapter's current `RadioStateChanged` first, followed by adapter events
    /// and command results.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(
        config: &CentralConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let adapter_events = adapter.events().await.map_err(Error::Bluetooth)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let ctx = HostContext {
            adapter,
            service: config.service_id,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            listening: Arc::new(RwLock::new(HashSet::new())),
            events: event_tx,
        };

        let initial = match ctx.adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                RadioState::Unknown
            }
        };
        ctx.send(TransportEvent::RadioStateChanged(initial));

        let pump = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut adapter_events = adapter_events;
                while let Some(event) = adapter_events.next().await {
                    handle_adapter_event(&ctx, event).await;
                }
                debug!("Adapter event stream ended");
            })
        };
        let worker = tokio::spawn(run_commands(ctx, command_rx));

        Ok((
            Self {
                commands: command_tx,
                tasks: vec![pump, worker],
            },
            event_rx,
        ))
    }

    fn submit(&self, command: CentralCommand) {
        if let Err(e) = self.commands.send(command) {
            warn!("Host transport stopped, dropping {:?}", e.0);
        }
    }
}

impl Drop for HostCentral {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl CentralTransport for HostCentral {
    fn start_scan(&self, service: Uuid) {
        self.submit(CentralCommand::StartScan { service });
    }

    fn stop_scan(&self) {
        self.submit(CentralCommand::StopScan);
    }

    fn connect(&self, peripheral: &PeripheralId) {
        self.submit(CentralCommand::Connect(peripheral.clone()));
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        self.submit(CentralCommand::Disconnect(peripheral.clone()));
    }

    fn discover_services(&self, peripheral: &PeripheralId, service: Uuid) {
        self.submit(CentralCommand::DiscoverServices {
            peripheral: peripheral.clone(),
            service,
        });
    }

    fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) {
        self.submit(CentralCommand::DiscoverCharacteristics {
            peripheral: peripheral.clone(),
            service,
            characteristic,
        });
    }

    fn set_notify(&self, peripheral: &PeripheralId, characteristic: Uuid, enabled: bool) {
        self.submit(CentralCommand::SetNotify {
            peripheral: peripheral.clone(),
            characteristic,
            enabled,
        });
    }

    fn read_value(&self, peripheral: &PeripheralId, characteristic: Uuid) {
        self.submit(CentralCommand::ReadValue {
            peripheral: peripheral.clone(),
            characteristic,
        });
    }

    fn write_value(&self, peripheral: &PeripheralId, characteristic: Uuid, value: Bytes) {
        self.submit(CentralCommand::WriteValue {
            peripheral: peripheral.clone(),
            characteristic,
            value,
        });
    }

    fn retrieve_peripherals(&self, peripherals: Vec<PeripheralId>) {
        self.submit(CentralCommand::RetrievePeripherals(peripherals));
    }
}

async fn run_commands(ctx: HostContext, mut commands: mpsc::UnboundedReceiver<CentralCommand>) {
    while let Some(command) = commands.recv().await {
        trace!("Host command: {:?}", command);
        match command {
            CentralCommand::StartScan { service } => {
                info!("Starting BLE scan for {}", service);
                let filter = ScanFilter {
                    services: vec![service],
                };
                if let Err(e) = ctx.adapter.start_scan(filter).await {
                    error!("Failed to start scan: {}", e);
                }
            }
            CentralCommand::StopScan => {
                info!("Stopping BLE scan");
                if let Err(e) = ctx.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            CentralCommand::RetrievePeripherals(ids) => retrieve_peripherals(&ctx, ids).await,
            command => {
                let ctx = ctx.clone();
                tokio::spawn(async move { execute(&ctx, command).await });
            }
        }
    }

    debug!("Host command loop ended");
}

async fn execute(ctx: &HostContext, command: CentralCommand) {
    match command {
        CentralCommand::Connect(id) => {
            let peripheral = match ctx.peripheral(&id) {
                Some(p) => p,
                None => {
                    ctx.send(TransportEvent::ConnectFailed {
                        peripheral: id,
                        code: None,
                    });
                    return;
                }
            };
            match peripheral.connect().await {
                Ok(()) => {
                    info!("Successfully connected to {}", id);
                    ctx.send(TransportEvent::Connected(id));
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", id, e);
                    ctx.send(TransportEvent::ConnectFailed {
                        code: Some(error_code(&e)),
                        peripheral: id,
                    });
                }
            }
        }
        CentralCommand::Disconnect(id) => {
            let Some(peripheral) = ctx.peripheral(&id) else {
                return;
            };
            if let Err(e) = peripheral.disconnect().await {
                error!("Failed to disconnect from {}: {}", id, e);
            }
            ctx.listening.write().remove(&id);
            ctx.send(TransportEvent::Disconnected {
                peripheral: id,
                code: None,
            });
        }
        CentralCommand::DiscoverServices { peripheral: id, .. } => {
            let Some(peripheral) = ctx.peripheral(&id) else {
                return;
            };
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral.services().iter().map(|s| s.uuid).collect();
                    ctx.send(TransportEvent::ServicesDiscovered {
                        peripheral: id,
                        services,
                    });
                }
                Err(e) => {
                    warn!("Failed to discover services on {}: {}", id, e);
                    ctx.send(TransportEvent::DiscoveryFailed {
                        code: error_code(&e),
                        peripheral: id,
                    });
                }
            }
        }
        CentralCommand::DiscoverCharacteristics {
            peripheral: id,
            service,
            ..
        } => {
            let Some(peripheral) = ctx.peripheral(&id) else {
                return;
            };
            // btleplug discovers characteristics together with services.
            match peripheral.services().into_iter().find(|s| s.uuid == service) {
                Some(found) => {
                    let characteristics = found
                        .characteristics
                        .iter()
                        .map(|c| DiscoveredCharacteristic::new(c.uuid, char_properties(c.properties)))
                        .collect();
                    ctx.send(TransportEvent::CharacteristicsDiscovered {
                        peripheral: id,
                        service,
                        characteristics,
                    });
                }
                None => ctx.send(TransportEvent::DiscoveryFailed {
                    peripheral: id,
                    code: ErrorCode::UNKNOWN,
                }),
            }
        }
        CentralCommand::SetNotify {
            peripheral: id,
            characteristic,
            enabled,
        } => {
            let Some((peripheral, found)) = lookup(ctx, &id, characteristic) else {
                return;
            };
            let result = if enabled {
                start_listener(ctx, &id, &peripheral);
                peripheral.subscribe(&found).await
            } else {
                peripheral.unsubscribe(&found).await
            };
            match result {
                Ok(()) => {
                    debug!("Notifications for {} on {}: {}", characteristic, id, enabled);
                    ctx.send(TransportEvent::NotifyStateChanged {
                        peripheral: id,
                        characteristic,
                        enabled,
                    });
                }
                Err(e) => {
                    warn!("Failed to set notify on {} for {}: {}", characteristic, id, e);
                    ctx.send(TransportEvent::DiscoveryFailed {
                        peripheral: id,
                        code: error_code(&e),
                    });
                }
            }
        }
        CentralCommand::ReadValue {
            peripheral: id,
            characteristic,
        } => {
            let Some((peripheral, found)) = lookup(ctx, &id, characteristic) else {
                return;
            };
            match peripheral.read(&found).await {
                Ok(data) => {
                    trace!("Read {} bytes from {}", data.len(), characteristic);
                    ctx.send(TransportEvent::ValueUpdated {
                        peripheral: id,
                        characteristic,
                        value: Some(Bytes::from(data)),
                    });
                }
                Err(e) => warn!("Failed to read {} on {}: {}", characteristic, id, e),
            }
        }
        CentralCommand::WriteValue {
            peripheral: id,
            characteristic,
            value,
        } => {
            let Some((peripheral, found)) = lookup(ctx, &id, characteristic) else {
                return;
            };
            match peripheral.write(&found, &value, WriteType::WithResponse).await {
                Ok(()) => trace!("Wrote {} bytes to {}", value.len(), characteristic),
                Err(e) => warn!("Failed to write {} on {}: {}", characteristic, id, e),
            }
        }
        CentralCommand::StartScan { .. }
        | CentralCommand::StopScan
        | CentralCommand::RetrievePeripherals(_) => {}
    }
}

fn lookup(
    ctx: &HostContext,
    id: &PeripheralId,
    characteristic: Uuid,
) -> Option<(Peripheral, Characteristic)> {
    let peripheral = ctx.peripheral(id)?;
    let found = peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic);
    if found.is_none() {
        debug!("Characteristic {} not found on {}", characteristic, id);
    }
    Some((peripheral, found?))
}

/// Forward notifications of `peripheral` until its stream ends.
fn start_listener(ctx: &HostContext, id: &PeripheralId, peripheral: &Peripheral) {
    if !ctx.listening.write().insert(id.clone()) {
        return;
    }

    let ctx = ctx.clone();
    let id = id.clone();
    let peripheral = peripheral.clone();
    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to get notifications stream for {}: {}", id, e);
                ctx.listening.write().remove(&id);
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            trace!(
                "Notification from {}: {} bytes",
                notification.uuid,
                notification.value.len()
            );
            ctx.send(TransportEvent::ValueUpdated {
                peripheral: id.clone(),
                characteristic: notification.uuid,
                value: Some(Bytes::from(notification.value)),
            });
        }

        debug!("Notification listener for {} stopped", id);
        ctx.listening.write().remove(&id);
    });
}

async fn retrieve_peripherals(ctx: &HostContext, ids: Vec<PeripheralId>) {
    let mut descriptors = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(peripheral) = ctx.peripheral(&id) else {
            continue;
        };
        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };
        let connection = if peripheral.is_connected().await.unwrap_or(false) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        descriptors.push(PeripheralDescriptor::new(id, name).with_connection(connection));
    }
    ctx.send(TransportEvent::PeripheralsRetrieved(descriptors));
}

async fn handle_adapter_event(ctx: &HostContext, event: CentralEvent) {
    match event {
        CentralEvent::DeviceDiscovered(id) => {
            trace!("Device discovered: {:?}", id);
            process_peripheral(ctx, id).await;
        }
        CentralEvent::ServicesAdvertisement { id, services } => {
            if services.contains(&ctx.service) {
                process_peripheral(ctx, id).await;
            }
        }
        CentralEvent::DeviceDisconnected(id) => {
            let id = PeripheralId::from(id.to_string());
            debug!("Device disconnected: {}", id);
            ctx.listening.write().remove(&id);
            ctx.send(TransportEvent::Disconnected {
                peripheral: id,
                code: None,
            });
        }
        CentralEvent::StateUpdate(state) => {
            ctx.send(TransportEvent::RadioStateChanged(radio_state(state)));
        }
        _ => {}
    }
}

async fn process_peripheral(ctx: &HostContext, id: btleplug::platform::PeripheralId) {
    let peripheral = match ctx.adapter.peripheral(&id).await {
        Ok(p) => p,
        Err(e) => {
            trace!("Failed to get peripheral: {}", e);
            return;
        }
    };

    let properties = match peripheral.properties().await {
        Ok(Some(p)) => p,
        _ => return,
    };

    if !properties.services.contains(&ctx.service) {
        return;
    }

    let identifier = PeripheralId::from(id.to_string());
    let mut descriptor = PeripheralDescriptor::new(identifier.clone(), properties.local_name);
    if let Some(rssi) = properties.rssi {
        descriptor = descriptor.with_rssi(rssi);
    }

    ctx.peripherals.write().insert(identifier, peripheral);
    ctx.send(TransportEvent::DeviceDiscovered(descriptor));
}

fn error_code(error: &btleplug::Error) -> ErrorCode {
    match error {
        btleplug::Error::TimedOut(_) => ErrorCode::CONNECTION_TIMEOUT,
        _ => ErrorCode::UNKNOWN,
    }
}

fn char_properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties::from_bits_truncate(flags.bits())
}

fn radio_state(state: btleplug::api::CentralState) -> RadioState {
    match state {
        btleplug::api::CentralState::PoweredOn => RadioState::PoweredOn,
        btleplug::api::CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            error_code(&btleplug::Error::TimedOut(Duration::from_secs(5))),
            ErrorCode::CONNECTION_TIMEOUT
        );
        assert_eq!(error_code(&btleplug::Error::NotConnected), ErrorCode::UNKNOWN);
    }

    #[test]
    fn test_char_properties_mapping() {
        let mapped = char_properties(CharPropFlags::NOTIFY | CharPropFlags::READ);
        assert!(mapped.contains(CharacteristicProperties::NOTIFY));
        assert!(mapped.contains(CharacteristicProperties::READ));
        assert!(!mapped.contains(CharacteristicProperties::WRITE));

        let mapped = char_properties(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert_eq!(mapped, CharacteristicProperties::WRITE_WITHOUT_RESPONSE);
        assert!(!mapped.contains(CharacteristicProperties::WRITE));
        assert_eq!(char_properties(CharPropFlags::empty()), CharacteristicProperties::empty());
    }

    #[test]
    fn test_radio_state_mapping() {
        assert_eq!(
            radio_state(btleplug::api::CentralState::PoweredOn),
            RadioState::PoweredOn
        );
        assert_eq!(
            radio_state(btleplug::api::CentralState::PoweredOff),
            RadioState::PoweredOff
        );
        assert_eq!(
            radio_state(btleplug::api::CentralState::Unknown),
            RadioState::Unknown
        );
    }
}
