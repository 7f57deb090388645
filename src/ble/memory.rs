//! In-memory transport.
//!
//! [`MemoryTransport`] implements both transport traits without a radio. It
//! records every command it receives and, once wired to event channels,
//! answers commands the way a cooperative BLE stack would. A single
//! instance wired on both sides acts as the air between a central and a
//! peripheral session in the same process.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::event::TransportEvent;
use crate::ble::transport::{
    CentralCommand, CentralTransport, PeripheralCommand, PeripheralTransport,
};
use crate::ble::types::{
    CentralToken, CharacteristicProperties, DiscoveredCharacteristic, ErrorCode, PeripheralId,
};
use crate::config::AdvertisingConfig;
use crate::registry::PeripheralDescriptor;

/// Token under which the local central appears to the peripheral side.
pub const MEMORY_CENTRAL_TOKEN: &str = "memory-central";

/// A command received by a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// Central-role command.
    Central(CentralCommand),
    /// Peripheral-role command.
    Peripheral(PeripheralCommand),
}

#[derive(Debug, Default)]
struct Air {
    value: Option<Bytes>,
    subscribed: BTreeMap<PeripheralId, Uuid>,
}

/// Recording, optionally responsive transport double.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    calls: Mutex<Vec<Recorded>>,
    central_events: Option<mpsc::UnboundedSender<TransportEvent>>,
    peripheral_events: Option<mpsc::UnboundedSender<TransportEvent>>,
    peers: Vec<PeripheralDescriptor>,
    air: Mutex<Air>,
}

impl MemoryTransport {
    /// Create a transport that only records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer central commands on `events`.
    pub fn with_central_events(mut self, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        self.central_events = Some(events);
        self
    }

    /// Answer peripheral commands on `events`.
    pub fn with_peripheral_events(
        mut self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        self.peripheral_events = Some(events);
        self
    }

    /// Add a remote peripheral reported by scans.
    pub fn with_peer(mut self, descriptor: PeripheralDescriptor) -> Self {
        self.peers.push(descriptor);
        self
    }

    /// Every command received so far, in order.
    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().clone()
    }

    /// Central-role commands received so far, in order.
    pub fn central_calls(&self) -> Vec<CentralCommand> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Recorded::Central(command) => Some(command.clone()),
                Recorded::Peripheral(_) => None,
            })
            .collect()
    }

    /// Peripheral-role commands received so far, in order.
    pub fn peripheral_calls(&self) -> Vec<PeripheralCommand> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Recorded::Peripheral(command) => Some(command.clone()),
                Recorded::Central(_) => None,
            })
            .collect()
    }

    /// Count the recorded commands matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Forget every recorded command.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// The characteristic value currently on the air.
    pub fn current_value(&self) -> Option<Bytes> {
        self.air.lock().value.clone()
    }

    fn central(&self, command: CentralCommand) {
        trace!("Memory central command: {:?}", command);
        self.calls.lock().push(Recorded::Central(command.clone()));
        if self.central_events.is_some() {
            self.answer_central(command);
        }
    }

    fn peripheral(&self, command: PeripheralCommand) {
        trace!("Memory peripheral command: {:?}", command);
        self.calls.lock().push(Recorded::Peripheral(command.clone()));
        if self.peripheral_events.is_some() {
            self.answer_peripheral(command);
        }
    }

    fn send_central(&self, event: TransportEvent) {
        if let Some(events) = &self.central_events {
            let _ = events.send(event);
        }
    }

    fn send_peripheral(&self, event: TransportEvent) {
        if let Some(events) = &self.peripheral_events {
            let _ = events.send(event);
        }
    }

    fn is_peer(&self, id: &PeripheralId) -> bool {
        self.peers.iter().any(|peer| &peer.id == id)
    }

    fn answer_central(&self, command: CentralCommand) {
        match command {
            CentralCommand::StartScan { .. } => {
                for peer in &self.peers {
                    self.send_central(TransportEvent::DeviceDiscovered(peer.clone()));
                }
            }
            CentralCommand::StopScan => {}
            CentralCommand::Connect(peripheral) => {
                if self.is_peer(&peripheral) {
                    self.send_central(TransportEvent::Connected(peripheral));
                } else {
                    self.send_central(TransportEvent::ConnectFailed {
                        peripheral,
                        code: Some(ErrorCode::UNKNOWN),
                    });
                }
            }
            CentralCommand::Disconnect(peripheral) => {
                let subscription = self.air.lock().subscribed.remove(&peripheral);
                self.send_central(TransportEvent::Disconnected {
                    peripheral,
                    code: None,
                });
                if let Some(characteristic) = subscription {
                    self.send_peripheral(TransportEvent::CentralUnsubscribed {
                        central: CentralToken::from(MEMORY_CENTRAL_TOKEN),
                        characteristic,
                    });
                }
            }
            CentralCommand::DiscoverServices {
                peripheral,
                service,
            } => self.send_central(TransportEvent::ServicesDiscovered {
                peripheral,
                services: vec![service],
            }),
            CentralCommand::DiscoverCharacteristics {
                peripheral,
                service,
                characteristic,
            } => self.send_central(TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics: vec![DiscoveredCharacteristic::new(
                    characteristic,
                    CharacteristicProperties::READ
                        | CharacteristicProperties::WRITE
                        | CharacteristicProperties::NOTIFY,
                )],
            }),
            CentralCommand::SetNotify {
                peripheral,
                characteristic,
                enabled,
            } => {
                let changed = {
                    let mut air = self.air.lock();
                    if enabled {
                        air.subscribed
                            .insert(peripheral.clone(), characteristic)
                            .is_none()
                    } else {
                        air.subscribed.remove(&peripheral).is_some()
                    }
                };
                self.send_central(TransportEvent::NotifyStateChanged {
                    peripheral,
                    characteristic,
                    enabled,
                });
                if changed {
                    let central = CentralToken::from(MEMORY_CENTRAL_TOKEN);
                    self.send_peripheral(if enabled {
                        TransportEvent::CentralSubscribed {
                            central,
                            characteristic,
                        }
                    } else {
                        TransportEvent::CentralUnsubscribed {
                            central,
                            characteristic,
                        }
                    });
                }
            }
            CentralCommand::ReadValue {
                peripheral,
                characteristic,
            } => {
                let value = self.air.lock().value.clone();
                self.send_central(TransportEvent::ValueUpdated {
                    peripheral,
                    characteristic,
                    value,
                });
            }
            CentralCommand::WriteValue { value, .. } => {
                self.air.lock().value = Some(value);
            }
            CentralCommand::RetrievePeripherals(ids) => {
                let known = self
                    .peers
                    .iter()
                    .filter(|peer| ids.contains(&peer.id))
                    .cloned()
                    .collect();
                self.send_central(TransportEvent::PeripheralsRetrieved(known));
            }
        }
    }

    fn answer_peripheral(&self, command: PeripheralCommand) {
        match command {
            PeripheralCommand::PublishService { .. } => {
                self.send_peripheral(TransportEvent::ServiceAdded(None));
            }
            PeripheralCommand::StartAdvertising(_) => {
                self.send_peripheral(TransportEvent::AdvertisingStarted);
            }
            PeripheralCommand::UnpublishAll | PeripheralCommand::StopAdvertising => {}
            PeripheralCommand::UpdateValue {
                characteristic,
                value,
                ..
            } => {
                let subscribed: Vec<PeripheralId> = {
                    let mut air = self.air.lock();
                    air.value = Some(value.clone());
                    air.subscribed
                        .iter()
                        .filter(|(_, subscribed)| **subscribed == characteristic)
                        .map(|(peripheral, _)| peripheral.clone())
                        .collect()
                };
                for peripheral in subscribed {
                    self.send_central(TransportEvent::ValueUpdated {
                        peripheral,
                        characteristic,
                        value: Some(value.clone()),
                    });
                }
            }
        }
    }
}

impl CentralTransport for MemoryTransport {
    fn start_scan(&self, service: Uuid) {
        self.central(CentralCommand::StartScan { service });
    }

    fn stop_scan(&self) {
        self.central(CentralCommand::StopScan);
    }

    fn connect(&self, peripheral: &PeripheralId) {
        self.central(CentralCommand::Connect(peripheral.clone()));
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        self.central(CentralCommand::Disconnect(peripheral.clone()));
    }

    fn discover_services(&self, peripheral: &PeripheralId, service: Uuid) {
        self.central(CentralCommand::DiscoverServices {
            peripheral: peripheral.clone(),
            service,
        });
    }

    fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid, characteristic: Uuid) {
        self.central(CentralCommand::DiscoverCharacteristics {
            peripheral: peripheral.clone(),
            service,
            characteristic,
        });
    }

    fn set_notify(&self, peripheral: &PeripheralId, characteristic: Uuid, enabled: bool) {
        self.central(CentralCommand::SetNotify {
            peripheral: peripheral.clone(),
            characteristic,
            enabled,
        });
    }

    fn read_value(&self, peripheral: &PeripheralId, characteristic: Uuid) {
        self.central(CentralCommand::ReadValue {
            peripheral: peripheral.clone(),
            characteristic,
        });
    }

    fn write_value(&self, peripheral: &PeripheralId, characteristic: Uuid, value: Bytes) {
        self.central(CentralCommand::WriteValue {
            peripheral: peripheral.clone(),
            characteristic,
            value,
        });
    }

    fn retrieve_peripherals(&self, peripherals: Vec<PeripheralId>) {
        self.central(CentralCommand::RetrievePeripherals(peripherals));
    }
}

impl PeripheralTransport for MemoryTransport {
    fn publish_service(&self, service: Uuid, characteristic: Uuid) {
        self.peripheral(PeripheralCommand::PublishService {
            service,
            characteristic,
        });
    }

    fn unpublish_all(&self) {
        self.peripheral(PeripheralCommand::UnpublishAll);
    }

    fn start_advertising(&self, config: &AdvertisingConfig) {
        self.peripheral(PeripheralCommand::StartAdvertising(config.clone()));
    }

    fn stop_advertising(&self) {
        self.peripheral(PeripheralCommand::StopAdvertising);
    }

    fn update_value(&self, characteristic: Uuid, value: Bytes, targets: Option<Vec<CentralToken>>) {
        self.peripheral(PeripheralCommand::UpdateValue {
            characteristic,
            value,
            targets,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{SAMPLER_CHARACTERISTIC_UUID, SAMPLER_SERVICE_UUID};
    use pretty_assertions::assert_eq;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_records_in_order() {
        let transport = MemoryTransport::new();
        transport.start_scan(SAMPLER_SERVICE_UUID);
        transport.stop_advertising();
        transport.stop_scan();

        assert_eq!(
            transport.calls(),
            vec![
                Recorded::Central(CentralCommand::StartScan {
                    service: SAMPLER_SERVICE_UUID
                }),
                Recorded::Peripheral(PeripheralCommand::StopAdvertising),
                Recorded::Central(CentralCommand::StopScan),
            ]
        );
        assert_eq!(
            transport.count(|c| matches!(c, Recorded::Central(_))),
            2
        );
        assert_eq!(transport.peripheral_calls(), vec![PeripheralCommand::StopAdvertising]);
    }

    #[test]
    fn test_scan_reports_peers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport::new()
            .with_central_events(tx)
            .with_peer(PeripheralDescriptor::new("A", None))
            .with_peer(PeripheralDescriptor::new("B", None));

        transport.start_scan(SAMPLER_SERVICE_UUID);
        transport.connect(&PeripheralId::from("Z"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[2],
            TransportEvent::ConnectFailed { peripheral, .. } if peripheral.as_str() == "Z"
        ));
    }

    #[test]
    fn test_loopback_forwards_updates_to_subscribers() {
        let (central_tx, mut central_rx) = mpsc::unbounded_channel();
        let (peripheral_tx, mut peripheral_rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport::new()
            .with_central_events(central_tx)
            .with_peripheral_events(peripheral_tx)
            .with_peer(PeripheralDescriptor::new("A", None));
        let a = PeripheralId::from("A");

        transport.set_notify(&a, SAMPLER_CHARACTERISTIC_UUID, true);
        assert_eq!(
            drain(&mut peripheral_rx),
            vec![TransportEvent::CentralSubscribed {
                central: CentralToken::from(MEMORY_CENTRAL_TOKEN),
                characteristic: SAMPLER_CHARACTERISTIC_UUID,
            }]
        );
        drain(&mut central_rx);

        transport.update_value(SAMPLER_CHARACTERISTIC_UUID, Bytes::from_static(b"foo"), None);

        assert_eq!(
            drain(&mut central_rx),
            vec![TransportEvent::ValueUpdated {
                peripheral: a,
                characteristic: SAMPLER_CHARACTERISTIC_UUID,
                value: Some(Bytes::from_static(b"foo")),
            }]
        );
        assert_eq!(transport.current_value(), Some(Bytes::from_static(b"foo")));
    }

    #[test]
    fn test_read_before_any_value_has_no_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport::new().with_central_events(tx);

        transport.read_value(&PeripheralId::from("A"), SAMPLER_CHARACTERISTIC_UUID);

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [TransportEvent::ValueUpdated { value: None, .. }]
        ));
    }
}
