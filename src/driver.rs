//! Async drivers for the session machines.
//!
//! A driver owns one session and a transport handle and runs as a tokio
//! task. Requests from [`CentralHandle`] / [`PeripheralHandle`], transport
//! events and scan timer expiries are fed into the session one at a time;
//! the resulting commands go to the transport and notices go out on a
//! broadcast channel.
//!
//! ```rust,no_run
//! use ble_sampler::ble::host::HostCentral;
//! use ble_sampler::{CentralConfig, CentralDriver};
//! use std::sync::Arc;
//!
//! # async fn run() -> ble_sampler::Result<()> {
//! let config = CentralConfig::default();
//! let (transport, events) = HostCentral::new(&config).await?;
//! let central = CentralDriver::new(config, Arc::new(transport)).spawn(events);
//!
//! central.start_scan().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ble::event::TransportEvent;
use crate::ble::transport::{CentralTransport, PeripheralTransport};
use crate::ble::types::{PeripheralId, RadioState};
use crate::config::{CentralConfig, PeripheralConfig};
use crate::error::{Error, Result};
use crate::registry::PeripheralDescriptor;
use crate::session::{
    CentralEffect, CentralSession, CentralState, ConnectionSnapshot, Emission, Notice,
    PeripheralEffect, PeripheralSession, PeripheralState,
};

/// Capacity of the notice broadcast channel.
const NOTICE_CAPACITY: usize = 100;

async fn call<Req, R>(
    requests: &mpsc::UnboundedSender<Req>,
    make: impl FnOnce(oneshot::Sender<R>) -> Req,
) -> Result<R> {
    let (tx, rx) = oneshot::channel();
    requests.send(make(tx)).map_err(|_| Error::ChannelClosed)?;
    rx.await.map_err(|_| Error::ChannelClosed)
}

// ============================================================================
// Central
// ============================================================================

/// Point-in-time view of a central session.
#[derive(Debug, Clone, PartialEq)]
pub struct CentralSnapshot {
    /// Overall session state.
    pub state: CentralState,
    /// Last reported radio state.
    pub radio: RadioState,
    /// Whether a scan is running.
    pub scanning: bool,
    /// Discovered peripherals in first-seen order.
    pub devices: Vec<PeripheralDescriptor>,
    /// Live connections.
    pub connections: Vec<ConnectionSnapshot>,
}

enum CentralRequest {
    StartScan(oneshot::Sender<Result<()>>),
    StopScan(oneshot::Sender<()>),
    Connect(PeripheralId, oneshot::Sender<Result<()>>),
    Disconnect(PeripheralId, oneshot::Sender<()>),
    Select(PeripheralId, oneshot::Sender<Result<()>>),
    Write(PeripheralId, Bytes, oneshot::Sender<Result<()>>),
    RetrieveKnown(oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<CentralSnapshot>),
    Teardown(oneshot::Sender<()>),
}

/// Owns a [`CentralSession`] and applies its effects to a transport.
pub struct CentralDriver<T: CentralTransport + ?Sized> {
    session: CentralSession,
    transport: Arc<T>,
    notices: broadcast::Sender<Notice>,
    timer: Option<JoinHandle<()>>,
    timeouts_tx: mpsc::UnboundedSender<u64>,
    timeouts_rx: mpsc::UnboundedReceiver<u64>,
}

impl<T: CentralTransport + ?Sized + 'static> CentralDriver<T> {
    /// Create a driver for a fresh session.
    pub fn new(config: CentralConfig, transport: Arc<T>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();

        Self {
            session: CentralSession::new(config),
            transport,
            notices,
            timer: None,
            timeouts_tx,
            timeouts_rx,
        }
    }

    /// Run the driver on the current tokio runtime.
    ///
    /// The task ends after [`CentralHandle::teardown`] or once every handle
    /// is dropped, tearing the session down either way.
    pub fn spawn(self, events: mpsc::UnboundedReceiver<TransportEvent>) -> CentralHandle {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let handle = CentralHandle {
            requests,
            notices: self.notices.clone(),
        };
        tokio::spawn(self.run(events, requests_rx));
        handle
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut requests: mpsc::UnboundedReceiver<CentralRequest>,
    ) {
        debug!("Central driver started");

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => {
                    let fx = self.session.handle_event(&event);
                    self.apply(fx);
                }
                Some(generation) = self.timeouts_rx.recv() => {
                    let fx = self.session.on_scan_timeout(generation);
                    self.apply(fx);
                }
                request = requests.recv() => match request {
                    Some(CentralRequest::Teardown(reply)) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        self.teardown();
                        break;
                    }
                },
            }
        }

        debug!("Central driver stopped");
    }

    fn handle_request(&mut self, request: CentralRequest) {
        match request {
            CentralRequest::StartScan(reply) => {
                let result = self.session.start_scan().map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            CentralRequest::StopScan(reply) => {
                let fx = self.session.stop_scan();
                self.apply(fx);
                let _ = reply.send(());
            }
            CentralRequest::Connect(peripheral, reply) => {
                let result = self.session.connect(&peripheral).map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            CentralRequest::Disconnect(peripheral, reply) => {
                let fx = self.session.disconnect(&peripheral);
                self.apply(fx);
                let _ = reply.send(());
            }
            CentralRequest::Select(peripheral, reply) => {
                let result = self.session.select(&peripheral).map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            CentralRequest::Write(peripheral, value, reply) => {
                let result = self
                    .session
                    .write_value(&peripheral, value)
                    .map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            CentralRequest::RetrieveKnown(reply) => {
                let result = self.session.retrieve_known().map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            CentralRequest::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            CentralRequest::Teardown(reply) => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn snapshot(&self) -> CentralSnapshot {
        CentralSnapshot {
            state: self.session.state(),
            radio: self.session.radio_state(),
            scanning: self.session.is_scanning(),
            devices: self.session.registry().list_ordered().to_vec(),
            connections: self.session.connections(),
        }
    }

    fn teardown(&mut self) {
        info!("Central driver tearing down");
        let fx = self.session.teardown();
        self.apply(fx);
        self.cancel_timer();
    }

    fn apply(&mut self, fx: Vec<CentralEffect>) {
        for effect in fx {
            match effect {
                CentralEffect::Command(command) => command.apply(&*self.transport),
                CentralEffect::ScheduleScanTimeout { generation, after } => {
                    self.cancel_timer();
                    let timeouts = self.timeouts_tx.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = timeouts.send(generation);
                    }));
                }
                CentralEffect::CancelScanTimeout => self.cancel_timer(),
                CentralEffect::Notice(notice) => {
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Cloneable handle to a running [`CentralDriver`].
#[derive(Clone)]
pub struct CentralHandle {
    requests: mpsc::UnboundedSender<CentralRequest>,
    notices: broadcast::Sender<Notice>,
}

impl CentralHandle {
    /// See [`CentralSession::start_scan`].
    pub async fn start_scan(&self) -> Result<()> {
        call(&self.requests, CentralRequest::StartScan).await?
    }

    /// See [`CentralSession::stop_scan`].
    pub async fn stop_scan(&self) -> Result<()> {
        call(&self.requests, CentralRequest::StopScan).await
    }

    /// See [`CentralSession::connect`].
    pub async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let peripheral = peripheral.clone();
        call(&self.requests, |reply| CentralRequest::Connect(peripheral, reply)).await?
    }

    /// See [`CentralSession::disconnect`].
    pub async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        let peripheral = peripheral.clone();
        call(&self.requests, |reply| CentralRequest::Disconnect(peripheral, reply)).await
    }

    /// See [`CentralSession::select`].
    pub async fn select(&self, peripheral: &PeripheralId) -> Result<()> {
        let peripheral = peripheral.clone();
        call(&self.requests, |reply| CentralRequest::Select(peripheral, reply)).await?
    }

    /// See [`CentralSession::write_value`].
    pub async fn write_value(&self, peripheral: &PeripheralId, value: impl Into<Bytes>) -> Result<()> {
        let peripheral = peripheral.clone();
        let value = value.into();
        call(&self.requests, |reply| CentralRequest::Write(peripheral, value, reply)).await?
    }

    /// See [`CentralSession::retrieve_known`].
    pub async fn retrieve_known(&self) -> Result<()> {
        call(&self.requests, CentralRequest::RetrieveKnown).await?
    }

    /// Current session state.
    pub async fn snapshot(&self) -> Result<CentralSnapshot> {
        call(&self.requests, CentralRequest::Snapshot).await
    }

    /// Tear the session down and stop the driver.
    pub async fn teardown(&self) -> Result<()> {
        call(&self.requests, CentralRequest::Teardown).await
    }

    /// Receive notices from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

// ============================================================================
// Peripheral
// ============================================================================

/// Point-in-time view of a peripheral session.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralSnapshot {
    /// Derived session state.
    pub state: PeripheralState,
    /// Last reported radio state.
    pub radio: RadioState,
    /// Whether the service is published.
    pub published: bool,
    /// Whether advertising is active.
    pub advertising: bool,
    /// Number of subscribed centrals.
    pub subscribers: usize,
    /// Last value pushed to subscribers.
    pub last_broadcast: Option<Bytes>,
}

enum PeripheralRequest {
    SetServiceEnabled(bool, oneshot::Sender<Result<()>>),
    StartAdvertising(oneshot::Sender<Result<()>>),
    StopAdvertising(oneshot::Sender<()>),
    ToggleAdvertising(oneshot::Sender<Result<()>>),
    Emit(Emission, oneshot::Sender<Result<()>>),
    EmitValue(Bytes, oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<PeripheralSnapshot>),
    Teardown(oneshot::Sender<()>),
}

/// Owns a [`PeripheralSession`] and applies its effects to a transport.
pub struct PeripheralDriver<T: PeripheralTransport + ?Sized> {
    session: PeripheralSession,
    transport: Arc<T>,
    notices: broadcast::Sender<Notice>,
}

impl<T: PeripheralTransport + ?Sized + 'static> PeripheralDriver<T> {
    /// Create a driver for a fresh session.
    pub fn new(config: PeripheralConfig, transport: Arc<T>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            session: PeripheralSession::new(config),
            transport,
            notices,
        }
    }

    /// Run the driver on the current tokio runtime.
    pub fn spawn(self, events: mpsc::UnboundedReceiver<TransportEvent>) -> PeripheralHandle {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let handle = PeripheralHandle {
            requests,
            notices: self.notices.clone(),
        };
        tokio::spawn(self.run(events, requests_rx));
        handle
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut requests: mpsc::UnboundedReceiver<PeripheralRequest>,
    ) {
        debug!("Peripheral driver started");

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => {
                    let fx = self.session.handle_event(&event);
                    self.apply(fx);
                }
                request = requests.recv() => match request {
                    Some(PeripheralRequest::Teardown(reply)) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        self.teardown();
                        break;
                    }
                },
            }
        }

        debug!("Peripheral driver stopped");
    }

    fn handle_request(&mut self, request: PeripheralRequest) {
        match request {
            PeripheralRequest::SetServiceEnabled(enabled, reply) => {
                let result = self
                    .session
                    .set_service_enabled(enabled)
                    .map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            PeripheralRequest::StartAdvertising(reply) => {
                let result = self.session.start_advertising().map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            PeripheralRequest::StopAdvertising(reply) => {
                let fx = self.session.stop_advertising();
                self.apply(fx);
                let _ = reply.send(());
            }
            PeripheralRequest::ToggleAdvertising(reply) => {
                let result = self.session.toggle_advertising().map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            PeripheralRequest::Emit(emission, reply) => {
                let result = self.session.emit(emission).map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            PeripheralRequest::EmitValue(value, reply) => {
                let result = self.session.emit_value(value).map(|fx| self.apply(fx));
                let _ = reply.send(result);
            }
            PeripheralRequest::Snapshot(reply) => {
                let _ = reply.send(PeripheralSnapshot {
                    state: self.session.state(),
                    radio: self.session.radio_state(),
                    published: self.session.is_published(),
                    advertising: self.session.is_advertising(),
                    subscribers: self.session.subscriber_count(),
                    last_broadcast: self.session.last_broadcast().cloned(),
                });
            }
            PeripheralRequest::Teardown(reply) => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn teardown(&mut self) {
        info!("Peripheral driver tearing down");
        let fx = self.session.teardown();
        self.apply(fx);
    }

    fn apply(&mut self, fx: Vec<PeripheralEffect>) {
        for effect in fx {
            match effect {
                PeripheralEffect::Command(command) => command.apply(&*self.transport),
                PeripheralEffect::Notice(notice) => {
                    let _ = self.notices.send(notice);
                }
            }
        }
    }
}

/// Cloneable handle to a running [`PeripheralDriver`].
#[derive(Clone)]
pub struct PeripheralHandle {
    requests: mpsc::UnboundedSender<PeripheralRequest>,
    notices: broadcast::Sender<Notice>,
}

impl PeripheralHandle {
    /// See [`PeripheralSession::set_service_enabled`].
    pub async fn set_service_enabled(&self, enabled: bool) -> Result<()> {
        call(&self.requests, |reply| {
            PeripheralRequest::SetServiceEnabled(enabled, reply)
        })
        .await?
    }

    /// See [`PeripheralSession::start_advertising`].
    pub async fn start_advertising(&self) -> Result<()> {
        call(&self.requests, PeripheralRequest::StartAdvertising).await?
    }

    /// See [`PeripheralSession::stop_advertising`].
    pub async fn stop_advertising(&self) -> Result<()> {
        call(&self.requests, PeripheralRequest::StopAdvertising).await
    }

    /// See [`PeripheralSession::toggle_advertising`].
    pub async fn toggle_advertising(&self) -> Result<()> {
        call(&self.requests, PeripheralRequest::ToggleAdvertising).await?
    }

    /// See [`PeripheralSession::emit`].
    pub async fn emit(&self, emission: Emission) -> Result<()> {
        call(&self.requests, |reply| PeripheralRequest::Emit(emission, reply)).await?
    }

    /// See [`PeripheralSession::emit_value`].
    pub async fn emit_value(&self, value: impl Into<Bytes>) -> Result<()> {
        let value = value.into();
        call(&self.requests, |reply| PeripheralRequest::EmitValue(value, reply)).await?
    }

    /// Current session state.
    pub async fn snapshot(&self) -> Result<PeripheralSnapshot> {
        call(&self.requests, PeripheralRequest::Snapshot).await
    }

    /// Tear the session down and stop the driver.
    pub async fn teardown(&self) -> Result<()> {
        call(&self.requests, PeripheralRequest::Teardown).await
    }

    /// Receive notices from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::memory::MemoryTransport;
    use crate::ble::transport::CentralCommand;
    use crate::session::CharacteristicValue;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn powered_events() -> (
        mpsc::UnboundedSender<TransportEvent>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::RadioStateChanged(RadioState::PoweredOn))
            .unwrap();
        (tx, rx)
    }

    fn stop_scans(transport: &MemoryTransport) -> usize {
        transport
            .central_calls()
            .iter()
            .filter(|c| matches!(c, CentralCommand::StopScan))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_issues_single_stop() {
        let transport = Arc::new(MemoryTransport::new());
        let (_events_tx, events_rx) = powered_events();
        let central = CentralDriver::new(CentralConfig::default(), transport.clone()).spawn(events_rx);

        central.start_scan().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let snapshot = central.snapshot().await.unwrap();

        assert!(!snapshot.scanning);
        assert_eq!(stop_scans(&transport), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        central.snapshot().await.unwrap();
        assert_eq!(stop_scans(&transport), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_cancels_timeout() {
        let transport = Arc::new(MemoryTransport::new());
        let (_events_tx, events_rx) = powered_events();
        let central = CentralDriver::new(CentralConfig::default(), transport.clone()).spawn(events_rx);

        central.start_scan().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        central.stop_scan().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        central.snapshot().await.unwrap();

        assert_eq!(stop_scans(&transport), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_scan_timeout() {
        let transport = Arc::new(MemoryTransport::new());
        let (_events_tx, events_rx) = powered_events();
        let central = CentralDriver::new(CentralConfig::default(), transport.clone()).spawn(events_rx);

        central.start_scan().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        central.teardown().await.unwrap();
        assert_eq!(stop_scans(&transport), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(stop_scans(&transport), 1);
        assert!(matches!(
            central.snapshot().await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_disconnects_connected_peripherals() {
        let (events_tx, events_rx) = powered_events();
        let transport = Arc::new(
            MemoryTransport::new()
                .with_central_events(events_tx)
                .with_peer(PeripheralDescriptor::new("A", None))
                .with_peer(PeripheralDescriptor::new("B", None))
                .with_peer(PeripheralDescriptor::new("C", None)),
        );
        let central = CentralDriver::new(CentralConfig::default(), transport.clone()).spawn(events_rx);

        central.start_scan().await.unwrap();
        central.connect(&PeripheralId::from("A")).await.unwrap();
        central.connect(&PeripheralId::from("B")).await.unwrap();
        let snapshot = central.snapshot().await.unwrap();
        assert_eq!(snapshot.devices.len(), 3);
        assert_eq!(snapshot.connections.len(), 2);
        assert!(snapshot
            .connections
            .iter()
            .all(|c| c.state == CentralState::Ready));

        central.teardown().await.unwrap();

        let disconnects = transport
            .central_calls()
            .into_iter()
            .filter(|c| matches!(c, CentralCommand::Disconnect(_)))
            .count();
        assert_eq!(disconnects, 2);
        assert!(matches!(
            central.snapshot().await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_loopback_delivers_emitted_values() {
        let (central_tx, central_rx) = powered_events();
        let (peripheral_tx, peripheral_rx) = powered_events();
        let transport = Arc::new(
            MemoryTransport::new()
                .with_central_events(central_tx)
                .with_peripheral_events(peripheral_tx)
                .with_peer(PeripheralDescriptor::new("A", Some("loopback".to_string()))),
        );
        let peripheral =
            PeripheralDriver::new(PeripheralConfig::default(), transport.clone()).spawn(peripheral_rx);
        let central = CentralDriver::new(CentralConfig::default(), transport.clone()).spawn(central_rx);
        let mut notices = central.subscribe();

        peripheral.set_service_enabled(true).await.unwrap();
        peripheral.start_advertising().await.unwrap();

        central.start_scan().await.unwrap();
        central.connect(&PeripheralId::from("A")).await.unwrap();
        assert_eq!(central.snapshot().await.unwrap().state, CentralState::Ready);

        let snapshot = peripheral.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PeripheralState::Subscribed(1));
        assert!(!snapshot.advertising);

        peripheral.emit(Emission::Foo).await.unwrap();
        let snapshot = central.snapshot().await.unwrap();
        assert_eq!(
            snapshot.connections[0].value,
            Some(CharacteristicValue::Text("foo".to_string()))
        );

        let mut saw_value = false;
        while let Ok(notice) = notices.try_recv() {
            if let Notice::ValueChanged { value, .. } = notice {
                saw_value = value.as_text() == Some("foo");
            }
        }
        assert!(saw_value);
    }

    #[tokio::test]
    async fn test_requests_refused_without_radio() {
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MemoryTransport::new());
        let peripheral = PeripheralDriver::new(PeripheralConfig::default(), transport.clone()).spawn(events_rx);

        assert!(matches!(
            peripheral.set_service_enabled(true).await,
            Err(Error::RadioUnavailable { .. })
        ));
        assert!(transport.calls().is_empty());
    }
}
