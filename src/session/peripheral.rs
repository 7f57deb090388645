//! Peripheral-role session.
//!
//! Publishes the sampler service, advertises it, and pushes values to the
//! centrals that subscribe. The first subscriber stops advertising; losing
//! every subscriber does not restart it.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::ble::event::TransportEvent;
use crate::ble::transport::PeripheralCommand;
use crate::ble::types::{CentralToken, RadioState};
use crate::config::PeripheralConfig;
use crate::error::{Error, Fault, Result};
use crate::session::Notice;

/// Protocol state of the peripheral role, derived from the session flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PeripheralState {
    /// No service published.
    #[default]
    Inactive,
    /// Service published, not advertising, no subscribers.
    ServicePublished,
    /// Service published and advertised, no subscribers.
    Advertising,
    /// This many centrals are subscribed.
    Subscribed(usize),
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "Inactive"),
            Self::ServicePublished => write!(f, "ServicePublished"),
            Self::Advertising => write!(f, "Advertising"),
            Self::Subscribed(count) => write!(f, "Subscribed({})", count),
        }
    }
}

/// The fixed values a peripheral can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Emission {
    /// `"foo"`
    Foo,
    /// `"bar"`
    Bar,
    /// `"baz"`
    Baz,
}

impl Emission {
    /// Every emission, in display order.
    pub const ALL: [Emission; 3] = [Emission::Foo, Emission::Bar, Emission::Baz];

    /// The literal sent for this emission.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foo => "foo",
            Self::Bar => "bar",
            Self::Baz => "baz",
        }
    }

    /// UTF-8 payload.
    pub fn payload(&self) -> Bytes {
        Bytes::from_static(self.as_str().as_bytes())
    }
}

impl fmt::Display for Emission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the caller must do after a peripheral-session step.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEffect {
    /// Issue a transport command.
    Command(PeripheralCommand),
    /// Inform the presentation layer.
    Notice(Notice),
}

/// The peripheral-role state machine.
#[derive(Debug)]
pub struct PeripheralSession {
    config: PeripheralConfig,
    radio: RadioState,
    published: bool,
    advertising: bool,
    subscribers: BTreeSet<CentralToken>,
    last_broadcast: Option<Bytes>,
}

impl PeripheralSession {
    /// Create an inactive session.
    pub fn new(config: PeripheralConfig) -> Self {
        Self {
            config,
            radio: RadioState::Unknown,
            published: false,
            advertising: false,
            subscribers: BTreeSet::new(),
            last_broadcast: None,
        }
    }

    /// Get the session configuration.
    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    /// Get the last reported radio state.
    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    /// Current state.
    pub fn state(&self) -> PeripheralState {
        if !self.published {
            PeripheralState::Inactive
        } else if !self.subscribers.is_empty() {
            PeripheralState::Subscribed(self.subscribers.len())
        } else if self.advertising {
            PeripheralState::Advertising
        } else {
            PeripheralState::ServicePublished
        }
    }

    /// Check if the service is published.
    pub fn is_published(&self) -> bool {
        self.published
    }

    /// Check if advertising is active.
    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Number of subscribed centrals.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Subscribed centrals, in token order.
    pub fn subscribers(&self) -> impl Iterator<Item = &CentralToken> {
        self.subscribers.iter()
    }

    /// The last value pushed to subscribers.
    pub fn last_broadcast(&self) -> Option<&Bytes> {
        self.last_broadcast.as_ref()
    }

    /// Publish or withdraw the sampler service.
    ///
    /// Withdrawing leaves advertising untouched.
    pub fn set_service_enabled(&mut self, enabled: bool) -> Result<Vec<PeripheralEffect>> {
        self.ensure_powered()?;

        if enabled == self.published {
            return Ok(Vec::new());
        }

        self.published = enabled;
        let command = if enabled {
            info!("Publishing service {}", self.config.service_id());
            PeripheralCommand::PublishService {
                service: self.config.service_id(),
                characteristic: self.config.characteristic_id,
            }
        } else {
            info!("Removing published services");
            PeripheralCommand::UnpublishAll
        };

        Ok(vec![
            PeripheralEffect::Command(command),
            PeripheralEffect::Notice(Notice::ServicePublishedChanged { published: enabled }),
        ])
    }

    /// Advertise the service under the configured local name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotPublished`] before the service is published.
    pub fn start_advertising(&mut self) -> Result<Vec<PeripheralEffect>> {
        self.ensure_powered()?;

        if !self.published {
            return Err(Error::ServiceNotPublished);
        }
        if self.advertising {
            return Ok(Vec::new());
        }

        info!(
            "Advertising {} as {:?}",
            self.config.advertising.service_id, self.config.advertising.local_name
        );
        self.advertising = true;
        Ok(vec![
            PeripheralEffect::Command(PeripheralCommand::StartAdvertising(
                self.config.advertising.clone(),
            )),
            PeripheralEffect::Notice(Notice::AdvertisingChanged { active: true }),
        ])
    }

    /// Stop advertising. Does nothing if not advertising.
    pub fn stop_advertising(&mut self) -> Vec<PeripheralEffect> {
        let mut fx = Vec::new();
        self.halt_advertising(&mut fx);
        fx
    }

    /// Start advertising if stopped, stop it if running.
    pub fn toggle_advertising(&mut self) -> Result<Vec<PeripheralEffect>> {
        if self.advertising {
            Ok(self.stop_advertising())
        } else {
            self.start_advertising()
        }
    }

    /// Push one of the fixed values to every subscriber.
    pub fn emit(&mut self, emission: Emission) -> Result<Vec<PeripheralEffect>> {
        self.emit_value(emission.payload())
    }

    /// Push `value` to every subscriber. Without subscribers nothing is sent.
    pub fn emit_value(&mut self, value: impl Into<Bytes>) -> Result<Vec<PeripheralEffect>> {
        self.ensure_powered()?;

        if self.subscribers.is_empty() {
            debug!("No subscribers, dropping value");
            return Ok(Vec::new());
        }

        let value = value.into();
        debug!(
            "Sending {} bytes to {} subscriber(s)",
            value.len(),
            self.subscribers.len()
        );
        self.last_broadcast = Some(value.clone());
        Ok(vec![PeripheralEffect::Command(PeripheralCommand::UpdateValue {
            characteristic: self.config.characteristic_id,
            value,
            targets: None,
        })])
    }

    /// Tear the session down: stop advertising if active.
    pub fn teardown(&mut self) -> Vec<PeripheralEffect> {
        info!("Tearing down peripheral session");
        self.stop_advertising()
    }

    /// Feed one transport event into the machine.
    ///
    /// Central-role events are ignored. While the radio is not powered on,
    /// no transport command is produced.
    pub fn handle_event(&mut self, event: &TransportEvent) -> Vec<PeripheralEffect> {
        let mut fx = Vec::new();

        match event {
            TransportEvent::RadioStateChanged(state) => self.on_radio_state(*state, &mut fx),
            TransportEvent::ServiceAdded(None) => {
                info!("Service {} published", self.config.service_id());
            }
            TransportEvent::ServiceAdded(Some(code)) => {
                let fault = Fault::ServiceAddFailed { code: *code };
                warn!("{}", fault);
                if self.published {
                    self.published = false;
                    fx.push(PeripheralEffect::Notice(Notice::ServicePublishedChanged {
                        published: false,
                    }));
                }
                fx.push(PeripheralEffect::Notice(Notice::Fault(fault)));
            }
            TransportEvent::AdvertisingStarted => info!("Advertising started"),
            TransportEvent::AdvertisingFailed(code) => {
                let fault = Fault::AdvertisingFailed { code: *code };
                warn!("{}", fault);
                if self.advertising {
                    self.advertising = false;
                    fx.push(PeripheralEffect::Notice(Notice::AdvertisingChanged {
                        active: false,
                    }));
                }
                fx.push(PeripheralEffect::Notice(Notice::Fault(fault)));
            }
            TransportEvent::CentralSubscribed {
                central,
                characteristic,
            } => {
                if *characteristic != self.config.characteristic_id {
                    debug!("Ignoring subscription to {}", characteristic);
                } else {
                    if self.subscribers.insert(central.clone()) {
                        info!("Central {} subscribed", central);
                        fx.push(PeripheralEffect::Notice(Notice::SubscribersChanged {
                            count: self.subscribers.len(),
                        }));
                    }
                    self.halt_advertising(&mut fx);
                }
            }
            TransportEvent::CentralUnsubscribed {
                central,
                characteristic,
            } => {
                if *characteristic == self.config.characteristic_id
                    && self.subscribers.remove(central)
                {
                    info!("Central {} unsubscribed", central);
                    fx.push(PeripheralEffect::Notice(Notice::SubscribersChanged {
                        count: self.subscribers.len(),
                    }));
                }
            }
            _ => {}
        }

        if !self.radio.is_powered_on() {
            fx.retain(|effect| !matches!(effect, PeripheralEffect::Command(_)));
        }

        fx
    }

    fn on_radio_state(&mut self, state: RadioState, fx: &mut Vec<PeripheralEffect>) {
        if self.radio == state {
            return;
        }

        info!("Peripheral radio state: {} -> {}", self.radio, state);
        self.radio = state;
        fx.push(PeripheralEffect::Notice(Notice::RadioStateChanged(state)));

        if state.is_powered_on() {
            return;
        }

        if self.published {
            self.published = false;
            fx.push(PeripheralEffect::Notice(Notice::ServicePublishedChanged {
                published: false,
            }));
        }
        if self.advertising {
            self.advertising = false;
            fx.push(PeripheralEffect::Notice(Notice::AdvertisingChanged { active: false }));
        }
        if !self.subscribers.is_empty() {
            self.subscribers.clear();
            fx.push(PeripheralEffect::Notice(Notice::SubscribersChanged { count: 0 }));
        }

        if state.is_unavailable() {
            let fault = Fault::RadioUnavailable { state };
            warn!("{}", fault);
            fx.push(PeripheralEffect::Notice(Notice::Fault(fault)));
        }
    }

    fn halt_advertising(&mut self, fx: &mut Vec<PeripheralEffect>) {
        if !self.advertising {
            return;
        }

        info!("Stopping advertising");
        self.advertising = false;
        fx.push(PeripheralEffect::Command(PeripheralCommand::StopAdvertising));
        fx.push(PeripheralEffect::Notice(Notice::AdvertisingChanged { active: false }));
    }

    fn ensure_powered(&self) -> Result<()> {
        if self.radio.is_powered_on() {
            Ok(())
        } else {
            Err(Error::RadioUnavailable { state: self.radio })
        }
    }
}
