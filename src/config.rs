//! Session configuration.
//!
//! Typed replacements for the option dictionaries a native BLE stack takes.
//! Every struct has a `Default` matching the sampler's well-known values.

use std::time::Duration;

use uuid::Uuid;

use crate::ble::uuids::{SAMPLER_CHARACTERISTIC_UUID, SAMPLER_SERVICE_UUID};

/// Default time a scan runs before it is stopped automatically.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(1);

/// Local name advertised when none is configured.
pub const DEFAULT_LOCAL_NAME: &str = "BLESampler";

/// What a central session does when a link times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReconnectPolicy {
    /// Reconnect on every timeout, without limit.
    #[default]
    Unbounded,
    /// Reconnect at most this many times in a row. The count resets once
    /// the session reaches `Ready` again.
    Capped(u32),
}

impl ReconnectPolicy {
    /// Check if another attempt is allowed after `attempts` consecutive ones.
    pub fn allows(&self, attempts: u32) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Capped(max) => attempts < *max,
        }
    }
}

/// What a central session stores when a value cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodeFailurePolicy {
    /// Keep the last good value.
    #[default]
    RetainStale,
    /// Replace the value with an explicit undecodable marker.
    MarkUnknown,
}

/// Configuration of a central session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralConfig {
    /// Service scanned for and discovered.
    pub service_id: Uuid,
    /// Characteristic subscribed to.
    pub characteristic_id: Uuid,
    /// How long a scan runs before it stops by itself.
    pub scan_timeout: Duration,
    /// Reaction to link timeouts.
    pub reconnect: ReconnectPolicy,
    /// Reaction to undecodable values.
    pub decode_failure: DecodeFailurePolicy,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            service_id: SAMPLER_SERVICE_UUID,
            characteristic_id: SAMPLER_CHARACTERISTIC_UUID,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            decode_failure: DecodeFailurePolicy::default(),
        }
    }
}

impl CentralConfig {
    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the decode failure policy.
    pub fn with_decode_failure(mut self, decode_failure: DecodeFailurePolicy) -> Self {
        self.decode_failure = decode_failure;
        self
    }
}

/// Advertising payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisingConfig {
    /// Service UUID included in the advertisement.
    pub service_id: Uuid,
    /// Device name included in the advertisement.
    pub local_name: String,
}

impl AdvertisingConfig {
    /// Advertise the sampler service under `local_name`.
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            service_id: SAMPLER_SERVICE_UUID,
            local_name: local_name.into(),
        }
    }
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_NAME)
    }
}

/// Configuration of a peripheral session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralConfig {
    /// Advertising payload; its service is also the published one.
    pub advertising: AdvertisingConfig,
    /// The characteristic published inside the service.
    pub characteristic_id: Uuid,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            advertising: AdvertisingConfig::default(),
            characteristic_id: SAMPLER_CHARACTERISTIC_UUID,
        }
    }
}

impl PeripheralConfig {
    /// Set the advertised local name.
    pub fn with_local_name(mut self, local_name: impl Into<String>) -> Self {
        self.advertising.local_name = local_name.into();
        self
    }

    /// The published service.
    pub fn service_id(&self) -> Uuid {
        self.advertising.service_id
    }
}
