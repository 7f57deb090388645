//! BLE Service and Characteristic UUIDs.
//!
//! The sampler exposes exactly one service carrying one characteristic.
//! Both sides of the demo agree on these values.

use uuid::Uuid;

/// Sampler service UUID, advertised by the peripheral and used as the scan filter.
pub const SAMPLER_SERVICE_UUID: Uuid = Uuid::from_u128(0xa8c7922d_8849_4fbc_8692_4dbb291f99c8);

/// Sampler characteristic UUID (Notify, Readable; Write when the remote supports it).
pub const SAMPLER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xd2e2c5e2_b0b9_4af6_9ad9_361a819fb30f);
