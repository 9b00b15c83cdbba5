//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for Helena beacon communication.

use uuid::Uuid;

// Helena Service (Helena Custom, firmware 2.x)
/// Helena observation service UUID.
pub const HELENA_SERVICE_UUID: Uuid = Uuid::from_u128(0x4865_0001_6c65_6e61_8000_00805f9b34fb);
/// Data-available pipe characteristic UUID (Notify).
///
/// Each notification carries one listed-device observation.
pub const DATA_AVAILABLE_UUID: Uuid = Uuid::from_u128(0x4865_0002_6c65_6e61_8000_00805f9b34fb);
/// Observation-set pipe characteristic UUID (Read).
pub const OBSERVATION_SET_UUID: Uuid = Uuid::from_u128(0x4865_0003_6c65_6e61_8000_00805f9b34fb);

// Standard descriptors
/// Client Characteristic Configuration descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Value written to the Client Characteristic Configuration descriptor to
/// enable notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
