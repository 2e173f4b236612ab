//! The support-frame GATT tree exposed by the simulator.

use std::fmt;

use uuid::Uuid;

use crate::gatt::{GattError, GattRegistry, GattService, Properties};

pub const SUPPORT_FRAME_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_9abc_123456789abc);

/// Latest grip reading, in the textual wire format.
pub const GRIP_DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_9abc_123456789abd);

pub const DEVICE_INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_9abc_123456789abe);

/// Accepts [`crate::control::ControlCommand`] text.
pub const CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_9abc_123456789abf);

pub const DEFAULT_DEVICE_NAME: &str = "SupportFrame";

#[must_use]
pub fn support_frame_service() -> GattService {
    GattService::new(SUPPORT_FRAME_SERVICE_UUID, "Support Frame")
        .with_characteristic(
            GRIP_DATA_CHARACTERISTIC_UUID,
            "Grip Data",
            Properties::READ | Properties::NOTIFY,
        )
        .with_characteristic(
            DEVICE_INFO_CHARACTERISTIC_UUID,
            "Device Info",
            Properties::READ,
        )
        .with_characteristic(CONTROL_CHARACTERISTIC_UUID, "Control", Properties::WRITE)
}

pub fn support_frame_registry() -> Result<GattRegistry, GattError> {
    let mut registry = GattRegistry::default();
    registry.register(support_frame_service())?;
    Ok(registry)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub manufacturer: String,
    pub version: String,
}

impl Default for DeviceInfo {
    fn default() -> DeviceInfo {
        DeviceInfo {
            model: "Support Frame SF-001".to_string(),
            manufacturer: "BLE Simulator Inc".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Model:{};Manufacturer:{};Version:{}",
            self.model, self.manufacturer, self.version
        )
    }
}
