//! BLE Service and Characteristic UUIDs.
//!
//! Protocol constants for the weight scale. These identify the scale's
//! firmware and are not configurable.

use uuid::Uuid;

/// Weight scale service UUID.
pub const WEIGHT_SCALE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xbc340e9b_ea14_1fb5_d64d_726000210324);
/// Weight measurement characteristic UUID (Notify).
pub const WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbc340e9b_ea14_1fb5_d64d_726001210324);

/// Tag under which the weight notification subscription is registered and cancelled.
pub const WEIGHT_SUBSCRIPTION_TAG: &str = "weight234";

/// Substring an advertised name must contain to be offered as a scale.
pub const DEFAULT_NAME_MARKER: &str = "Scale";

/// Check if a service UUID is the weight scale service.
pub fn is_weight_scale_service(uuid: &Uuid) -> bool {
    *uuid == WEIGHT_SCALE_SERVICE_UUID
}
