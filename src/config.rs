//! Client configuration.

use crate::ble::uuids::DEFAULT_NAME_MARKER;
use crate::permissions::Platform;

/// Settings for a [`ScaleClient`](crate::ScaleClient).
///
/// Protocol identifiers (service, characteristic, subscription tag) are
/// fixed by the scale firmware and live in [`crate::ble::uuids`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScaleConfig {
    /// Substring an advertised name must contain to be listed.
    pub name_marker: String,
    /// Keep previously discovered scales when a new scan starts.
    pub retain_discoveries: bool,
    /// Capacity of the discovery and state broadcast channels.
    pub event_capacity: usize,
    /// Capacity of the reading broadcast channel.
    pub reading_capacity: usize,
    /// Platform used to decide which permissions to request.
    pub platform: Platform,
}

impl ScaleConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised-name marker.
    pub fn with_name_marker(mut self, marker: impl Into<String>) -> Self {
        self.name_marker = marker.into();
        self
    }

    /// Keep discoveries across scans.
    pub fn with_retained_discoveries(mut self, retain: bool) -> Self {
        self.retain_discoveries = retain;
        self
    }

    /// Set the platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Set broadcast channel capacities.
    pub fn with_capacities(mut self, events: usize, readings: usize) -> Self {
        self.event_capacity = events.max(1);
        self.reading_capacity = readings.max(1);
        self
    }
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            name_marker: DEFAULT_NAME_MARKER.to_string(),
            retain_discoveries: false,
            event_capacity: 32,
            reading_capacity: 64,
            platform: Platform::detect(),
        }
    }
}
