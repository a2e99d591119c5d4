//! Discovered peripherals.
//!
//! [`DiscoverySet`] keeps the scales seen during a scan, unique by
//! identifier and in first-seen order, which is the order the picker lists
//! them in.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::ble::uuids::DEFAULT_NAME_MARKER;

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralRef {
    identifier: String,
    name: String,
    discovered_at: DateTime<Utc>,
}

impl PeripheralRef {
    /// Create a reference stamped with the current time.
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_timestamp(identifier, name, Utc::now())
    }

    /// Create a reference with an explicit discovery time.
    pub fn with_timestamp(
        identifier: impl Into<String>,
        name: impl Into<String>,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            discovered_at,
        }
    }

    /// Platform-assigned identifier (address on Linux/Android, UUID on Apple).
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Advertised local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the peripheral was first seen.
    pub fn discovered_at(&self) -> DateTime<Utc> {
        self.discovered_at
    }
}

/// Advertised-name filter applied to scan results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    marker: String,
}

impl NameFilter {
    /// Accept names containing `marker`.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// The marker substring.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Check an advertised name. Peripherals without a name never match.
    pub fn matches(&self, name: Option<&str>) -> bool {
        name.map(|n| n.contains(&self.marker)).unwrap_or(false)
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_MARKER)
    }
}

/// Ordered, deduplicated set of discovered peripherals.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySet {
    entries: Vec<PeripheralRef>,
    identifiers: HashSet<String>,
}

impl DiscoverySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a peripheral unless its identifier is already present.
    ///
    /// Returns `true` if it was added.
    pub fn insert(&mut self, peripheral: PeripheralRef) -> bool {
        if !self.identifiers.insert(peripheral.identifier.clone()) {
            return false;
        }
        self.entries.push(peripheral);
        true
    }

    /// Check if an identifier is present.
    pub fn contains(&self, identifier: &str) -> bool {
        self.identifiers.contains(identifier)
    }

    /// Look up a peripheral by identifier.
    pub fn get(&self, identifier: &str) -> Option<&PeripheralRef> {
        self.entries.iter().find(|p| p.identifier == identifier)
    }

    /// Entries in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &PeripheralRef> {
        self.entries.iter()
    }

    /// Copy of the entries in first-seen order.
    pub fn to_vec(&self) -> Vec<PeripheralRef> {
        self.entries.clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.identifiers.clear();
    }
}
