//! Weight readings and the notification payload decoder.
//!
//! The scale pushes its display value as UTF-8 text on the weight
//! measurement characteristic. Readings are kept as text so the UI shows
//! exactly what the scale shows; [`Reading::kilograms`] gives a numeric view.

use std::fmt;
use tracing::trace;

use crate::error::{Error, Result};

/// Value shown before any reading arrives and after a disconnect.
pub const NO_READING: &str = "0";

/// A decoded weight reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading(String);

impl Reading {
    /// Create a reading from its text form.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The "no data" sentinel reading.
    pub fn none() -> Self {
        Self(NO_READING.to_string())
    }

    /// Check if this is the "no data" sentinel.
    pub fn is_none(&self) -> bool {
        self.0 == NO_READING
    }

    /// The reading exactly as sent by the scale.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the leading numeric part of the reading.
    ///
    /// Scales commonly append a unit (`"52.3kg"`), so trailing non-numeric
    /// characters are ignored.
    ///
    /// # Example
    ///
    /// ```
    /// use scale_link_ble::Reading;
    ///
    /// assert_eq!(Reading::new("52.3kg").kilograms(), Some(52.3));
    /// assert_eq!(Reading::new("--").kilograms(), None);
    /// ```
    pub fn kilograms(&self) -> Option<f64> {
        let text = self.0.trim();
        let end = text
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && *c == '-')))
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        text[..end].parse().ok()
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode a raw notification payload, reporting why it was rejected.
///
/// # Errors
///
/// `InvalidData` for empty buffers, invalid UTF-8, or payloads holding only
/// whitespace and NUL padding.
pub fn try_decode(payload: &[u8]) -> Result<Reading> {
    let text = std::str::from_utf8(payload).map_err(|e| Error::InvalidData {
        context: format!("weight payload is not UTF-8: {}", e),
    })?;
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Err(Error::InvalidData {
            context: format!("weight payload carries no value ({} bytes)", payload.len()),
        });
    }
    Ok(Reading::new(text))
}

/// Decode a raw notification payload.
///
/// Returns `None` for payloads that carry no usable value.
pub fn decode(payload: &[u8]) -> Option<Reading> {
    try_decode(payload).ok()
}

/// Tracks the last emitted reading and suppresses unchanged values.
#[derive(Debug, Clone, Default)]
pub struct ReadingTracker {
    current: Reading,
}

impl ReadingTracker {
    /// Create a tracker holding the sentinel reading.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last emitted reading.
    pub fn current(&self) -> &Reading {
        &self.current
    }

    /// Feed a payload; returns the new reading only if it changed.
    pub fn update(&mut self, payload: &[u8]) -> Option<Reading> {
        let reading = match try_decode(payload) {
            Ok(reading) => reading,
            Err(e) => {
                trace!("Dropping notification: {}", e);
                return None;
            }
        };
        if reading == self.current {
            return None;
        }
        self.current = reading.clone();
        Some(reading)
    }

    /// Return to the sentinel reading.
    pub fn reset(&mut self) {
        self.current = Reading::none();
    }
}
