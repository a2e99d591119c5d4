//! Error types for the scale-link-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// One or more required runtime permissions were not granted.
    #[error("Bluetooth permissions not granted")]
    PermissionDenied,

    /// The adapter reported a fault while scanning.
    #[error("Scan failed: {reason}")]
    ScanFailed {
        /// Description of the fault.
        reason: String,
    },

    /// The specified peripheral was not found.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Failed to establish a connection or to discover services.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// A fault on the notification channel.
    #[error("Notification error: {reason}")]
    Notification {
        /// Description of the fault.
        reason: String,
    },

    /// The operation is not valid in the current session state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the session was in.
        state: String,
    },

    /// Another connect or disconnect is already running on this session.
    #[error("Another session operation is in progress")]
    OperationInProgress,

    /// The adapter is already busy with a conflicting scan or connection.
    #[error("Adapter busy: {reason}")]
    AdapterBusy {
        /// What the adapter is currently doing.
        reason: String,
    },

    /// A connection attempt was abandoned because the session was torn down.
    #[error("Connection to {identifier} cancelled")]
    Cancelled {
        /// The peripheral that was being connected.
        identifier: String,
    },

    /// Invalid data was received from the scale.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },
}

/// Coarse failure classes reported at the UI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required permission was not granted.
    PermissionDenied,
    /// The adapter failed while scanning.
    Scan,
    /// Connecting or service discovery failed.
    Connect,
    /// The notification channel failed.
    Notification,
    /// A payload could not be decoded.
    Decode,
    /// Misuse of the session or adapter (wrong state, overlapping calls).
    Usage,
    /// Anything else reported by the platform stack.
    Platform,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::ScanFailed { .. } => ErrorKind::Scan,
            Self::PeripheralNotFound { .. }
            | Self::ConnectionFailed { .. }
            | Self::ServiceNotFound { .. }
            | Self::CharacteristicNotFound { .. }
            | Self::Cancelled { .. } => ErrorKind::Connect,
            Self::Notification { .. } => ErrorKind::Notification,
            Self::InvalidData { .. } => ErrorKind::Decode,
            Self::InvalidState { .. }
            | Self::OperationInProgress
            | Self::AdapterBusy { .. } => ErrorKind::Usage,
            Self::Bluetooth(_) | Self::BluetoothUnavailable => ErrorKind::Platform,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
