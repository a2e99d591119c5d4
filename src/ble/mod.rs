//! BLE communication module.
//!
//! This module provides the adapter seam, scanning and discovery
//! bookkeeping for weight scales.

pub mod adapter;
pub mod discovery;
pub mod scanner;
pub mod uuids;

pub use adapter::{
    AdapterHandle, BleAdapter, BtleplugAdapter, DisconnectStream, GattService,
    NotificationStream, ScanEvent, ScanEventStream,
};
pub use discovery::{DiscoverySet, NameFilter, PeripheralRef};
pub use scanner::Scanner;
pub use uuids::*;
