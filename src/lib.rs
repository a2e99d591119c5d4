//! # scale-link-ble
//!
//! A cross-platform Rust library for reading a Bluetooth Low Energy weight
//! scale.
//!
//! The library manages exactly one scale at a time: it asks for the runtime
//! permissions the platform needs, scans for peripherals whose advertised
//! name contains `"Scale"`, connects to the one the user picks, and streams
//! the weight characteristic as [`Reading`]s, emitting only when the value
//! changes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scale_link_ble::{Result, ScaleClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = ScaleClient::new().await?;
//!
//!     if client.open_picker().await {
//!         tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     }
//!
//!     if let Some(scale) = client.devices().into_iter().next() {
//!         if client.select_peripheral(scale.identifier()).await {
//!             let mut readings = client.subscribe_readings();
//!             client.set_monitoring(true).await;
//!             while let Ok(reading) = readings.recv().await {
//!                 println!("Weight: {} kg", reading);
//!             }
//!         }
//!     }
//!
//!     client.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Android
//! Runtime permissions are requested through a [`PermissionRequester`]
//! supplied by the host app (API level 31+ needs scan, connect and fine
//! location; older levels need fine location only).
//!
//! ### macOS / iOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod permissions;
pub mod reading;
pub mod session;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use ble::adapter::{AdapterHandle, BleAdapter, BtleplugAdapter};
pub use ble::discovery::{DiscoverySet, NameFilter, PeripheralRef};
pub use callback::CallbackHandle;
pub use client::ScaleClient;
pub use config::ScaleConfig;
pub use error::{Error, ErrorKind, Result};
pub use permissions::{Permission, PermissionGate, PermissionRequester, PermissionStatus, Platform};
pub use reading::{decode, try_decode, Reading, NO_READING};
pub use session::{Session, SessionState};
