//! Adapter handle over the platform BLE stack.
//!
//! [`BleAdapter`] is the seam to the radio: scan, connect, discover and
//! notify primitives. [`BtleplugAdapter`] implements it with btleplug.
//! [`AdapterHandle`] owns one adapter for the life of the application and
//! enforces that only one scan and one connection are active at a time.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Event produced while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A peripheral was seen (first time or again).
    Discovered {
        /// Platform-assigned identifier.
        identifier: String,
        /// Advertised local name, if any.
        name: Option<String>,
    },
    /// The adapter reported a fault; scanning continues.
    Failed {
        /// Description of the fault.
        reason: String,
    },
}

/// A GATT service found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// UUIDs of the characteristics in this service.
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    /// Check if this service exposes a characteristic.
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }
}

/// Stream of scan events.
pub type ScanEventStream = BoxStream<'static, ScanEvent>;

/// Stream of notification payloads for one characteristic.
///
/// `Err` items are channel faults. Some platforms end the stream when the
/// link drops, others leave it open.
pub type NotificationStream = BoxStream<'static, Result<Bytes>>;

/// Identifiers of peripherals whose link went down.
pub type DisconnectStream = BoxStream<'static, String>;

/// Primitives supplied by the platform BLE stack.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Begin a continuous scan.
    async fn start_scan(&self) -> Result<()>;

    /// Halt the scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Events for peripherals seen while scanning.
    async fn scan_events(&self) -> Result<ScanEventStream>;

    /// Connect to a peripheral.
    async fn connect(&self, identifier: &str) -> Result<()>;

    /// Enumerate all services and characteristics of a connected peripheral.
    async fn discover_services(&self, identifier: &str) -> Result<Vec<GattService>>;

    /// Enable notifications on a characteristic and stream its values.
    async fn notifications(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, identifier: &str, service: Uuid, characteristic: Uuid)
        -> Result<()>;

    /// Release the connection to a peripheral.
    async fn disconnect(&self, identifier: &str) -> Result<()>;

    /// Link-down events reported by the platform, for any peripheral.
    async fn disconnections(&self) -> Result<DisconnectStream>;
}

/// [`BleAdapter`] backed by btleplug.
#[derive(Clone)]
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on this system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self { adapter })
    }

    async fn peripheral(&self, identifier: &str) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .find(|p| p.id().to_string() == identifier)
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: identifier.to_string(),
            })
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        if !peripheral.services().iter().any(|s| s.uuid == service) {
            return Err(Error::ServiceNotFound {
                uuid: service.to_string(),
            });
        }

        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })
    }

    async fn describe(adapter: &Adapter, id: PeripheralId) -> ScanEvent {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                return ScanEvent::Failed {
                    reason: e.to_string(),
                }
            }
        };

        match peripheral.properties().await {
            Ok(properties) => ScanEvent::Discovered {
                identifier: id.to_string(),
                name: properties.and_then(|p| p.local_name),
            },
            Err(e) => ScanEvent::Failed {
                reason: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start_scan(&self) -> Result<()> {
        // Name filtering happens on our side; no service filter.
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::ScanFailed {
                reason: e.to_string(),
            })
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn scan_events(&self) -> Result<ScanEventStream> {
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        let adapter = self.adapter.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        trace!("Device seen: {:?}", id);
                        Some(Self::describe(&adapter, id).await)
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn connect(&self, identifier: &str) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            })
    }

    async fn discover_services(&self, identifier: &str) -> Result<Vec<GattService>> {
        let peripheral = self.peripheral(identifier).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::ConnectionFailed {
                reason: format!("service discovery failed: {}", e),
            })?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn notifications(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let peripheral = self.peripheral(identifier).await?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;

        // Open the stream first so the first value after subscribing is not lost.
        let notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| Error::Notification {
                reason: e.to_string(),
            })?;

        let uuid = characteristic.uuid;
        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == uuid))
            .map(|n| Ok::<_, Error>(Bytes::from(n.value)));

        Ok(stream.boxed())
    }

    async fn unsubscribe(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn disconnect(&self, identifier: &str) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;
        peripheral.disconnect().await.map_err(Error::Bluetooth)
    }

    async fn disconnections(&self) -> Result<DisconnectStream> {
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        let stream = events.filter_map(|event| {
            futures::future::ready(match event {
                CentralEvent::DeviceDisconnected(id) => {
                    debug!("Device disconnected: {:?}", id);
                    Some(id.to_string())
                }
                _ => None,
            })
        });

        Ok(stream.boxed())
    }
}

/// What the adapter's single link is doing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Free,
    Connecting(String),
    Connected(String),
}

/// Owned handle to the application's one Bluetooth adapter.
///
/// Created at startup and shared (via `Arc`) by the scanner and the session.
pub struct AdapterHandle {
    inner: Arc<dyn BleAdapter>,
    is_scanning: AtomicBool,
    link: Mutex<Link>,
}

impl AdapterHandle {
    /// Open the system adapter through btleplug.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let adapter = BtleplugAdapter::new().await?;
        Ok(Self::from_adapter(Arc::new(adapter)))
    }

    /// Wrap any [`BleAdapter`] implementation.
    pub fn from_adapter(inner: Arc<dyn BleAdapter>) -> Self {
        Self {
            inner,
            is_scanning: AtomicBool::new(false),
            link: Mutex::new(Link::Free),
        }
    }

    /// Check if a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    /// Identifier of the connected peripheral, if any.
    pub fn connected_peripheral(&self) -> Option<String> {
        match &*self.link.lock() {
            Link::Connected(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Check if a connection attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(&*self.link.lock(), Link::Connecting(_))
    }

    /// Open the scan event stream.
    pub async fn scan_events(&self) -> Result<ScanEventStream> {
        self.inner.scan_events().await
    }

    /// Start scanning. Rejected while a connection attempt is in flight.
    pub async fn start_scan(&self) -> Result<()> {
        if let Link::Connecting(id) = &*self.link.lock() {
            return Err(Error::AdapterBusy {
                reason: format!("connecting to {}", id),
            });
        }

        if self.is_scanning.swap(true, Ordering::SeqCst) {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        if let Err(e) = self.inner.start_scan().await {
            self.is_scanning.store(false, Ordering::SeqCst);
            return Err(e);
        }

        debug!("Adapter scan started");
        Ok(())
    }

    /// Stop scanning. No-op when not scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        if !self.is_scanning.swap(false, Ordering::SeqCst) {
            trace!("Not scanning, ignoring stop request");
            return Ok(());
        }

        debug!("Adapter scan stopped");
        self.inner.stop_scan().await
    }

    /// Connect the adapter's single link to a peripheral.
    pub async fn connect(&self, identifier: &str) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::AdapterBusy {
                reason: "scan in progress".to_string(),
            });
        }

        {
            let mut link = self.link.lock();
            if let Link::Connecting(id) | Link::Connected(id) = &*link {
                return Err(Error::AdapterBusy {
                    reason: format!("link in use by {}", id),
                });
            }
            *link = Link::Connecting(identifier.to_string());
        }

        match self.inner.connect(identifier).await {
            Ok(()) => {
                *self.link.lock() = Link::Connected(identifier.to_string());
                Ok(())
            }
            Err(e) => {
                *self.link.lock() = Link::Free;
                Err(e)
            }
        }
    }

    /// Enumerate services of a connected peripheral.
    pub async fn discover_services(&self, identifier: &str) -> Result<Vec<GattService>> {
        self.inner.discover_services(identifier).await
    }

    /// Open a notification stream for a characteristic.
    pub async fn notifications(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        self.inner
            .notifications(identifier, service, characteristic)
            .await
    }

    /// Disable notifications for a characteristic.
    pub async fn unsubscribe(
        &self,
        identifier: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        self.inner
            .unsubscribe(identifier, service, characteristic)
            .await
    }

    /// Release the link. The link is free afterwards even if the platform call fails.
    pub async fn disconnect(&self, identifier: &str) -> Result<()> {
        *self.link.lock() = Link::Free;
        self.inner.disconnect(identifier).await
    }

    /// Open the link-down event stream.
    pub async fn disconnections(&self) -> Result<DisconnectStream> {
        self.inner.disconnections().await
    }

    /// Record that the platform dropped the link.
    pub fn link_lost(&self, identifier: &str) {
        let mut link = self.link.lock();
        if matches!(&*link, Link::Connected(id) if id == identifier) {
            *link = Link::Free;
        }
    }

    /// Stop scanning and drop any connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down Bluetooth adapter handle");

        if let Err(e) = self.stop_scan().await {
            warn!("Error stopping scan during shutdown: {}", e);
        }

        if let Some(id) = self.connected_peripheral() {
            self.disconnect(&id).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAdapter;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_scan_start_stop_is_idempotent() {
        let fake = Arc::new(FakeAdapter::new());
        let handle = AdapterHandle::from_adapter(fake.clone());

        assert_ok!(handle.start_scan().await);
        assert_ok!(handle.start_scan().await);
        assert!(handle.is_scanning());
        assert_eq!(fake.calls().start_scans, 1);

        assert_ok!(handle.stop_scan().await);
        assert_ok!(handle.stop_scan().await);
        assert!(!handle.is_scanning());
        assert_eq!(fake.calls().stop_scans, 1);
    }

    #[tokio::test]
    async fn test_connect_rejected_while_scanning() {
        let fake = Arc::new(FakeAdapter::new());
        let handle = AdapterHandle::from_adapter(fake.clone());

        assert_ok!(handle.start_scan().await);
        let err = assert_err!(handle.connect("AA:BB").await);
        assert!(matches!(err, Error::AdapterBusy { .. }));
        assert_eq!(fake.calls().connects, 0);
    }

    #[tokio::test]
    async fn test_single_link() {
        let fake = Arc::new(FakeAdapter::new());
        let handle = AdapterHandle::from_adapter(fake.clone());

        assert_ok!(handle.connect("AA:BB").await);
        assert_eq!(handle.connected_peripheral().as_deref(), Some("AA:BB"));

        let err = assert_err!(handle.connect("CC:DD").await);
        assert!(matches!(err, Error::AdapterBusy { .. }));

        assert_ok!(handle.disconnect("AA:BB").await);
        assert_eq!(handle.connected_peripheral(), None);
        assert_ok!(handle.connect("CC:DD").await);
    }

    #[tokio::test]
    async fn test_failed_connect_frees_link() {
        let fake = Arc::new(FakeAdapter::new());
        fake.fail_connect(true);
        let handle = AdapterHandle::from_adapter(fake.clone());

        assert_err!(handle.connect("AA:BB").await);
        assert!(!handle.is_connecting());
        assert_eq!(handle.connected_peripheral(), None);
    }

    #[tokio::test]
    async fn test_link_lost_frees_only_matching_link() {
        let fake = Arc::new(FakeAdapter::new());
        let handle = AdapterHandle::from_adapter(fake.clone());

        assert_ok!(handle.connect("AA:BB").await);
        handle.link_lost("CC:DD");
        assert_eq!(handle.connected_peripheral().as_deref(), Some("AA:BB"));

        handle.link_lost("AA:BB");
        assert_eq!(handle.connected_peripheral(), None);
        assert_eq!(fake.calls().disconnects, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let fake = Arc::new(FakeAdapter::new());
        let handle = AdapterHandle::from_adapter(fake.clone());

        assert_ok!(handle.connect("AA:BB").await);
        assert_ok!(handle.shutdown().await);
        assert_eq!(handle.connected_peripheral(), None);
        assert_eq!(fake.calls().disconnects, 1);
    }
}
