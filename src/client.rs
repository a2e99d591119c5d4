//! Client facade for the UI layer.
//!
//! [`ScaleClient`] ties the permission gate, scanner and session together
//! and turns user intents (open picker, select scale, start/stop, disconnect)
//! into session operations. Failures are logged here and reported to the UI
//! only as coarse outcomes; the UI never has to handle an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::ble::adapter::{AdapterHandle, BleAdapter};
use crate::ble::discovery::{NameFilter, PeripheralRef};
use crate::ble::scanner::Scanner;
use crate::callback::{spawn_listener, CallbackHandle};
use crate::config::ScaleConfig;
use crate::error::{Error, Result};
use crate::permissions::{NoPermissionBridge, PermissionGate, PermissionRequester};
use crate::reading::Reading;
use crate::session::{Session, SessionState};

/// Entry point for applications talking to one weight scale.
pub struct ScaleClient {
    /// Active configuration.
    config: ScaleConfig,
    /// The application's adapter.
    handle: Arc<AdapterHandle>,
    /// Runtime permission gate.
    permissions: PermissionGate,
    /// Scanner feeding the picker.
    scanner: Scanner,
    /// The one scale session.
    session: Arc<Session>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl ScaleClient {
    /// Create a client on the system Bluetooth adapter with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(ScaleConfig::default()).await
    }

    /// Create a client on the system Bluetooth adapter.
    ///
    /// No permission bridge is installed, so on Android every runtime
    /// permission counts as denied; use [`ScaleClient::with_components`] to
    /// supply one.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_config(config: ScaleConfig) -> Result<Self> {
        let handle = AdapterHandle::new().await?;
        Ok(Self::from_handle(
            config,
            Arc::new(handle),
            Arc::new(NoPermissionBridge),
        ))
    }

    /// Create a client over an explicit adapter and permission bridge.
    pub fn with_components(
        config: ScaleConfig,
        adapter: Arc<dyn BleAdapter>,
        requester: Arc<dyn PermissionRequester>,
    ) -> Self {
        Self::from_handle(
            config,
            Arc::new(AdapterHandle::from_adapter(adapter)),
            requester,
        )
    }

    fn from_handle(
        config: ScaleConfig,
        handle: Arc<AdapterHandle>,
        requester: Arc<dyn PermissionRequester>,
    ) -> Self {
        let scanner = Scanner::new(
            handle.clone(),
            NameFilter::new(config.name_marker.clone()),
            config.event_capacity,
        )
        .retain_discoveries(config.retain_discoveries);

        let session = Arc::new(Session::new(
            handle.clone(),
            config.event_capacity,
            config.reading_capacity,
        ));

        Self {
            permissions: PermissionGate::new(config.platform, requester),
            config,
            handle,
            scanner,
            session,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ScaleConfig {
        &self.config
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    // === Permissions & scanning ===

    /// Ask for every runtime permission BLE needs on this platform.
    pub async fn request_permissions(&self) -> bool {
        self.permissions.request_permissions().await
    }

    /// Start scanning for scales. Scan faults after start are only logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter refuses to start scanning.
    pub async fn scan_for_peripherals(&self) -> Result<()> {
        self.scanner.start_scanning().await
    }

    /// Open the device picker: request permissions, then scan.
    ///
    /// Returns `false` if permissions were denied or the scan could not start.
    pub async fn open_picker(&self) -> bool {
        if !self.request_permissions().await {
            warn!("Not scanning: {}", Error::PermissionDenied);
            return false;
        }

        match self.scan_for_peripherals().await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                false
            }
        }
    }

    /// Close the device picker and stop scanning.
    pub async fn close_picker(&self) {
        if let Err(e) = self.scanner.stop_scanning().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    /// Check if scanning.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Scales found so far, in first-seen order.
    pub fn devices(&self) -> Vec<PeripheralRef> {
        self.scanner.discovered()
    }

    /// Subscribe to newly discovered scales.
    pub fn subscribe_devices(&self) -> broadcast::Receiver<PeripheralRef> {
        self.scanner.subscribe()
    }

    /// Register a callback for newly discovered scales.
    pub fn on_device_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(PeripheralRef) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        spawn_listener(callback_id, self.scanner.subscribe(), callback)
    }

    // === Connection ===

    /// Connect to a scale from the picker by identifier.
    ///
    /// Returns `true` once the scale is ready. Failures are logged and leave
    /// the session idle.
    pub async fn select_peripheral(&self, identifier: &str) -> bool {
        match self.scanner.get(identifier) {
            Some(peripheral) => self.connect_to_device(peripheral).await,
            None => {
                error!(
                    "Failed to connect: {}",
                    Error::PeripheralNotFound {
                        identifier: identifier.to_string()
                    }
                );
                false
            }
        }
    }

    /// Connect to a scale.
    ///
    /// Returns `true` once the scale is ready. Failures are logged and leave
    /// the session idle.
    pub async fn connect_to_device(&self, peripheral: PeripheralRef) -> bool {
        // Stop our scan loop too, not only the radio.
        self.close_picker().await;

        match self.session.connect(peripheral).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to connect: {}", e);
                false
            }
        }
    }

    /// The connected scale, if the session is up.
    pub fn connected_device(&self) -> Option<PeripheralRef> {
        if self.session.state().is_connected() {
            self.session.peripheral()
        } else {
            None
        }
    }

    /// Start or stop weight monitoring.
    ///
    /// Returns whether monitoring is active afterwards.
    pub async fn set_monitoring(&self, enabled: bool) -> bool {
        let result = if enabled {
            self.session.subscribe().await
        } else {
            self.session.unsubscribe().await
        };

        if let Err(e) = result {
            error!(
                "Failed to {} monitoring: {}",
                if enabled { "start" } else { "stop" },
                e
            );
        }

        self.is_monitoring()
    }

    /// Check if weight notifications are active.
    pub fn is_monitoring(&self) -> bool {
        self.session.state() == SessionState::Subscribed
    }

    /// Disconnect from the scale. Safe to call at any time; abandons a
    /// connection attempt that is still pending.
    pub async fn disconnect(&self) {
        if let Err(e) = self.session.disconnect().await {
            warn!("Error disconnecting: {}", e);
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Subscribe to session state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.session.subscribe_state()
    }

    /// Register a callback for session state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        spawn_listener(callback_id, self.session.subscribe_state(), callback)
    }

    // === Readings ===

    /// Latest weight, or `"0"` when there is none.
    pub fn weight(&self) -> Reading {
        self.session.reading()
    }

    /// Subscribe to weight changes.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<Reading> {
        self.session.subscribe_readings()
    }

    /// Register a callback for weight changes.
    pub fn on_reading<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Reading) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        spawn_listener(callback_id, self.session.subscribe_readings(), callback)
    }

    /// Stop scanning, disconnect, and release the adapter.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down scale client");

        self.close_picker().await;
        if let Err(e) = self.session.disconnect().await {
            warn!("Error disconnecting scale: {}", e);
        }
        self.handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{MockPermissionRequester, Permission, PermissionStatus, Platform};
    use crate::testing::FakeAdapter;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn client(fake: &Arc<FakeAdapter>, platform: Platform) -> ScaleClient {
        let mut requester = MockPermissionRequester::new();
        requester
            .expect_request()
            .returning(|_, _| PermissionStatus::Granted);

        ScaleClient::with_components(
            ScaleConfig::new().with_platform(platform),
            fake.clone(),
            Arc::new(requester),
        )
    }

    async fn wait_for_devices(client: &ScaleClient, count: usize) {
        timeout(WAIT, async {
            while client.devices().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_weigh_in_walkthrough() {
        let fake = Arc::new(FakeAdapter::new());
        let client = client(&fake, Platform::Desktop);
        let mut readings = client.subscribe_readings();

        assert!(client.open_picker().await);
        fake.discover("A", Some("Scale-01"));
        fake.discover("B", Some("Other"));
        fake.discover("C", Some("Scale-02"));
        wait_for_devices(&client, 2).await;

        let ids: Vec<_> = client
            .devices()
            .iter()
            .map(|p| p.identifier().to_string())
            .collect();
        assert_eq!(ids, vec!["A", "C"]);

        assert!(client.select_peripheral("A").await);
        assert_eq!(client.state(), SessionState::Ready);
        assert!(!client.is_scanning());
        assert_eq!(
            client.connected_device().map(|p| p.name().to_string()),
            Some("Scale-01".to_string())
        );

        assert!(client.set_monitoring(true).await);
        assert_eq!(client.state(), SessionState::Subscribed);

        fake.notify(b"52.3");
        fake.notify(b"52.3");
        fake.notify(b"52.5");
        assert_eq!(
            timeout(WAIT, readings.recv()).await.unwrap().unwrap(),
            Reading::new("52.3")
        );
        assert_eq!(
            timeout(WAIT, readings.recv()).await.unwrap().unwrap(),
            Reading::new("52.5")
        );
        assert_eq!(client.weight(), Reading::new("52.5"));

        client.disconnect().await;
        assert_eq!(client.state(), SessionState::Idle);
        assert_eq!(client.weight().as_str(), "0");
        assert_eq!(client.connected_device(), None);
    }

    #[tokio::test]
    async fn test_denied_connect_permission_blocks_scan() {
        let fake = Arc::new(FakeAdapter::new());
        let mut requester = MockPermissionRequester::new();
        requester
            .expect_request()
            .times(3)
            .returning(|permission, _| match permission {
                Permission::BluetoothConnect => PermissionStatus::Denied,
                _ => PermissionStatus::Granted,
            });

        let client = ScaleClient::with_components(
            ScaleConfig::new().with_platform(Platform::Android {
                api_level: Some(31),
            }),
            fake.clone(),
            Arc::new(requester),
        );

        assert!(!client.open_picker().await);
        assert!(!client.is_scanning());
        assert_eq!(fake.calls().start_scans, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_stays_idle() {
        let fake = Arc::new(FakeAdapter::new());
        fake.fail_connect(true);
        let client = client(&fake, Platform::Ios);

        assert!(client.open_picker().await);
        fake.discover("A", Some("Scale-01"));
        wait_for_devices(&client, 1).await;

        assert!(!client.select_peripheral("A").await);
        assert_eq!(client.state(), SessionState::Idle);
        assert_eq!(client.connected_device(), None);
        assert_eq!(fake.calls().connects, 1);
    }

    #[tokio::test]
    async fn test_unknown_peripheral_is_not_connected() {
        let fake = Arc::new(FakeAdapter::new());
        let client = client(&fake, Platform::Desktop);

        assert!(!client.select_peripheral("missing").await);
        assert_eq!(fake.calls().connects, 0);
    }

    #[tokio::test]
    async fn test_toggle_monitoring_without_connection() {
        let fake = Arc::new(FakeAdapter::new());
        let client = client(&fake, Platform::Desktop);

        assert!(!client.set_monitoring(true).await);
        assert!(!client.set_monitoring(false).await);
        assert_eq!(fake.calls().subscribes, 0);
    }

    #[tokio::test]
    async fn test_callbacks() {
        let fake = Arc::new(FakeAdapter::new());
        let client = client(&fake, Platform::Desktop);
        let discovered = Arc::new(AtomicUsize::new(0));

        let _devices = client.on_device_discovered({
            let discovered = discovered.clone();
            move |_| {
                discovered.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(client.open_picker().await);
        fake.discover("A", Some("Scale-01"));
        fake.discover("A", Some("Scale-01"));
        wait_for_devices(&client, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(discovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let fake = Arc::new(FakeAdapter::new());
        let client = client(&fake, Platform::Desktop);

        assert!(client.open_picker().await);
        fake.discover("A", Some("Scale-01"));
        wait_for_devices(&client, 1).await;
        assert!(client.select_peripheral("A").await);
        assert!(client.set_monitoring(true).await);

        client.shutdown().await.unwrap();
        assert_eq!(client.state(), SessionState::Idle);
        assert!(!client.is_scanning());
        assert_eq!(fake.calls().disconnects, 1);
    }
}
