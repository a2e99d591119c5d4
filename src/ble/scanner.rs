//! BLE scanning functionality.
//!
//! Provides the scanner that fills the [`DiscoverySet`] with weight scales.

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::{AdapterHandle, ScanEvent};
use crate::ble::discovery::{DiscoverySet, NameFilter, PeripheralRef};
use crate::error::Result;

/// How often the event loop re-checks whether the scan was stopped elsewhere.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// BLE scanner for discovering weight scales.
pub struct Scanner {
    /// Shared adapter handle.
    handle: Arc<AdapterHandle>,
    /// Advertised-name filter.
    filter: NameFilter,
    /// Keep entries from earlier scans when a new scan starts.
    retain_discoveries: bool,
    /// Discovered scales.
    discovered: Arc<RwLock<DiscoverySet>>,
    /// Channel for newly discovered scales.
    event_tx: broadcast::Sender<PeripheralRef>,
    /// Handle to the scanning task.
    scan_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scanner {
    /// Create a scanner over an adapter handle.
    pub fn new(handle: Arc<AdapterHandle>, filter: NameFilter, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            handle,
            filter,
            retain_discoveries: false,
            discovered: Arc::new(RwLock::new(DiscoverySet::new())),
            event_tx,
            scan_handle: Mutex::new(None),
        }
    }

    /// Keep previously discovered scales when a new scan starts.
    pub fn retain_discoveries(mut self, retain: bool) -> Self {
        self.retain_discoveries = retain;
        self
    }

    /// Start scanning for scales.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter refuses to scan.
    pub async fn start_scanning(&self) -> Result<()> {
        if self.handle.is_scanning() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!(
            "Starting BLE scan for scales (name contains {:?})",
            self.filter.marker()
        );

        // Subscribe before the radio starts so no early advertisement is missed.
        let mut events = self.handle.scan_events().await?;
        self.handle.start_scan().await?;

        // Only a scan the adapter accepted replaces the previous results.
        if !self.retain_discoveries {
            self.discovered.write().clear();
        }

        let handle = self.handle.clone();
        let filter = self.filter.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            while handle.is_scanning() {
                tokio::select! {
                    event = events.next() => match event {
                        Some(event) => {
                            Self::handle_event(event, &handle, &filter, &discovered, &event_tx);
                        }
                        None => {
                            debug!("Scan event stream closed");
                            break;
                        }
                    },
                    _ = tokio::time::sleep(SCAN_POLL_INTERVAL) => {}
                }
            }

            debug!("Scan event loop ended");
        });

        if let Some(previous) = self.scan_handle.lock().replace(task) {
            previous.abort();
        }

        Ok(())
    }

    /// Stop scanning for scales.
    pub async fn stop_scanning(&self) -> Result<()> {
        let task = self.scan_handle.lock().take();

        if self.handle.is_scanning() {
            info!("Stopping BLE scan");
        }
        let result = self.handle.stop_scan().await;

        if let Some(task) = task {
            let _ = task.await;
        }

        result
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.handle.is_scanning()
    }

    /// Discovered scales in first-seen order.
    pub fn discovered(&self) -> Vec<PeripheralRef> {
        self.discovered.read().to_vec()
    }

    /// Look up a discovered scale.
    pub fn get(&self, identifier: &str) -> Option<PeripheralRef> {
        self.discovered.read().get(identifier).cloned()
    }

    /// Forget all discovered scales.
    pub fn clear(&self) {
        self.discovered.write().clear();
    }

    /// Subscribe to newly discovered scales.
    pub fn subscribe(&self) -> broadcast::Receiver<PeripheralRef> {
        self.event_tx.subscribe()
    }

    /// Handle one scan event.
    fn handle_event(
        event: ScanEvent,
        handle: &AdapterHandle,
        filter: &NameFilter,
        discovered: &RwLock<DiscoverySet>,
        event_tx: &broadcast::Sender<PeripheralRef>,
    ) {
        match event {
            ScanEvent::Discovered { identifier, name } => {
                if !filter.matches(name.as_deref()) {
                    trace!("Ignoring {} ({:?})", identifier, name);
                    return;
                }

                // Events racing a stop are dropped.
                if !handle.is_scanning() {
                    return;
                }

                let peripheral = PeripheralRef::new(identifier, name.unwrap_or_default());
                if discovered.write().insert(peripheral.clone()) {
                    info!(
                        "Discovered scale: {} ({})",
                        peripheral.name(),
                        peripheral.identifier()
                    );
                    let _ = event_tx.send(peripheral);
                }
            }
            ScanEvent::Failed { reason } => {
                warn!("Scan error: {}", reason);
            }
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(task) = self.scan_handle.lock().take() {
            task.abort();
        }
    }
}
