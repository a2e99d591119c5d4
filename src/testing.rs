//! In-memory [`BleAdapter`] for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ble::adapter::{
    BleAdapter, DisconnectStream, GattService, NotificationStream, ScanEvent, ScanEventStream,
};
use crate::ble::uuids::{WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID, WEIGHT_SCALE_SERVICE_UUID};
use crate::error::{Error, Result};

/// What the fake pushes down an open notification stream.
#[derive(Debug, Clone)]
pub(crate) enum FakeNotification {
    Payload(Bytes),
    Fault(String),
    End,
}

/// Number of times each primitive was invoked, plus the order they ran in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Calls {
    pub start_scans: usize,
    pub stop_scans: usize,
    pub connects: usize,
    pub discoveries: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub disconnects: usize,
    pub order: Vec<&'static str>,
}

impl Calls {
    fn record(&mut self, call: &'static str) {
        self.order.push(call);
        match call {
            "start_scan" => self.start_scans += 1,
            "stop_scan" => self.stop_scans += 1,
            "connect" => self.connects += 1,
            "discover_services" => self.discoveries += 1,
            "subscribe" => self.subscribes += 1,
            "unsubscribe" => self.unsubscribes += 1,
            "disconnect" => self.disconnects += 1,
            _ => {}
        }
    }
}

pub(crate) struct FakeAdapter {
    scan_tx: broadcast::Sender<ScanEvent>,
    notify_tx: broadcast::Sender<FakeNotification>,
    disconnect_tx: broadcast::Sender<String>,
    services: Mutex<Vec<GattService>>,
    calls: Mutex<Calls>,
    fail_connect: AtomicBool,
    fail_discovery: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        let (scan_tx, _) = broadcast::channel(64);
        let (notify_tx, _) = broadcast::channel(64);
        let (disconnect_tx, _) = broadcast::channel(16);

        Self {
            scan_tx,
            notify_tx,
            disconnect_tx,
            services: Mutex::new(vec![GattService {
                uuid: WEIGHT_SCALE_SERVICE_UUID,
                characteristics: vec![WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID],
            }]),
            calls: Mutex::new(Calls::default()),
            fail_connect: AtomicBool::new(false),
            fail_discovery: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        *self.services.lock() = services;
    }

    pub fn discover(&self, identifier: &str, name: Option<&str>) {
        let _ = self.scan_tx.send(ScanEvent::Discovered {
            identifier: identifier.to_string(),
            name: name.map(str::to_string),
        });
    }

    pub fn scan_fault(&self, reason: &str) {
        let _ = self.scan_tx.send(ScanEvent::Failed {
            reason: reason.to_string(),
        });
    }

    pub fn notify(&self, payload: &[u8]) {
        let _ = self
            .notify_tx
            .send(FakeNotification::Payload(Bytes::copy_from_slice(payload)));
    }

    pub fn notify_fault(&self, reason: &str) {
        let _ = self
            .notify_tx
            .send(FakeNotification::Fault(reason.to_string()));
    }

    /// End the notification stream, as platforms that close it on link loss do.
    pub fn drop_link(&self) {
        let _ = self.notify_tx.send(FakeNotification::End);
    }

    /// Report a link-down event while leaving notification streams open.
    pub fn disconnect_event(&self, identifier: &str) {
        let _ = self.disconnect_tx.send(identifier.to_string());
    }
}

fn receiver_stream<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn start_scan(&self) -> Result<()> {
        self.calls.lock().record("start_scan");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.calls.lock().record("stop_scan");
        Ok(())
    }

    async fn scan_events(&self) -> Result<ScanEventStream> {
        Ok(receiver_stream(self.scan_tx.subscribe()))
    }

    async fn connect(&self, identifier: &str) -> Result<()> {
        self.calls.lock().record("connect");

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                reason: format!("{} did not respond", identifier),
            });
        }
        Ok(())
    }

    async fn discover_services(&self, _identifier: &str) -> Result<Vec<GattService>> {
        self.calls.lock().record("discover_services");

        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                reason: "service discovery failed".to_string(),
            });
        }
        Ok(self.services.lock().clone())
    }

    async fn notifications(
        &self,
        _identifier: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream> {
        self.calls.lock().record("subscribe");

        let stream = receiver_stream(self.notify_tx.subscribe())
            .take_while(|n| futures::future::ready(!matches!(n, FakeNotification::End)))
            .map(|n| match n {
                FakeNotification::Payload(bytes) => Ok(bytes),
                FakeNotification::Fault(reason) => Err(Error::Notification { reason }),
                FakeNotification::End => unreachable!(),
            });

        Ok(stream.boxed())
    }

    async fn unsubscribe(
        &self,
        _identifier: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<()> {
        self.calls.lock().record("unsubscribe");
        Ok(())
    }

    async fn disconnect(&self, identifier: &str) -> Result<()> {
        self.calls.lock().record("disconnect");
        let _ = self.disconnect_tx.send(identifier.to_string());
        Ok(())
    }

    async fn disconnections(&self) -> Result<DisconnectStream> {
        Ok(receiver_stream(self.disconnect_tx.subscribe()))
    }
}
