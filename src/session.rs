//! Session with one weight scale.
//!
//! A [`Session`] drives a single peripheral through
//! `Idle → Connecting → Discovering → Ready → Subscribed` and back. The
//! notification subscription lives inside the `Subscribed` state, so a
//! subscription without a connection cannot be represented.

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::ble::adapter::{AdapterHandle, GattService};
use crate::ble::discovery::PeripheralRef;
use crate::ble::uuids::{
    is_weight_scale_service, WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID, WEIGHT_SCALE_SERVICE_UUID,
    WEIGHT_SUBSCRIPTION_TAG,
};
use crate::error::{Error, Result};
use crate::reading::{Reading, ReadingTracker};

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// No peripheral.
    #[default]
    Idle,
    /// Link being established.
    Connecting,
    /// Enumerating services and characteristics.
    Discovering,
    /// Connected, not receiving weights.
    Ready,
    /// Connected and receiving weight notifications.
    Subscribed,
    /// The peripheral dropped the link.
    Disconnected,
}

impl SessionState {
    /// Check if a link to the scale is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Ready | Self::Subscribed)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Active notification registration.
struct Subscription {
    tag: &'static str,
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    fn cancel(&self) {
        debug!("Cancelling subscription {}", self.tag);
        self.task.abort();
    }
}

/// Task watching the platform's link-down events for the bound scale.
struct LinkMonitor {
    task: tokio::task::JoinHandle<()>,
}

enum Phase {
    Idle,
    Connecting {
        peripheral: PeripheralRef,
    },
    Discovering {
        peripheral: PeripheralRef,
    },
    Ready {
        peripheral: PeripheralRef,
        services: Vec<GattService>,
        monitor: Option<LinkMonitor>,
    },
    Subscribed {
        peripheral: PeripheralRef,
        services: Vec<GattService>,
        monitor: Option<LinkMonitor>,
        subscription: Subscription,
    },
    Disconnected,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Connecting { .. } => SessionState::Connecting,
            Self::Discovering { .. } => SessionState::Discovering,
            Self::Ready { .. } => SessionState::Ready,
            Self::Subscribed { .. } => SessionState::Subscribed,
            Self::Disconnected => SessionState::Disconnected,
        }
    }

    fn peripheral(&self) -> Option<&PeripheralRef> {
        match self {
            Self::Connecting { peripheral }
            | Self::Discovering { peripheral }
            | Self::Ready { peripheral, .. }
            | Self::Subscribed { peripheral, .. } => Some(peripheral),
            Self::Idle | Self::Disconnected => None,
        }
    }

    fn into_peripheral(self) -> Option<PeripheralRef> {
        match self {
            Self::Connecting { peripheral }
            | Self::Discovering { peripheral }
            | Self::Ready { peripheral, .. }
            | Self::Subscribed { peripheral, .. } => Some(peripheral),
            Self::Idle | Self::Disconnected => None,
        }
    }

    fn services(&self) -> &[GattService] {
        match self {
            Self::Ready { services, .. } | Self::Subscribed { services, .. } => services.as_slice(),
            _ => &[],
        }
    }

    /// Abort the subscription and link monitor tasks, if any.
    fn cancel_tasks(&self) {
        let (monitor, subscription) = match self {
            Self::Ready { monitor, .. } => (monitor, None),
            Self::Subscribed {
                monitor,
                subscription,
                ..
            } => (monitor, Some(subscription)),
            _ => return,
        };

        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        if let Some(monitor) = monitor {
            monitor.task.abort();
        }
    }
}

/// Last reading plus the epoch it belongs to. The epoch advances on every
/// reset so a notification task from a torn-down link cannot publish.
struct ReadingSlot {
    tracker: ReadingTracker,
    epoch: u64,
}

/// State shared with the notification and link monitor tasks.
///
/// Lock order: `phase` before `readings`.
struct Shared {
    phase: Mutex<Phase>,
    readings: Mutex<ReadingSlot>,
    state_tx: broadcast::Sender<SessionState>,
    reading_tx: broadcast::Sender<Reading>,
}

impl Shared {
    /// Apply a transition to the locked phase and announce any state change.
    fn update<R>(&self, phase: &mut Phase, f: impl FnOnce(Phase) -> (Phase, R)) -> R {
        let from = phase.state();
        let current = std::mem::replace(phase, Phase::Idle);
        let (next, out) = f(current);
        *phase = next;

        let to = phase.state();
        if from != to {
            debug!("Session state changed: {} -> {}", from, to);
            let _ = self.state_tx.send(to);
        }
        out
    }

    fn set(&self, next: Phase) {
        let mut phase = self.phase.lock();
        self.update(&mut phase, |_| (next, ()));
    }

    fn epoch(&self) -> u64 {
        self.readings.lock().epoch
    }

    fn reset_reading(&self) {
        let mut slot = self.readings.lock();
        slot.epoch += 1;
        if !slot.tracker.current().is_none() {
            slot.tracker.reset();
            let _ = self.reading_tx.send(Reading::none());
        }
    }

    fn accept(&self, epoch: u64, payload: &[u8]) {
        let mut slot = self.readings.lock();
        if slot.epoch != epoch {
            return;
        }
        if let Some(reading) = slot.tracker.update(payload) {
            debug!("Weight reading: {}", reading);
            let _ = self.reading_tx.send(reading);
        }
    }

    /// The link went down without a local disconnect.
    fn link_lost(&self, epoch: u64, handle: &AdapterHandle) {
        let mut phase = self.phase.lock();
        if !phase.state().is_connected() || self.epoch() != epoch {
            return;
        }

        let identifier = self.update(&mut phase, |current| {
            current.cancel_tasks();
            let identifier = current.into_peripheral().map(|p| p.identifier().to_string());
            (Phase::Disconnected, identifier)
        });

        if let Some(identifier) = identifier {
            warn!("Lost connection to scale {}", identifier);
            handle.link_lost(&identifier);
        }
        self.reset_reading();
    }
}

fn has_weight_characteristic(services: &[GattService]) -> bool {
    services.iter().any(|s| {
        is_weight_scale_service(&s.uuid)
            && s.has_characteristic(&WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID)
    })
}

/// A session with at most one weight scale.
pub struct Session {
    handle: Arc<AdapterHandle>,
    shared: Arc<Shared>,
    /// Serializes connect/disconnect/subscribe/unsubscribe.
    op_lock: tokio::sync::Mutex<()>,
    /// Bumped by `disconnect` to abandon a connect that is still running.
    cancel_tx: watch::Sender<u64>,
}

impl Session {
    /// Create an idle session.
    pub fn new(handle: Arc<AdapterHandle>, state_capacity: usize, reading_capacity: usize) -> Self {
        let (state_tx, _) = broadcast::channel(state_capacity.max(1));
        let (reading_tx, _) = broadcast::channel(reading_capacity.max(1));
        let (cancel_tx, _) = watch::channel(0);

        Self {
            handle,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                readings: Mutex::new(ReadingSlot {
                    tracker: ReadingTracker::new(),
                    epoch: 0,
                }),
                state_tx,
                reading_tx,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            cancel_tx,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> SessionState {
        self.shared.phase.lock().state()
    }

    /// The peripheral this session is bound to, if any.
    pub fn peripheral(&self) -> Option<PeripheralRef> {
        self.shared.phase.lock().peripheral().cloned()
    }

    /// Services found during discovery.
    pub fn services(&self) -> Vec<GattService> {
        self.shared.phase.lock().services().to_vec()
    }

    /// The last emitted reading, or the sentinel.
    pub fn reading(&self) -> Reading {
        self.shared.readings.lock().tracker.current().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to reading changes.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<Reading> {
        self.shared.reading_tx.subscribe()
    }

    /// Connect to a scale and discover its services.
    ///
    /// Valid from `Idle` or `Disconnected`. Any running scan is stopped
    /// first. On failure the session is back in `Idle`; there is no retry.
    /// A [`disconnect`](Self::disconnect) issued meanwhile abandons the
    /// attempt and releases the link.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` if another connect is running, `InvalidState`
    /// if already bound to a scale, `Cancelled` if a disconnect interrupted
    /// the attempt, or the adapter error.
    pub async fn connect(&self, peripheral: PeripheralRef) -> Result<()> {
        // Taken before the lock so a racing disconnect is never missed.
        let mut cancel = self.cancel_tx.subscribe();

        let _guard = self
            .op_lock
            .try_lock()
            .map_err(|_| Error::OperationInProgress)?;

        let state = self.state();
        if !matches!(state, SessionState::Idle | SessionState::Disconnected) {
            return Err(Error::InvalidState {
                operation: "connect",
                state: state.to_string(),
            });
        }

        let identifier = peripheral.identifier().to_string();
        info!("Connecting to scale {} ({})", peripheral.name(), identifier);

        self.shared.reset_reading();

        if let Err(e) = self.handle.stop_scan().await {
            warn!("Failed to stop scan before connecting: {}", e);
        }

        tokio::select! {
            result = self.establish(peripheral, &identifier) => result,
            _ = cancel.changed() => {
                info!("Connection to {} cancelled", identifier);
                if let Err(e) = self.handle.disconnect(&identifier).await {
                    debug!("Releasing {} after cancel: {}", identifier, e);
                }
                self.shared.set(Phase::Idle);
                Err(Error::Cancelled {
                    identifier: identifier.clone(),
                })
            }
        }
    }

    async fn establish(&self, peripheral: PeripheralRef, identifier: &str) -> Result<()> {
        self.shared.set(Phase::Connecting {
            peripheral: peripheral.clone(),
        });

        if let Err(e) = self.handle.connect(identifier).await {
            debug!("Connect to {} failed: {}", identifier, e);
            self.shared.set(Phase::Idle);
            return Err(e);
        }

        self.shared.set(Phase::Discovering {
            peripheral: peripheral.clone(),
        });

        let services = match self.handle.discover_services(identifier).await {
            Ok(services) => services,
            Err(e) => {
                debug!("Service discovery on {} failed: {}", identifier, e);
                if let Err(e) = self.handle.disconnect(identifier).await {
                    debug!("Releasing {} after failed discovery: {}", identifier, e);
                }
                self.shared.set(Phase::Idle);
                return Err(e);
            }
        };

        debug!("Discovered {} services on {}", services.len(), identifier);
        if !has_weight_characteristic(&services) {
            warn!(
                "Scale {} does not expose weight characteristic {}",
                identifier, WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID
            );
        }

        let events = match self.handle.disconnections().await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("Cannot watch link to {}: {}", identifier, e);
                None
            }
        };

        // Spawn under the phase lock so an immediate link-down event finds
        // the session ready.
        {
            let mut phase = self.shared.phase.lock();
            let monitor = events.map(|mut events| {
                let epoch = self.shared.epoch();
                let shared = self.shared.clone();
                let handle = self.handle.clone();
                let watched = identifier.to_string();

                LinkMonitor {
                    task: tokio::spawn(async move {
                        while let Some(id) = events.next().await {
                            if id == watched {
                                debug!("Platform reported link down for {}", watched);
                                shared.link_lost(epoch, &handle);
                                break;
                            }
                        }
                    }),
                }
            });

            self.shared.update(&mut phase, |_| {
                (
                    Phase::Ready {
                        peripheral,
                        services,
                        monitor,
                    },
                    (),
                )
            });
        }
        info!("Connected to scale {}", identifier);

        Ok(())
    }

    /// Start receiving weight notifications.
    ///
    /// Valid only from `Ready`; a no-op when already subscribed. Faults on
    /// the notification channel are logged and the subscription stays up.
    pub async fn subscribe(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let peripheral = {
            let phase = self.shared.phase.lock();
            match &*phase {
                Phase::Subscribed { .. } => {
                    debug!("Already subscribed");
                    return Ok(());
                }
                Phase::Ready {
                    peripheral,
                    services,
                    ..
                } => {
                    if !has_weight_characteristic(services) {
                        return Err(Error::CharacteristicNotFound {
                            uuid: WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID.to_string(),
                        });
                    }
                    peripheral.clone()
                }
                other => {
                    return Err(Error::InvalidState {
                        operation: "subscribe",
                        state: other.state().to_string(),
                    })
                }
            }
        };

        let mut stream = self
            .handle
            .notifications(
                peripheral.identifier(),
                WEIGHT_SCALE_SERVICE_UUID,
                WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID,
            )
            .await?;

        let epoch = self.shared.epoch();
        let shared = self.shared.clone();
        let handle = self.handle.clone();

        // Spawn under the phase lock so a stream that ends at once still
        // finds the session subscribed.
        {
            let mut phase = self.shared.phase.lock();
            let task = tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(payload) => shared.accept(epoch, &payload),
                        Err(e) => {
                            warn!("Notification error on {}: {}", WEIGHT_SUBSCRIPTION_TAG, e)
                        }
                    }
                }
                debug!("Notification stream {} ended", WEIGHT_SUBSCRIPTION_TAG);
                shared.link_lost(epoch, &handle);
            });

            self.shared.update(&mut phase, |current| match current {
                Phase::Ready {
                    peripheral,
                    services,
                    monitor,
                } => (
                    Phase::Subscribed {
                        peripheral,
                        services,
                        monitor,
                        subscription: Subscription {
                            tag: WEIGHT_SUBSCRIPTION_TAG,
                            task,
                        },
                    },
                    (),
                ),
                other => {
                    task.abort();
                    (other, ())
                }
            });
        }

        info!("Subscribed to weight notifications ({})", WEIGHT_SUBSCRIPTION_TAG);
        Ok(())
    }

    /// Stop receiving weight notifications. No-op when not subscribed.
    pub async fn unsubscribe(&self) -> Result<()> {
        if self.state() != SessionState::Subscribed {
            debug!("Not subscribed, nothing to cancel");
            return Ok(());
        }

        let _guard = self.op_lock.lock().await;

        let cancelled = {
            let mut phase = self.shared.phase.lock();
            self.shared.update(&mut phase, |current| match current {
                Phase::Subscribed {
                    peripheral,
                    services,
                    monitor,
                    subscription,
                } => {
                    subscription.cancel();
                    let identifier = peripheral.identifier().to_string();
                    (
                        Phase::Ready {
                            peripheral,
                            services,
                            monitor,
                        },
                        Some(identifier),
                    )
                }
                other => (other, None),
            })
        };

        let Some(identifier) = cancelled else {
            return Ok(());
        };

        info!("Stopped weight notifications ({})", WEIGHT_SUBSCRIPTION_TAG);
        self.handle
            .unsubscribe(
                &identifier,
                WEIGHT_SCALE_SERVICE_UUID,
                WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID,
            )
            .await
    }

    /// Tear the session down and return to `Idle`.
    ///
    /// Interrupts a connect that is still running, cancels any subscription
    /// before releasing the link, forgets the peripheral and resets the
    /// reading. Idempotent. The session is `Idle` afterwards even if the
    /// platform reports an error.
    pub async fn disconnect(&self) -> Result<()> {
        self.cancel_tx.send_modify(|generation| *generation += 1);

        let _guard = self.op_lock.lock().await;

        let released = {
            let mut phase = self.shared.phase.lock();
            if matches!(*phase, Phase::Idle) {
                return Ok(());
            }

            self.shared.update(&mut phase, |current| {
                current.cancel_tasks();
                let was_subscribed = matches!(current, Phase::Subscribed { .. });
                let released = current
                    .into_peripheral()
                    .map(|peripheral| (peripheral, was_subscribed));
                (Phase::Idle, released)
            })
        };

        self.shared.reset_reading();

        let Some((peripheral, was_subscribed)) = released else {
            return Ok(());
        };

        info!("Disconnecting from scale {}", peripheral.identifier());

        if was_subscribed {
            if let Err(e) = self
                .handle
                .unsubscribe(
                    peripheral.identifier(),
                    WEIGHT_SCALE_SERVICE_UUID,
                    WEIGHT_MEASUREMENT_CHARACTERISTIC_UUID,
                )
                .await
            {
                debug!("Unsubscribe during disconnect failed: {}", e);
            }
        }

        self.handle.disconnect(peripheral.identifier()).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.phase.lock().cancel_tasks();
    }
}
