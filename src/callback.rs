//! Callback registrations over broadcast channels.
//!
//! Each `on_*` registration on [`ScaleClient`](crate::ScaleClient) runs a
//! listener task that feeds channel values to the user's closure. The
//! returned [`CallbackHandle`] owns that task.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Registration of a callback. Dropping it unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    listener: JoinHandle<()>,
}

impl CallbackHandle {
    /// Stop delivering values to the callback.
    pub fn unregister(self) {
        debug!("Unregistering callback {}", self.id);
    }

    /// Registration ID, unique per client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the callback still receives values. Turns false once the
    /// source channel closes.
    pub fn is_active(&self) -> bool {
        !self.listener.is_finished()
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Run `callback` for every value on `rx` until the handle is dropped or
/// the channel closes. Lagged values are skipped.
pub(crate) fn spawn_listener<T, F>(id: u64, mut rx: broadcast::Receiver<T>, callback: F) -> CallbackHandle
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let listener = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(value) => callback(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Callback {} lagged, skipped {} events", id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    CallbackHandle { id, listener }
}
