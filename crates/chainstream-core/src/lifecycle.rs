//! Stop coordination shared by every long-running instance.
//!
//! Emissions run behind a gate. `stop()` raises the flag and then takes the
//! gate, so once it returns no further emission can start.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

pub struct Lifecycle {
    stop_tx: watch::Sender<bool>,
    gate: Mutex<()>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            gate: Mutex::new(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Raise the stop flag without waiting for an in-flight emission.
    ///
    /// Safe to call from inside an observer callback.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Raise the stop flag and wait for any in-flight emission to settle.
    ///
    /// Must not be awaited from inside an emission of the same instance;
    /// use [`Lifecycle::request_stop`] there.
    pub async fn stop(&self) {
        self.stop_with(async {}).await;
    }

    /// Like [`Lifecycle::stop`], then run `last` while still holding the gate.
    ///
    /// Used for the final `error`/`closed` notifications, which must not
    /// interleave with an emission.
    pub async fn stop_with<F, R>(&self, last: F) -> R
    where
        F: Future<Output = R>,
    {
        self.request_stop();
        let _gate = self.gate.lock().await;
        last.await
    }

    /// Run `emission` unless the instance has been stopped.
    pub async fn emit<F, R>(&self, emission: F) -> Option<R>
    where
        F: Future<Output = R>,
    {
        let _gate = self.gate.lock().await;
        if self.is_stopped() {
            return None;
        }
        Some(emission.await)
    }

    /// Resolves once the stop flag is raised.
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration`; returns `false` if stopped in the meantime.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_stopped(),
            _ = self.stopped() => false,
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
