//! Per-key request coalescing.
//!
//! Concurrent callers for the same key share one execution of the work:
//! the first caller becomes the leader and runs it, later callers
//! subscribe to a broadcast of the leader's result. If the leader is
//! dropped mid-flight the waiters observe [`LeaderCancelled`] instead of
//! hanging on a sender that will never fire.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::broadcast;

/// The leader for this key was cancelled before producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderCancelled;

/// Coalesces concurrent executions per key.
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, sharing the result with concurrent callers.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T, LeaderCancelled>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(mut receiver) = self.try_join(key) {
            return receiver.recv().await.map_err(|_| LeaderCancelled);
        }

        let guard = FlightGuard { flight: self, key };
        let value = work().await;
        guard.complete(value.clone());
        Ok(value)
    }

    /// Become the leader for `key`, or subscribe to the in-flight one.
    fn try_join(&self, key: &str) -> Option<broadcast::Receiver<T>> {
        let mut inflight = self.inflight.lock();
        if let Some(sender) = inflight.get(key) {
            return Some(sender.subscribe());
        }
        // One result per flight, so capacity 1 suffices.
        let (sender, _) = broadcast::channel(1);
        inflight.insert(key.to_string(), sender);
        None
    }

    fn finish(&self, key: &str, value: Option<T>) {
        let mut inflight = self.inflight.lock();
        if let Some(sender) = inflight.remove(key) {
            if let Some(value) = value {
                // No receivers is fine; the leader already has the value.
                let _ = sender.send(value);
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the in-flight entry even when the leader future is dropped at
/// an await point, so waiters see a closed channel instead of hanging.
struct FlightGuard<'a, T: Clone + Send + 'static> {
    flight: &'a SingleFlight<T>,
    key: &'a str,
}

impl<T: Clone + Send + 'static> FlightGuard<'_, T> {
    fn complete(self, value: T) {
        self.flight.finish(self.key, Some(value));
        std::mem::forget(self);
    }
}

impl<T: Clone + Send + 'static> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.flight.finish(self.key, None);
    }
}
