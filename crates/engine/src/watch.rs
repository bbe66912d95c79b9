//! Change capture and the one-shot watch hub.
//!
//! The evaluator sees change capture through the [`ChangeCapture`] trait
//! only; fan-out to remote subscribers lives elsewhere. [`WatchHub`] is
//! the in-process implementation: a registry of one-shot watches that are
//! armed by a WATCH command and fired by the next mutation of their key.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use tidekv_types::{KvError, WatchResult};

/// Receiver of key mutations, installed into the evaluator.
///
/// `capture_data_change` runs synchronously under the evaluator's
/// exclusive lock, once per mutation that changed a value, in apply
/// order. Implementations must not block there; hand the event off and
/// return.
pub trait ChangeCapture: Send + Sync {
    /// A key changed to `value` (empty string for a deletion).
    fn capture_data_change(&self, key: &str, value: &str);

    /// Registers a one-shot watch on `key`.
    ///
    /// # Errors
    ///
    /// An error aborts the WATCH command that requested the registration.
    fn watch(&self, key: &str) -> Result<WatchResult, KvError>;
}

/// In-process one-shot watch registry.
///
/// A watch fires at most once: the first mutation of its key after
/// registration moves it from `armed` to `fired` with the new value.
/// Consumers collect the value with [`WatchHub::take_fired`] or await it
/// with [`WatchHub::wait_fired`].
#[derive(Default)]
pub struct WatchHub {
    next_id: AtomicU64,
    /// Watch ids armed per key.
    armed: DashMap<String, Vec<u64>>,
    /// Fired but not yet collected: watch id to the value it saw.
    fired: DashMap<u64, String>,
    /// Wakes `wait_fired` callers to re-poll `fired`.
    wakeup: Notify,
}

impl WatchHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the fired value for a watch, if it has fired.
    pub fn take_fired(&self, watch_id: u64) -> Option<String> {
        self.fired.remove(&watch_id).map(|(_, value)| value)
    }

    /// Awaits the fired value for a watch.
    pub async fn wait_fired(&self, watch_id: u64) -> String {
        loop {
            // Register interest before checking, so a fire landing between
            // the check and the await still wakes us.
            let mut notified = std::pin::pin!(self.wakeup.notified());
            notified.as_mut().enable();
            if let Some(value) = self.take_fired(watch_id) {
                return value;
            }
            notified.await;
        }
    }

    /// Number of armed (not yet fired) watches, across all keys.
    pub fn armed_len(&self) -> usize {
        self.armed.iter().map(|entry| entry.value().len()).sum()
    }
}

impl ChangeCapture for WatchHub {
    fn capture_data_change(&self, key: &str, value: &str) {
        let Some((_, ids)) = self.armed.remove(key) else {
            return;
        };
        debug!(key, watchers = ids.len(), "firing watches");
        for id in ids {
            self.fired.insert(id, value.to_owned());
        }
        self.wakeup.notify_waiters();
    }

    fn watch(&self, key: &str) -> Result<WatchResult, KvError> {
        let watch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.armed.entry(key.to_owned()).or_default().push(watch_id);
        debug!(key, watch_id, "armed watch");
        Ok(WatchResult { key: key.to_owned(), watch_id })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_watch_fires_once_with_value() {
        let hub = WatchHub::new();
        let w = hub.watch("k").expect("watch");
        assert_eq!(hub.armed_len(), 1);

        hub.capture_data_change("k", "v1");
        assert_eq!(hub.armed_len(), 0);
        assert_eq!(hub.take_fired(w.watch_id), Some("v1".into()));

        // One-shot: a later change does not re-fire.
        hub.capture_data_change("k", "v2");
        assert_eq!(hub.take_fired(w.watch_id), None);
    }

    #[test]
    fn test_unrelated_key_does_not_fire() {
        let hub = WatchHub::new();
        let w = hub.watch("k").expect("watch");
        hub.capture_data_change("other", "v");
        assert_eq!(hub.take_fired(w.watch_id), None);
        assert_eq!(hub.armed_len(), 1);
    }

    #[test]
    fn test_multiple_watchers_same_key() {
        let hub = WatchHub::new();
        let a = hub.watch("k").expect("watch");
        let b = hub.watch("k").expect("watch");
        hub.capture_data_change("k", "seen");
        assert_eq!(hub.take_fired(a.watch_id), Some("seen".into()));
        assert_eq!(hub.take_fired(b.watch_id), Some("seen".into()));
    }

    #[tokio::test]
    async fn test_wait_fired_wakes() {
        let hub = Arc::new(WatchHub::new());
        let w = hub.watch("k").expect("watch");

        let waiter = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.wait_fired(w.watch_id).await })
        };

        // Give the waiter a chance to park before firing.
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.capture_data_change("k", "gone");

        let value = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("join");
        assert_eq!(value, "gone");
    }
}
