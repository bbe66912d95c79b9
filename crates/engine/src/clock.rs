//! Injectable time source.
//!
//! TTL expiry compares against `Clock::now_ms()`. Production uses the
//! wall clock; tests swap in a [`ManualClock`] so expiry is exact and
//! replicas under test observe identical time.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared handle to a millisecond time source.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> i64 + Send + Sync>);

impl Clock {
    /// Milliseconds since the Unix epoch from the system clock.
    pub fn wall() -> Self {
        Self(Arc::new(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0)
        }))
    }

    /// A manually driven clock starting at `start_ms`.
    pub fn manual(start_ms: i64) -> (Self, ManualClock) {
        let handle = ManualClock { now_ms: Arc::new(AtomicI64::new(start_ms)) };
        let source = handle.clone();
        (Self(Arc::new(move || source.now_ms.load(Ordering::SeqCst))), handle)
    }

    /// The current time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::wall()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clock").field(&self.now_ms()).finish()
    }
}

/// Controller for a [`Clock::manual`] time source.
#[derive(Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    /// Advances time by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let (clock, handle) = Clock::manual(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        handle.advance(25);
        assert_eq!(clock.now_ms(), 1_025);
        handle.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_wall_clock_is_monotonic_enough() {
        let clock = Clock::wall();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000, "wall clock should be past 2020");
    }
}
