//! Per-index notification slots between the apply loop and coordinators.
//!
//! A fixed ring of one-shot cells keyed by `index % N`. The apply loop
//! deposits the reply for each committed index without ever blocking; a
//! coordinator awaiting that index takes the value at most once. Stale
//! values (abandoned by a timed-out coordinator, or left on a follower
//! where nobody waits) are simply overwritten by a later deposit or
//! drained by the next waiter on the same cell — the ring stays bounded
//! no matter how many indices pass through.
//!
//! Two live waiters only collide when their indices are `N` apart, which
//! with the default capacity means one of them is thousands of commits
//! stale and long past its timeout.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use tidekv_types::EvalResult;

/// Default number of cells in the ring.
pub const DEFAULT_SLOTS: usize = 1024;

struct Slot {
    /// Latest deposited reply and its index, if not yet consumed.
    cell: Mutex<Option<(u64, EvalResult)>>,
    wake: Notify,
}

/// Bounded table of per-index notification slots.
pub struct NotifyTable {
    slots: Vec<Slot>,
}

impl Default for NotifyTable {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

impl NotifyTable {
    /// A table with `capacity` cells.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "notification table needs at least one slot");
        Self {
            slots: (0..capacity)
                .map(|_| Slot { cell: Mutex::new(None), wake: Notify::new() })
                .collect(),
        }
    }

    fn slot(&self, index: u64) -> &Slot {
        &self.slots[(index % self.slots.len() as u64) as usize]
    }

    /// Deposits the reply for `index`, overwriting any stale value.
    ///
    /// Never blocks; called from the apply loop for every committed
    /// command whether or not anyone is waiting.
    pub fn deposit(&self, index: u64, reply: EvalResult) {
        let slot = self.slot(index);
        {
            let mut cell = slot.cell.lock();
            if let Some((stale, _)) = cell.replace((index, reply)) {
                debug!(index, stale, "overwrote stale notification");
            }
        }
        slot.wake.notify_waiters();
    }

    /// Awaits the reply deposited for exactly `index`.
    ///
    /// Values for other indices found in the cell are stale and are
    /// discarded. Callers bound this with a timeout; an abandoned wait
    /// leaves nothing behind.
    pub async fn wait(&self, index: u64) -> EvalResult {
        let slot = self.slot(index);
        loop {
            // Register before checking so a deposit racing this check
            // still wakes us.
            let mut notified = std::pin::pin!(slot.wake.notified());
            notified.as_mut().enable();
            {
                let mut cell = slot.cell.lock();
                match cell.take() {
                    Some((i, reply)) if i == index => return reply,
                    Some((stale, _)) => {
                        debug!(index, stale, "drained stale notification");
                    }
                    None => {}
                }
            }
            notified.await;
        }
    }
}
