//! The TideKV command evaluator.
//!
//! This crate holds the deterministic core of a replica: the in-memory
//! key-value state with per-client acknowledgement tracking, the batch
//! evaluator the apply loop drives, and the change-capture seam with its
//! in-process one-shot watch hub.

mod clock;
mod store;
mod watch;

pub use clock::{Clock, ManualClock};
pub use store::KvStore;
pub use watch::{ChangeCapture, WatchHub};
