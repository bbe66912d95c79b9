//! The TideKV replica server.
//!
//! Wires the consensus layer to the evaluator: a single-threaded apply
//! loop consumes the committed stream, the coordinator maps client
//! requests onto committed indices, and the snapshot policy keeps the
//! consensus log bounded. Consensus itself is external; this crate only
//! defines the seam it plugs into.

mod consensus;
mod notify;
mod server;

pub use consensus::{ApplyMsg, Consensus, Proposal};
pub use notify::{DEFAULT_SLOTS, NotifyTable};
pub use server::KvServer;
