//! The consensus-facing seam.
//!
//! TideKV does not implement consensus; it consumes one. A replica hands
//! the [`Consensus`] implementation opaque command bytes to order, and
//! receives the committed stream back as [`ApplyMsg`]s on a channel the
//! apply loop owns. Snapshot hand-off and log-footprint polling go through
//! the same trait.

/// Outcome of proposing a command to the consensus layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Log index the command will commit at, if this node stays leader.
    pub index: u64,
    /// Term the proposal was made in.
    pub term: u64,
    /// Whether this node believed itself leader at proposal time.
    pub is_leader: bool,
}

/// One message on the committed apply stream.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// A committed command to apply at `index`.
    Command {
        /// Commit index of the command.
        index: u64,
        /// Encoded `ServiceArgs`.
        data: Vec<u8>,
    },
    /// A compacted state the replica must install instead of replaying.
    Snapshot {
        /// Index the snapshot covers through.
        index: u64,
        /// Term of the last included entry.
        term: u64,
        /// Encoded evaluator state.
        data: Vec<u8>,
    },
}

/// Handle to the external consensus layer.
///
/// Implementations order commands across replicas and deliver them on the
/// apply channel in commit order, exactly once per replica per index.
pub trait Consensus: Send + Sync + 'static {
    /// Submits a command for ordering.
    ///
    /// Non-blocking in the consensus sense: returns the tentative index
    /// and leadership claim immediately; commitment is signaled later via
    /// the apply stream.
    fn propose(&self, command: Vec<u8>) -> Proposal;

    /// Hands a compacted state to the consensus layer so it can truncate
    /// its log up through `index`. The layer owns persisting it.
    fn snapshot(&self, index: u64, snapshot: Vec<u8>);

    /// Current footprint of the consensus log in bytes.
    fn state_size(&self) -> usize;
}
