//! Durable blob storage for TideKV replicas.
//!
//! A [`MmapPersister`] owns two memory-mapped files — the raft state blob
//! and the latest snapshot blob — and offers O(1) whole-blob reads and
//! writes. Files auto-resize (double when half full, halve at quarter
//! occupancy) and carry a trailing length footer that is the authoritative
//! payload length across restarts.

mod error;
mod region;

pub use error::{PersistError, Result};

use parking_lot::RwLock;
use tidekv_types::config::PersistConfig;

use crate::region::Region;

/// Number of reserved i64 metadata slots at the head of the raft file.
pub const RAFT_META_SLOTS: usize = 4;

/// Byte length of the reserved metadata head in the raft file.
pub const RAFT_META_LEN: usize = RAFT_META_SLOTS * 8;

/// Durable store for the raft-state and snapshot blobs.
///
/// One readers-writer lock covers both regions: blob reads and size polls
/// take the shared lock for their whole copy-out (a concurrent remap would
/// otherwise invalidate the mapping under them), writes and resizes take
/// the exclusive lock.
pub struct MmapPersister {
    inner: RwLock<Inner>,
}

struct Inner {
    raft: Region,
    snapshot: Region,
}

impl MmapPersister {
    /// Opens (or creates) the two backing files described by `config`.
    ///
    /// Fresh files are pre-allocated to the configured lengths with a zero
    /// footer (empty payload). Existing files larger than the configured
    /// length are kept as-is; shrinking them here could cut off a payload
    /// the footer still points at.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Io`] when a file cannot be opened, sized,
    /// or mapped. Persistence is load-bearing for the replica: callers
    /// treat this as fatal.
    pub fn open(config: &PersistConfig) -> Result<Self> {
        let raft = Region::open("raft", &config.raft_path, config.raft_file_len, RAFT_META_LEN)?;
        let snapshot =
            Region::open("snapshot", &config.snapshot_path, config.snapshot_file_len, 0)?;
        Ok(Self { inner: RwLock::new(Inner { raft, snapshot }) })
    }

    /// Copies out the current raft-state blob.
    pub fn read_raft_state(&self) -> Result<Vec<u8>> {
        self.inner.read().raft.read()
    }

    /// Copies out the current snapshot blob.
    pub fn read_snapshot(&self) -> Result<Vec<u8>> {
        self.inner.read().snapshot.read()
    }

    /// Current raft-state payload length, per the footer.
    pub fn raft_state_size(&self) -> usize {
        self.inner.read().raft.payload_len()
    }

    /// Current snapshot payload length, per the footer.
    pub fn snapshot_size(&self) -> usize {
        self.inner.read().snapshot.payload_len()
    }

    /// Durably replaces both blobs.
    ///
    /// Each region is written payload-first: payload copy, flush, footer,
    /// flush. A crash between the two flushes leaves the old footer over a
    /// partially-new payload, which reads as the old (bounded) length —
    /// never as torn new data of the new length.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Io`] on resize, remap, or flush failure.
    pub fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        inner.raft.write(state)?;
        inner.snapshot.write(snapshot)
    }

    /// Durably writes one reserved metadata slot of the raft file.
    ///
    /// # Panics
    ///
    /// Panics when `slot >= RAFT_META_SLOTS`; an out-of-range slot is a
    /// programmer error, not a runtime condition.
    pub fn persist_i64(&self, slot: usize, value: i64) -> Result<()> {
        assert!(slot < RAFT_META_SLOTS, "metadata slot {slot} out of range");
        self.inner.write().raft.write_meta_i64(slot, value)
    }

    /// Reads one reserved metadata slot of the raft file.
    ///
    /// # Panics
    ///
    /// Panics when `slot >= RAFT_META_SLOTS`.
    pub fn read_i64(&self, slot: usize) -> i64 {
        assert!(slot < RAFT_META_SLOTS, "metadata slot {slot} out of range");
        self.inner.read().raft.read_meta_i64(slot)
    }
}
