//! Persister error type.

use snafu::{Location, Snafu};

/// Result alias for persister operations.
pub type Result<T, E = PersistError> = std::result::Result<T, E>;

/// Errors raised by the durable blob store.
///
/// Every variant is fatal for the replica: a node that cannot persist or
/// re-read its raft state must not keep voting or applying.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersistError {
    /// Underlying file I/O or mmap failure.
    #[snafu(display("persist I/O error on {name} file at {location}: {source}"))]
    Io {
        /// Which region failed ("raft" or "snapshot").
        name: &'static str,
        /// The underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// The length footer points outside the mapped file.
    #[snafu(display("{name} file corrupted: footer length {len} exceeds capacity {capacity}"))]
    Corrupted {
        /// Which region failed.
        name: &'static str,
        /// Footer payload length.
        len: u64,
        /// Usable payload capacity of the file.
        capacity: u64,
    },
}
