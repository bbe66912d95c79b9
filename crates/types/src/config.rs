//! Configuration types for TideKV.
//!
//! Plain serde structs with defaults; loading from TOML/env is the
//! embedding daemon's concern and stays outside this workspace.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default coordinator wait for an applied reply.
pub const DEFAULT_PROPOSE_TIMEOUT_MS: u64 = 3_000;

/// Default pre-allocated length for both persister files (1 MiB).
pub const DEFAULT_FILE_LEN: u64 = 1 << 20;

/// Server-side replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Snapshot when the raft log footprint exceeds 9/10 of this many
    /// bytes; `-1` disables snapshotting entirely.
    pub max_raft_state: i64,
    /// How long the coordinator waits for the apply loop before giving
    /// the client `ErrTimeout`.
    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { max_raft_state: -1, propose_timeout_ms: DEFAULT_PROPOSE_TIMEOUT_MS }
    }
}

fn default_propose_timeout_ms() -> u64 {
    DEFAULT_PROPOSE_TIMEOUT_MS
}

/// On-disk layout for the persister's two files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Path of the raft-state file.
    pub raft_path: PathBuf,
    /// Path of the snapshot file.
    pub snapshot_path: PathBuf,
    /// Initial length the raft-state file is pre-allocated to.
    #[serde(default = "default_file_len")]
    pub raft_file_len: u64,
    /// Initial length the snapshot file is pre-allocated to.
    #[serde(default = "default_file_len")]
    pub snapshot_file_len: u64,
}

impl PersistConfig {
    /// Both files under `dir` with the default pre-allocation.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            raft_path: dir.join("raft.state"),
            snapshot_path: dir.join("kv.snapshot"),
            raft_file_len: DEFAULT_FILE_LEN,
            snapshot_file_len: DEFAULT_FILE_LEN,
        }
    }
}

fn default_file_len() -> u64 {
    DEFAULT_FILE_LEN
}
