//! The replicated command model.
//!
//! Everything in this module crosses either the consensus log or the
//! snapshot stream, so every type derives `Serialize`/`Deserialize` and is
//! encoded with the codec in [`crate::codec`]. Variant and field order are
//! part of the on-disk format; append, never reorder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrCode;

/// Client identifier, unique per client session.
pub type ClientId = i64;

/// Per-client request sequence number, monotonically increasing.
pub type RequestId = i64;

/// Identity of one client request.
///
/// Two requests carrying the same pair are duplicates: the second (and any
/// later) submission must not mutate replicated state a second time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Issuing client.
    pub client_id: ClientId,
    /// Sequence number within that client.
    pub request_id: RequestId,
}

impl RequestInfo {
    /// Creates a request identity.
    pub const fn new(client_id: ClientId, request_id: RequestId) -> Self {
        Self { client_id, request_id }
    }
}

/// A single key-value operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Read a key, or all keys under a prefix when the key ends in `*`.
    Get,
    /// Replace the entry for a key.
    Put,
    /// Concatenate onto the entry for a key, creating it if absent.
    Append,
    /// Remove the entry for a key.
    Delete,
    /// Register a one-shot watch on a key.
    Watch,
}

/// One command within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdArgs {
    /// The operation to perform.
    pub op: Op,
    /// Target key. For `Get`, a trailing `*` requests a prefix scan.
    pub key: String,
    /// Value for `Put`/`Append`; ignored otherwise.
    pub value: String,
    /// Absolute expiry in milliseconds since epoch; `0` means no expiry.
    pub ttl_ms: i64,
}

impl CmdArgs {
    /// A read of `key`.
    pub fn get(key: impl Into<String>) -> Self {
        Self { op: Op::Get, key: key.into(), value: String::new(), ttl_ms: 0 }
    }

    /// A put of `value` under `key` with the given expiry.
    pub fn put(key: impl Into<String>, value: impl Into<String>, ttl_ms: i64) -> Self {
        Self { op: Op::Put, key: key.into(), value: value.into(), ttl_ms }
    }

    /// An append of `value` onto `key` with the given expiry.
    pub fn append(key: impl Into<String>, value: impl Into<String>, ttl_ms: i64) -> Self {
        Self { op: Op::Append, key: key.into(), value: value.into(), ttl_ms }
    }

    /// A delete of `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self { op: Op::Delete, key: key.into(), value: String::new(), ttl_ms: 0 }
    }

    /// A one-shot watch on `key`.
    pub fn watch(key: impl Into<String>) -> Self {
        Self { op: Op::Watch, key: key.into(), value: String::new(), ttl_ms: 0 }
    }

    /// Whether this command requires the evaluator's exclusive lock.
    ///
    /// Everything except `Get` mutates: writes touch the data map, and
    /// `Watch` registers state in the change-capture hub.
    pub fn is_mutating(&self) -> bool {
        !matches!(self.op, Op::Get)
    }

    /// For a `Get` whose key is `P*` with a non-empty `P`, the prefix `P`.
    ///
    /// A bare `"*"` key is an exact-match read of the literal key `*`, not
    /// a scan of the whole store.
    pub fn scan_prefix(&self) -> Option<&str> {
        if self.op == Op::Get && self.key.len() > 1 && self.key.ends_with('*') {
            Some(&self.key[..self.key.len() - 1])
        } else {
            None
        }
    }
}

/// An ordered command batch, applied as a single atomic unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceArgs {
    /// Identity used for per-client deduplication.
    pub info: RequestInfo,
    /// Commands, evaluated in order.
    pub cmds: Vec<CmdArgs>,
}

impl ServiceArgs {
    /// A batch of one command.
    pub fn single(info: RequestInfo, cmd: CmdArgs) -> Self {
        Self { info, cmds: vec![cmd] }
    }

    /// Whether any command in the batch requires the exclusive lock.
    pub fn is_mutating(&self) -> bool {
        self.cmds.iter().any(CmdArgs::is_mutating)
    }
}

/// A stored value together with its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KvEntry {
    /// The value bytes (UTF-8 in this store).
    pub data: String,
    /// Absolute expiry in milliseconds since epoch; `0` means no expiry.
    pub ttl_ms: i64,
}

impl KvEntry {
    /// Creates an entry.
    pub fn new(data: impl Into<String>, ttl_ms: i64) -> Self {
        Self { data: data.into(), ttl_ms }
    }

    /// Whether the entry has expired at `now_ms`.
    pub fn expired(&self, now_ms: i64) -> bool {
        self.ttl_ms != 0 && self.ttl_ms < now_ms
    }
}

/// Handle returned by a successful `Watch` registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResult {
    /// The watched key.
    pub key: String,
    /// Hub-assigned identifier used to collect the fired value.
    pub watch_id: u64,
}

/// Reply produced by evaluating one [`ServiceArgs`] batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalResult {
    /// First non-recoverable error hit while evaluating, if any.
    pub err: Option<ErrCode>,
    /// Read results: matching key to value. Exact reads report the key
    /// even when absent (with an empty value); prefix scans report only
    /// the live matches.
    pub data: BTreeMap<String, String>,
    /// Echo of the request identity, used by the coordinator to detect a
    /// different command committed at the same index.
    pub info: RequestInfo,
    /// Watches registered by this batch, in command order.
    pub watches: Vec<WatchResult>,
}

impl EvalResult {
    /// An empty, successful reply for `info`.
    pub fn empty(info: RequestInfo) -> Self {
        Self { info, ..Default::default() }
    }

    /// Whether evaluation completed without error.
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    /// The wire error string: `"OK"` on success, else the stable code.
    pub fn wire_err(&self) -> &'static str {
        match self.err {
            None => "OK",
            Some(code) => code.wire(),
        }
    }
}
