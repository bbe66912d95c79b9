//! The deterministic batch evaluator.
//!
//! `KvStore` owns the replicated state: the key→entry map and the
//! per-client acknowledgement map. The apply loop is the only mutator;
//! RPC handlers may run relaxed reads concurrently through
//! [`KvStore::eval_unlinearizable`]. Both maps are ordered so a snapshot
//! of the same logical state always serializes to the same bytes.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, warn};

use tidekv_types::error::{CodecSnafu, Result};
use tidekv_types::{
    ClientId, CmdArgs, ErrCode, EvalResult, KvEntry, Op, RequestId, ServiceArgs, codec,
};

use crate::clock::Clock;
use crate::watch::ChangeCapture;

/// Replicated state: everything that must be byte-identical across
/// replicas and everything a snapshot must capture.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KvState {
    /// Live entries. Expired entries may linger physically but are always
    /// observed as absent; the replicated paths remove them on contact.
    data: BTreeMap<String, KvEntry>,
    /// Highest request id applied per client. Monotonic; never trimmed.
    ack: BTreeMap<ClientId, RequestId>,
}

/// The KV evaluator.
pub struct KvStore {
    inner: RwLock<KvState>,
    /// Change-capture handler; write-once, before the apply loop starts.
    cdc: OnceLock<Arc<dyn ChangeCapture>>,
    clock: Clock,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    /// An empty store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Clock::wall())
    }

    /// An empty store on the given time source.
    pub fn with_clock(clock: Clock) -> Self {
        Self { inner: RwLock::new(KvState::default()), cdc: OnceLock::new(), clock }
    }

    /// Installs the change-capture handler.
    ///
    /// The handler is immutable once set; a second attach is ignored.
    pub fn attach_cdc(&self, handler: Arc<dyn ChangeCapture>) {
        if self.cdc.set(handler).is_err() {
            warn!("change-capture handler already attached, ignoring");
        }
    }

    /// Evaluates one batch; optionally returns a serialized snapshot of
    /// the state as of this batch.
    ///
    /// Duplicate batches (request id at or below the client's ack) skip
    /// every mutation and all change capture, but re-evaluate their GET
    /// commands against current state, so a retried read is fresh and a
    /// retried write is a no-op.
    ///
    /// # Errors
    ///
    /// Only snapshot serialization can fail; the caller treats that as
    /// fatal since a replica that cannot snapshot will outgrow its log.
    pub fn eval(
        &self,
        args: &ServiceArgs,
        should_snapshot: bool,
    ) -> Result<(EvalResult, Option<Vec<u8>>)> {
        let duplicate = self.check_and_ack(args);
        let mut reply = EvalResult::empty(args.info);
        let now = self.clock.now_ms();
        let mutate = !duplicate && args.is_mutating();

        let dump = if mutate {
            let mut st = self.inner.write();
            self.eval_mut(&mut st, &args.cmds, &mut reply, now);
            should_snapshot.then(|| codec::encode(&*st)).transpose().context(CodecSnafu)?
        } else if should_snapshot {
            // Snapshot requests take the exclusive lock even for reads.
            let mut st = self.inner.write();
            let expired = Self::eval_read_only(&st, &args.cmds, &mut reply, now);
            Self::gc_expired(&mut st, &expired, now);
            Some(codec::encode(&*st).context(CodecSnafu)?)
        } else {
            let st = self.inner.read();
            let expired = Self::eval_read_only(&st, &args.cmds, &mut reply, now);
            drop(st);
            // Lazy expiry on the read path: the entries were reported
            // absent above; upgrade briefly to remove them. Every replica
            // applies the same batch at the same logical time, so the
            // removals replicate.
            if !expired.is_empty() {
                let mut st = self.inner.write();
                Self::gc_expired(&mut st, &expired, now);
            }
            None
        };

        Ok((reply, dump))
    }

    /// Relaxed read path: shared lock, GET commands only, no consensus.
    ///
    /// Results may be stale with respect to the consensus log; clients
    /// that need linearizable reads go through the coordinator instead.
    pub fn eval_unlinearizable(&self, args: &ServiceArgs) -> EvalResult {
        let mut reply = EvalResult::empty(args.info);
        let st = self.inner.read();
        let now = self.clock.now_ms();
        for cmd in &args.cmds {
            if cmd.op != Op::Get {
                reply.err = Some(ErrCode::GetOnly);
                break;
            }
            // Relaxed reads never mutate: expired entries are reported
            // absent but their removal is left to the replicated path.
            let _ = Self::read_cmd(&st, cmd, &mut reply, now);
        }
        reply
    }

    /// Replaces the state from a serialized snapshot.
    ///
    /// An empty blob resets to the empty state (a fresh replica's
    /// persisted snapshot region reads as empty).
    ///
    /// # Errors
    ///
    /// A blob that fails to decode is fatal to the caller: the snapshot
    /// came through consensus, so local state can no longer be trusted.
    pub fn load_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let state = if bytes.is_empty() {
            KvState::default()
        } else {
            codec::decode(bytes).context(CodecSnafu)?
        };
        let mut st = self.inner.write();
        debug!(entries = state.data.len(), clients = state.ack.len(), "loaded snapshot");
        *st = state;
        Ok(())
    }

    /// Serializes the current state, as a snapshot would.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(&*self.inner.read()).context(CodecSnafu)
    }

    /// Whether an entry is physically present, expired or not.
    ///
    /// Observability helper (tests, admin tooling); reads bypass this.
    pub fn has_entry(&self, key: &str) -> bool {
        self.inner.read().data.contains_key(key)
    }

    /// Duplicate check-and-set against the ack map.
    ///
    /// Advances the client's ack when the request is new; never both
    /// rejects and advances.
    fn check_and_ack(&self, args: &ServiceArgs) -> bool {
        let info = args.info;
        let mut st = self.inner.write();
        match st.ack.get(&info.client_id) {
            Some(&latest) if latest >= info.request_id => {
                warn!(
                    client_id = info.client_id,
                    request_id = info.request_id,
                    acked = latest,
                    "duplicate request suppressed"
                );
                true
            }
            _ => {
                st.ack.insert(info.client_id, info.request_id);
                false
            }
        }
    }

    /// Evaluates a batch that may mutate, under the exclusive lock.
    fn eval_mut(&self, st: &mut KvState, cmds: &[CmdArgs], reply: &mut EvalResult, now: i64) {
        for cmd in cmds {
            match cmd.op {
                Op::Get => Self::read_cmd_mut(st, cmd, reply, now),
                Op::Put => {
                    let live_old = st.data.get(&cmd.key).filter(|e| !e.expired(now));
                    let changed = live_old.is_some_and(|e| e.data != cmd.value);
                    st.data.insert(cmd.key.clone(), KvEntry::new(cmd.value.clone(), cmd.ttl_ms));
                    if changed {
                        self.fire_cdc(&cmd.key, &cmd.value);
                    }
                }
                Op::Append => {
                    let changed = !cmd.value.is_empty();
                    // An expired entry is logically absent: the append
                    // starts fresh rather than resurrecting stale data.
                    if st.data.get(&cmd.key).is_some_and(|e| e.expired(now)) {
                        st.data.remove(&cmd.key);
                    }
                    let entry = st
                        .data
                        .entry(cmd.key.clone())
                        .and_modify(|e| {
                            e.data.push_str(&cmd.value);
                            e.ttl_ms = cmd.ttl_ms;
                        })
                        .or_insert_with(|| KvEntry::new(cmd.value.clone(), cmd.ttl_ms));
                    if changed {
                        let data = entry.data.clone();
                        self.fire_cdc(&cmd.key, &data);
                    }
                }
                Op::Delete => {
                    // Deleting an absent (or expired) key must not wake a
                    // watch.
                    if let Some(old) = st.data.remove(&cmd.key) {
                        if !old.expired(now) {
                            self.fire_cdc(&cmd.key, "");
                        }
                    }
                }
                Op::Watch => {
                    let Some(cdc) = self.cdc.get() else {
                        reply.err = Some(ErrCode::NoWatch);
                        return;
                    };
                    match cdc.watch(&cmd.key) {
                        Ok(watch) => reply.watches.push(watch),
                        // A failed registration aborts this command only.
                        Err(err) => reply.err = err.code().or(Some(ErrCode::Unexpected)),
                    }
                }
            }
        }
    }

    /// Evaluates the GET commands of a batch under any lock; mutating
    /// commands are skipped (duplicate batches reach here). Returns the
    /// expired keys encountered so the caller can remove them once it
    /// holds the exclusive lock.
    fn eval_read_only(
        st: &KvState,
        cmds: &[CmdArgs],
        reply: &mut EvalResult,
        now: i64,
    ) -> Vec<String> {
        let mut expired = Vec::new();
        for cmd in cmds {
            if cmd.op == Op::Get {
                expired.extend(Self::read_cmd(st, cmd, reply, now));
            }
        }
        expired
    }

    /// GET without mutating: expired entries are reported absent and
    /// returned to the caller for deferred removal.
    fn read_cmd(st: &KvState, cmd: &CmdArgs, reply: &mut EvalResult, now: i64) -> Vec<String> {
        let mut expired = Vec::new();
        if let Some(prefix) = cmd.scan_prefix() {
            for (key, entry) in Self::prefix_range(st, prefix) {
                if entry.expired(now) {
                    expired.push(key.clone());
                } else {
                    reply.data.insert(key.clone(), entry.data.clone());
                }
            }
            return expired;
        }
        match st.data.get(&cmd.key) {
            Some(entry) if entry.expired(now) => {
                expired.push(cmd.key.clone());
                reply.data.insert(cmd.key.clone(), String::new());
            }
            Some(entry) => {
                reply.data.insert(cmd.key.clone(), entry.data.clone());
            }
            None => {
                reply.data.insert(cmd.key.clone(), String::new());
            }
        }
        expired
    }

    /// Removes entries that are (still) expired at `now`.
    fn gc_expired(st: &mut KvState, keys: &[String], now: i64) {
        for key in keys {
            if st.data.get(key).is_some_and(|e| e.expired(now)) {
                debug!(key = %key, "expired entry removed on read");
                st.data.remove(key);
            }
        }
    }

    /// GET under the exclusive lock: expired entries are removed in pass.
    fn read_cmd_mut(st: &mut KvState, cmd: &CmdArgs, reply: &mut EvalResult, now: i64) {
        if let Some(prefix) = cmd.scan_prefix() {
            let mut dead = Vec::new();
            for (key, entry) in Self::prefix_range(st, prefix) {
                if entry.expired(now) {
                    dead.push(key.clone());
                } else {
                    reply.data.insert(key.clone(), entry.data.clone());
                }
            }
            for key in dead {
                debug!(key = %key, "expired entry removed during scan");
                st.data.remove(&key);
            }
            return;
        }
        match st.data.get(&cmd.key) {
            Some(entry) if entry.expired(now) => {
                debug!(key = %cmd.key, "expired entry removed on read");
                st.data.remove(&cmd.key);
                reply.data.insert(cmd.key.clone(), String::new());
            }
            Some(entry) => {
                reply.data.insert(cmd.key.clone(), entry.data.clone());
            }
            None => {
                reply.data.insert(cmd.key.clone(), String::new());
            }
        }
    }

    /// All entries whose key starts with `prefix`, in key order.
    fn prefix_range<'a>(
        st: &'a KvState,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a KvEntry)> {
        st.data.range(prefix.to_owned()..).take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Forwards a real value change to the attached handler, if any.
    fn fire_cdc(&self, key: &str, value: &str) {
        if let Some(cdc) = self.cdc.get() {
            cdc.capture_data_change(key, value);
        }
    }
}
