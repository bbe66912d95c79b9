//! The replica server: apply loop and request coordinator.
//!
//! One `KvServer` sits between the consensus layer and the evaluator. Its
//! apply loop is the single consumer of the committed stream and the only
//! driver of linearizable evaluation; its coordinator surface is what RPC
//! handlers call, mapping each client request onto the index consensus
//! assigned it and waiting for the apply loop's reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use snafu::ResultExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tidekv_engine::KvStore;
use tidekv_types::config::ServerConfig;
use tidekv_types::error::{CodecSnafu, Result};
use tidekv_types::{CmdArgs, ErrCode, EvalResult, KvError, RequestInfo, ServiceArgs, codec};

use crate::consensus::{ApplyMsg, Consensus};
use crate::notify::NotifyTable;

/// A replica's server half: apply loop plus coordinator.
pub struct KvServer {
    consensus: Arc<dyn Consensus>,
    store: Arc<KvStore>,
    notify: NotifyTable,
    config: ServerConfig,
    /// Snapshot state machine: false = IDLE, true = SNAPSHOTTING. Only
    /// the CAS transitions in `try_start_snapshot` and the apply loop are
    /// legal.
    in_snapshot: AtomicBool,
}

impl KvServer {
    /// Builds the server and spawns its apply loop over `apply_rx`.
    ///
    /// The loop runs until the consensus layer closes the channel. It is
    /// the only task that drives linearizable evaluation; everything else
    /// reaches the store through [`KvServer::service_call`] or the relaxed
    /// read path.
    pub fn start(
        consensus: Arc<dyn Consensus>,
        store: Arc<KvStore>,
        config: ServerConfig,
        apply_rx: UnboundedReceiver<ApplyMsg>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let server = Arc::new(Self {
            consensus,
            store,
            notify: NotifyTable::default(),
            config,
            in_snapshot: AtomicBool::new(false),
        });
        let handle = tokio::spawn(Arc::clone(&server).run_apply(apply_rx));
        (server, handle)
    }

    /// The evaluator this server drives.
    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Apply loop
    // ------------------------------------------------------------------

    /// Consumes the committed stream.
    ///
    /// Panics are deliberate here: an undecodable committed command or a
    /// broken snapshot-flag transition means replicas are diverging, and
    /// a dead replica is strictly better than a wrong one.
    async fn run_apply(self: Arc<Self>, mut apply_rx: UnboundedReceiver<ApplyMsg>) {
        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Command { index, data } => self.apply_command(index, &data),
                ApplyMsg::Snapshot { index, term, data } => {
                    info!(index, term, bytes = data.len(), "installing delivered snapshot");
                    // The consensus layer owns persisting what it
                    // delivered; only the in-memory state changes here.
                    self.store
                        .load_snapshot(&data)
                        .unwrap_or_else(|e| panic!("fatal: snapshot at index {index} undecodable: {e}"));
                }
            }
        }
        debug!("apply channel closed, apply loop exiting");
    }

    fn apply_command(&self, index: u64, data: &[u8]) {
        let args: ServiceArgs = codec::decode(data)
            .unwrap_or_else(|e| panic!("fatal: committed command at index {index} undecodable: {e}"));
        debug!(index, client_id = args.info.client_id, request_id = args.info.request_id, "applying command");

        let should_snapshot = self.try_start_snapshot();
        let (reply, dump) = self
            .store
            .eval(&args, should_snapshot)
            .unwrap_or_else(|e| panic!("fatal: evaluation at index {index} failed: {e}"));

        if should_snapshot {
            let dump = dump.unwrap_or_else(|| panic!("fatal: requested snapshot missing at index {index}"));
            info!(index, bytes = dump.len(), "handing snapshot to consensus");
            self.consensus.snapshot(index, dump);
            let released = self
                .in_snapshot
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !released {
                panic!("fatal: snapshot flag released while idle");
            }
        }

        self.notify.deposit(index, reply);
    }

    /// Snapshot trigger policy.
    ///
    /// Fires when enabled, the log has outgrown 9/10 of the budget (the
    /// headroom covers log growth while the snapshot is cut), and no
    /// other snapshot is in flight. Winning the CAS commits this call to
    /// delivering a snapshot and releasing the flag.
    fn try_start_snapshot(&self) -> bool {
        if self.config.max_raft_state == -1 {
            return false;
        }
        let size = self.consensus.state_size();
        if size as i64 <= self.config.max_raft_state * 9 / 10 {
            return false;
        }
        let armed = self
            .in_snapshot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if armed {
            debug!(size, budget = self.config.max_raft_state, "snapshot triggered");
        }
        armed
    }

    // ------------------------------------------------------------------
    // Request coordinator
    // ------------------------------------------------------------------

    /// Proposes a batch and waits for the apply loop's reply.
    ///
    /// # Errors
    ///
    /// - [`KvError::WrongLeader`] when this node is not leader, or when a
    ///   different command committed at the awaited index (leadership
    ///   changed underneath the request).
    /// - [`KvError::Timeout`] when no reply arrives in time; the client
    ///   may retry anywhere, deduplication keeps the retry safe.
    pub async fn service_call(&self, args: ServiceArgs) -> Result<EvalResult> {
        let command = codec::encode(&args).context(CodecSnafu)?;
        let proposal = self.consensus.propose(command);
        if !proposal.is_leader {
            return Err(KvError::WrongLeader);
        }
        debug!(
            index = proposal.index,
            term = proposal.term,
            client_id = args.info.client_id,
            request_id = args.info.request_id,
            "proposed"
        );

        let wait = self.notify.wait(proposal.index);
        let reply = match timeout(self.propose_timeout(), wait).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(index = proposal.index, "timed out waiting for apply");
                return Err(KvError::Timeout);
            }
        };

        // A different request at our index means another leader won it.
        if reply.info != args.info {
            warn!(
                index = proposal.index,
                got_client = reply.info.client_id,
                got_request = reply.info.request_id,
                "reply belongs to a different request"
            );
            return Err(KvError::WrongLeader);
        }
        Ok(reply)
    }

    /// Linearizable single-key read.
    ///
    /// # Errors
    ///
    /// [`KvError::KeyNotFound`] when the key has no live entry, plus the
    /// coordinator errors of [`KvServer::service_call`].
    pub async fn get(&self, key: &str, info: RequestInfo) -> Result<String> {
        let reply = self.service_call(ServiceArgs::single(info, CmdArgs::get(key))).await?;
        if let Some(code) = reply.err {
            return Err(code.into());
        }
        match reply.data.get(key) {
            Some(value) if !value.is_empty() => Ok(value.clone()),
            _ => Err(KvError::KeyNotFound),
        }
    }

    /// Linearizable write of `value` under `key`.
    ///
    /// # Errors
    ///
    /// Coordinator errors of [`KvServer::service_call`].
    pub async fn put(&self, key: &str, value: &str, ttl_ms: i64, info: RequestInfo) -> Result<()> {
        self.mutate(CmdArgs::put(key, value, ttl_ms), info).await
    }

    /// Linearizable append of `value` onto `key`.
    ///
    /// # Errors
    ///
    /// Coordinator errors of [`KvServer::service_call`].
    pub async fn append(
        &self,
        key: &str,
        value: &str,
        ttl_ms: i64,
        info: RequestInfo,
    ) -> Result<()> {
        self.mutate(CmdArgs::append(key, value, ttl_ms), info).await
    }

    /// Linearizable removal of `key`.
    ///
    /// # Errors
    ///
    /// Coordinator errors of [`KvServer::service_call`].
    pub async fn delete(&self, key: &str, info: RequestInfo) -> Result<()> {
        self.mutate(CmdArgs::delete(key), info).await
    }

    /// Relaxed read path: bypasses consensus, GET commands only.
    ///
    /// May return stale data; clients wanting linearizable answers use
    /// [`KvServer::service_call`] instead.
    pub fn get_relaxed(&self, args: &ServiceArgs) -> EvalResult {
        self.store.eval_unlinearizable(args)
    }

    async fn mutate(&self, cmd: CmdArgs, info: RequestInfo) -> Result<()> {
        let reply = self.service_call(ServiceArgs::single(info, cmd)).await?;
        match reply.err {
            None => Ok(()),
            // KeyNotFound is not an error for blind writes.
            Some(ErrCode::KeyNotFound) => Ok(()),
            Some(code) => Err(code.into()),
        }
    }

    fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.config.propose_timeout_ms)
    }
}
