//! In-process consensus harnesses for server integration tests.
//!
//! `MockConsensus` is a hand-cranked double: proposals are recorded and
//! the test feeds the apply channel itself, so coordinator edge cases
//! (timeouts, mismatched replies) are exact. `TestCluster` is a small
//! single-leader consensus: proposals append to a shared log and fan out
//! to every replica's apply channel in commit order, with snapshot
//! hand-off truncating the log the way a real layer would.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};

use tidekv_engine::{Clock, KvStore, ManualClock, WatchHub};
use tidekv_server::{ApplyMsg, Consensus, KvServer, Proposal};
use tidekv_types::config::ServerConfig;

// ---------------------------------------------------------------------------
// MockConsensus
// ---------------------------------------------------------------------------

/// Consensus double that records everything and applies nothing.
#[derive(Default)]
pub struct MockConsensus {
    pub leader: AtomicBool,
    next_index: AtomicU64,
    pub log_size: AtomicUsize,
    /// Recorded `propose` calls: (assigned index, command bytes).
    pub proposed: Mutex<Vec<(u64, Vec<u8>)>>,
    /// Recorded `snapshot` calls: (index, snapshot bytes).
    pub snapshots: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl MockConsensus {
    pub fn leading() -> Self {
        let mock = Self { next_index: AtomicU64::new(1), ..Default::default() };
        mock.leader.store(true, Ordering::SeqCst);
        mock
    }

    pub fn follower() -> Self {
        Self { next_index: AtomicU64::new(1), ..Default::default() }
    }
}

impl Consensus for MockConsensus {
    fn propose(&self, command: Vec<u8>) -> Proposal {
        if !self.leader.load(Ordering::SeqCst) {
            return Proposal { index: 0, term: 0, is_leader: false };
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.log_size.fetch_add(command.len(), Ordering::SeqCst);
        self.proposed.lock().push((index, command));
        Proposal { index, term: 1, is_leader: true }
    }

    fn snapshot(&self, index: u64, snapshot: Vec<u8>) {
        self.snapshots.lock().push((index, snapshot));
        // Pretend the log compacts completely.
        self.log_size.store(0, Ordering::SeqCst);
    }

    fn state_size(&self) -> usize {
        self.log_size.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// TestCluster
// ---------------------------------------------------------------------------

struct ClusterLog {
    next_index: u64,
    /// Retained entries: (index, command bytes).
    entries: Vec<(u64, Vec<u8>)>,
    /// Latest compacted state: (covers-through index, term, bytes).
    latest_snapshot: Option<(u64, u64, Vec<u8>)>,
    /// Apply channels of every replica, in join order.
    feeds: Vec<UnboundedSender<ApplyMsg>>,
}

struct ClusterInner {
    log: Mutex<ClusterLog>,
}

/// A deterministic single-leader consensus shared by all replicas.
pub struct TestCluster {
    inner: Arc<ClusterInner>,
    clock: Clock,
    clock_handle: ManualClock,
}

/// One replica's handle into the cluster log.
pub struct ClusterMember {
    inner: Arc<ClusterInner>,
    is_leader: AtomicBool,
}

/// A started replica: its server plus the watch hub wired to its store.
pub struct ClusterReplica {
    pub server: Arc<KvServer>,
    pub hub: Arc<WatchHub>,
}

impl Consensus for ClusterMember {
    fn propose(&self, command: Vec<u8>) -> Proposal {
        if !self.is_leader.load(Ordering::SeqCst) {
            return Proposal { index: 0, term: 0, is_leader: false };
        }
        let mut log = self.inner.log.lock();
        let index = log.next_index;
        log.next_index += 1;
        log.entries.push((index, command.clone()));
        for feed in &log.feeds {
            let _ = feed.send(ApplyMsg::Command { index, data: command.clone() });
        }
        Proposal { index, term: 1, is_leader: true }
    }

    fn snapshot(&self, index: u64, snapshot: Vec<u8>) {
        let mut log = self.inner.log.lock();
        log.entries.retain(|(i, _)| *i > index);
        log.latest_snapshot = Some((index, 1, snapshot));
    }

    fn state_size(&self) -> usize {
        self.inner.log.lock().entries.iter().map(|(_, data)| data.len()).sum()
    }
}

impl TestCluster {
    /// An empty cluster on a manual clock starting at 1_000_000 ms.
    pub fn new() -> Self {
        init_tracing();
        let (clock, clock_handle) = Clock::manual(1_000_000);
        Self {
            inner: Arc::new(ClusterInner {
                log: Mutex::new(ClusterLog {
                    next_index: 1,
                    entries: Vec::new(),
                    latest_snapshot: None,
                    feeds: Vec::new(),
                }),
            }),
            clock,
            clock_handle,
        }
    }

    /// The shared manual clock, so tests can expire TTLs precisely.
    pub fn clock(&self) -> &ManualClock {
        &self.clock_handle
    }

    /// Adds a replica and starts its server.
    ///
    /// A replica joining after compaction receives the latest snapshot
    /// first, then the retained log suffix — the same catch-up a real
    /// consensus layer performs.
    pub fn add_replica(&self, leader: bool, config: ServerConfig) -> ClusterReplica {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut log = self.inner.log.lock();
            if let Some((index, term, data)) = log.latest_snapshot.clone() {
                let _ = tx.send(ApplyMsg::Snapshot { index, term, data });
            }
            for (index, data) in log.entries.clone() {
                let _ = tx.send(ApplyMsg::Command { index, data });
            }
            log.feeds.push(tx);
        }

        let member = Arc::new(ClusterMember {
            inner: Arc::clone(&self.inner),
            is_leader: AtomicBool::new(leader),
        });
        let store = Arc::new(KvStore::with_clock(self.clock.clone()));
        let hub = Arc::new(WatchHub::new());
        store.attach_cdc(hub.clone());
        let (server, _handle) = KvServer::start(member, store, config, rx);
        ClusterReplica { server, hub }
    }

    /// Bytes currently retained in the shared log.
    pub fn log_size(&self) -> usize {
        self.inner.log.lock().entries.iter().map(|(_, data)| data.len()).sum()
    }

    /// Index covered by the latest compacted snapshot, if any.
    pub fn snapshot_index(&self) -> Option<u64> {
        self.inner.log.lock().latest_snapshot.as_ref().map(|(index, _, _)| *index)
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits until `predicate` holds or the deadline passes.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not reached within deadline");
}

/// Installs the test tracing subscriber once per process.
///
/// Run with `RUST_LOG=tidekv_server=debug` to see apply-loop activity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
