//! End-to-end replication tests over the in-process cluster.
//!
//! Every write goes through the leader's coordinator, fans out on the
//! shared log, and is applied independently by each replica. The tests
//! assert the replicated invariants: identical state everywhere,
//! at-most-once mutations, bounded log via snapshots, and snapshot-based
//! catch-up for late joiners.

mod common;

use common::{TestCluster, wait_until};
use tidekv_types::config::ServerConfig;
use tidekv_types::{CmdArgs, KvError, RequestInfo, ServiceArgs};

fn config() -> ServerConfig {
    ServerConfig { max_raft_state: -1, propose_timeout_ms: 1_000 }
}

fn info(client: i64, req: i64) -> RequestInfo {
    RequestInfo::new(client, req)
}

/// True once both stores serialize to the same bytes.
fn converged(a: &common::ClusterReplica, b: &common::ClusterReplica) -> bool {
    a.server.store().snapshot_bytes().expect("bytes")
        == b.server.store().snapshot_bytes().expect("bytes")
}

#[tokio::test]
async fn test_write_read_cycle() {
    let cluster = TestCluster::new();
    let leader = cluster.add_replica(true, config());
    let follower = cluster.add_replica(false, config());

    leader.server.put("a", "1", 0, info(1, 1)).await.expect("put");
    assert_eq!(leader.server.get("a", info(1, 2)).await.expect("get"), "1");

    wait_until(|| converged(&leader, &follower)).await;
    let reply = follower
        .server
        .get_relaxed(&ServiceArgs::single(info(9, 1), CmdArgs::get("a")));
    assert_eq!(reply.data.get("a").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn test_get_missing_key_is_not_found() {
    let cluster = TestCluster::new();
    let leader = cluster.add_replica(true, config());

    let err = leader.server.get("ghost", info(1, 1)).await.expect_err("missing");
    assert!(matches!(err, KvError::KeyNotFound));
    assert_eq!(err.to_string(), "Errkeynotfound");
}

#[tokio::test]
async fn test_follower_rejects_writes() {
    let cluster = TestCluster::new();
    let _leader = cluster.add_replica(true, config());
    let follower = cluster.add_replica(false, config());

    let err = follower.server.put("a", "1", 0, info(1, 1)).await.expect_err("not leader");
    assert!(matches!(err, KvError::WrongLeader));
}

#[tokio::test]
async fn test_duplicate_retry_applies_once() {
    let cluster = TestCluster::new();
    let leader = cluster.add_replica(true, config());
    let follower = cluster.add_replica(false, config());

    let retried = info(1, 1);
    leader.server.append("k", "x", 0, retried).await.expect("append");
    // The client re-submits after a presumed timeout; same identity.
    leader.server.append("k", "x", 0, retried).await.expect("retry");

    assert_eq!(leader.server.get("k", info(1, 2)).await.expect("get"), "x");
    wait_until(|| converged(&leader, &follower)).await;
}

#[tokio::test]
async fn test_ttl_expires_across_cluster() {
    let cluster = TestCluster::new();
    let leader = cluster.add_replica(true, config());

    let deadline = 1_000_000 + 10;
    leader.server.put("a", "1", deadline, info(1, 1)).await.expect("put");
    assert_eq!(leader.server.get("a", info(1, 2)).await.expect("get"), "1");

    cluster.clock().advance(20);
    let err = leader.server.get("a", info(1, 3)).await.expect_err("expired");
    assert!(matches!(err, KvError::KeyNotFound));
    // The expired entry was removed, not just hidden.
    assert!(!leader.server.store().has_entry("a"));
}

#[tokio::test]
async fn test_prefix_scan_through_coordinator() {
    let cluster = TestCluster::new();
    let leader = cluster.add_replica(true, config());

    let batch = ServiceArgs {
        info: info(1, 1),
        cmds: vec![
            CmdArgs::put("users/alice", "A", 0),
            CmdArgs::put("users/bob", "B", 0),
            CmdArgs::put("other", "X", 0),
        ],
    };
    leader.server.service_call(batch).await.expect("seed");

    let reply = leader
        .server
        .service_call(ServiceArgs::single(info(1, 2), CmdArgs::get("users/*")))
        .await
        .expect("scan");
    assert_eq!(reply.data.len(), 2);
    assert_eq!(reply.data.get("users/alice").map(String::as_str), Some("A"));
    assert_eq!(reply.data.get("users/bob").map(String::as_str), Some("B"));
}

#[tokio::test]
async fn test_watch_fires_on_replicated_change() {
    let cluster = TestCluster::new();
    let leader = cluster.add_replica(true, config());

    let reply = leader
        .server
        .service_call(ServiceArgs::single(info(1, 1), CmdArgs::watch("w")))
        .await
        .expect("watch");
    let watch = reply.watches.first().expect("handle").clone();

    leader.server.put("w", "first", 0, info(1, 2)).await.expect("put");
    // Creation is not a change; the watch stays armed.
    assert_eq!(leader.hub.take_fired(watch.watch_id), None);

    leader.server.put("w", "second", 0, info(1, 3)).await.expect("put");
    let fired = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        leader.hub.wait_fired(watch.watch_id),
    )
    .await
    .expect("watch must fire");
    assert_eq!(fired, "second");
}

#[tokio::test]
async fn test_determinism_across_three_replicas() {
    let cluster = TestCluster::new();
    let leader = cluster.add_replica(true, config());
    let follower_b = cluster.add_replica(false, config());
    let follower_c = cluster.add_replica(false, config());

    for i in 0i64..60 {
        let key = format!("k{}", i % 5);
        let cmd = match i % 4 {
            0 => CmdArgs::put(key, format!("v{i}"), 0),
            1 => CmdArgs::append(key, "+", 0),
            2 => CmdArgs::delete(key),
            _ => CmdArgs::get(format!("k{}", i % 3)),
        };
        leader
            .server
            .service_call(ServiceArgs::single(info(i % 3, i / 3 + 1), cmd))
            .await
            .expect("apply");
    }

    wait_until(|| converged(&leader, &follower_b) && converged(&leader, &follower_c)).await;
    assert_eq!(
        follower_b.server.store().snapshot_bytes().expect("b"),
        follower_c.server.store().snapshot_bytes().expect("c"),
    );
}

#[tokio::test]
async fn test_snapshot_bounds_log_and_bootstraps_late_replica() {
    let cluster = TestCluster::new();
    let max_raft_state = 2_000;
    let snapshotting = ServerConfig { max_raft_state, propose_timeout_ms: 1_000 };
    let leader = cluster.add_replica(true, snapshotting.clone());

    for i in 1i64..=100 {
        let key = format!("key-{:03}", i % 20);
        leader.server.put(&key, &format!("value-{i}"), 0, info(1, i)).await.expect("put");
    }

    // The trigger fired at least once and compacted the shared log.
    wait_until(|| cluster.snapshot_index().is_some()).await;
    assert!(
        cluster.log_size() <= max_raft_state as usize,
        "log footprint {} exceeds budget {max_raft_state}",
        cluster.log_size()
    );

    // A replica joining now is fed the snapshot plus the retained suffix.
    let late = cluster.add_replica(false, snapshotting);
    wait_until(|| converged(&leader, &late)).await;
    for i in 0i64..20 {
        let key = format!("key-{i:03}");
        let reply = late
            .server
            .get_relaxed(&ServiceArgs::single(info(9, i + 1), CmdArgs::get(key.as_str())));
        let expect = leader
            .server
            .get_relaxed(&ServiceArgs::single(info(8, i + 1), CmdArgs::get(key.as_str())));
        assert_eq!(reply.data, expect.data, "replica diverged on {key}");
    }
}
