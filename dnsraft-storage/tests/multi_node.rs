//! Multi-node cluster tests over the in-memory network.

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::TestCluster;
use dnsraft_common::error::StoreError;
use dnsraft_storage::NodeRole;

const SETTLE: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_three_node_replication() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(SETTLE).await;

    cluster
        .node(leader)
        .set("example.com._1", "example.com. 3600 IN A 1.2.3.4")
        .await
        .unwrap();

    // Read-your-write on the leader holds immediately.
    assert_eq!(
        cluster.node(leader).get("example.com._1").as_deref(),
        Some("example.com. 3600 IN A 1.2.3.4")
    );
    assert!(
        cluster
            .wait_for_value("example.com._1", Some("example.com. 3600 IN A 1.2.3.4"), SETTLE)
            .await
    );

    cluster.node(leader).delete("example.com._1").await.unwrap();
    assert!(cluster.wait_for_value("example.com._1", None, SETTLE).await);

    let status = cluster.node(leader).status().await.unwrap();
    assert_eq!(status.membership.len(), 3);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_writes_with_leader_hint() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(SETTLE).await;
    let follower = (leader + 1) % 3;

    // Give the follower a heartbeat to learn who leads.
    tokio::time::sleep(Duration::from_millis(100)).await;
    match cluster.node(follower).set("k", "v").await {
        Err(StoreError::NotLeader { leader: hint }) => {
            assert_eq!(hint.as_deref(), Some(cluster.addresses[leader].as_str()));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }
    assert_eq!(
        cluster.node(follower).leader().as_deref(),
        Some(cluster.addresses[leader].as_str())
    );
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_failover() {
    let mut cluster = TestCluster::new(3).await;
    let old_leader = cluster.wait_for_leader(SETTLE).await;
    cluster.node(old_leader).set("before", "1").await.unwrap();
    assert!(cluster.wait_for_value("before", Some("1"), SETTLE).await);

    cluster.stop_node(old_leader).await;
    let new_leader = cluster.wait_for_leader_except(Some(old_leader), SETTLE).await;
    assert_ne!(new_leader, old_leader);

    cluster.node(new_leader).set("after", "2").await.unwrap();
    assert!(cluster.wait_for_value("after", Some("2"), SETTLE).await);
    assert!(cluster.wait_for_value("before", Some("1"), SETTLE).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_leader_cannot_commit() {
    let mut cluster = TestCluster::new(3).await;
    let old_leader = cluster.wait_for_leader(SETTLE).await;
    cluster.network.isolate(&cluster.addresses[old_leader]);

    let new_leader = cluster.wait_for_leader_except(Some(old_leader), SETTLE).await;
    cluster.node(new_leader).set("zone", "majority").await.unwrap();

    // The stranded leader cannot reach a majority.
    let stale = cluster.node(old_leader).set("zone", "minority").await;
    assert!(stale.is_err());

    cluster.network.heal();
    assert!(cluster.wait_for_value("zone", Some("majority"), SETTLE).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stop_hands_leadership_over() {
    let mut cluster = TestCluster::new(3).await;
    let old_leader = cluster.wait_for_leader(SETTLE).await;
    let mut changes = cluster.node((old_leader + 1) % 3).leader_ch();

    cluster.stop_node(old_leader).await;

    // A transfer elects a successor well inside one election timeout.
    let new_leader = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Some(addr)) = changes.recv().await {
                if addr != cluster.addresses[old_leader] {
                    return addr;
                }
            }
        }
    })
    .await
    .expect("no new leader announced");
    assert!(cluster.addresses.contains(&new_leader));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remove_node() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(SETTLE).await;
    let removed = (leader + 1) % 3;
    let removed_id = cluster.addresses[removed].clone();

    cluster.node(leader).remove_node(&removed_id).await.unwrap();
    let status = cluster.node(leader).status().await.unwrap();
    assert_eq!(status.membership.len(), 2);
    assert!(!status.membership.contains(&removed_id));

    cluster.stop_node(removed).await;
    cluster.node(leader).set("still", "writable").await.unwrap();
    assert!(cluster.wait_for_value("still", Some("writable"), SETTLE).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_join_catches_up_from_snapshot() {
    let mut cluster = TestCluster::with_options(1, false, 8).await;
    for i in 0..30 {
        cluster
            .node(0)
            .set(format!("host{}.example.com._1", i), format!("10.0.0.{}", i))
            .await
            .unwrap();
    }
    let leader_status = cluster.node(0).status().await.unwrap();
    assert!(leader_status.snapshot_index > 0);

    let joined = cluster.add_node(None).await;
    cluster.join(joined).await;

    assert!(
        cluster
            .wait_for_value("host29.example.com._1", Some("10.0.0.29"), SETTLE)
            .await
    );
    assert_eq!(
        cluster.node(joined).get("host0.example.com._1").as_deref(),
        Some("10.0.0.0")
    );
    let status = cluster.node(joined).status().await.unwrap();
    assert!(status.snapshot_index > 0);
    assert_eq!(status.membership.len(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restart_recovers_from_disk() {
    let mut cluster = TestCluster::with_options(1, true, 8).await;
    for i in 0..20 {
        cluster
            .node(0)
            .set(format!("k{}", i), i.to_string())
            .await
            .unwrap();
    }
    cluster.node(0).delete("k3").await.unwrap();
    cluster.stop_node(0).await;

    cluster.restart_node(0).await;
    let leader = cluster
        .node(0)
        .wait_for_leader(SETTLE, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(leader, cluster.addresses[0]);

    for i in 0..20 {
        let expected = if i == 3 { None } else { Some(i.to_string()) };
        assert_eq!(cluster.node(0).get(&format!("k{}", i)), expected);
    }
    cluster.node(0).set("after-restart", "yes").await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_writes_all_commit() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(SETTLE).await;
    let store = cluster.node(leader);

    let (a, b, c, d) = tokio::join!(
        store.set("a.example.com._1", "a"),
        store.set("b.example.com._1", "b"),
        store.set("c.example.com._1", "c"),
        store.set("d.example.com._1", "d"),
    );
    for result in [a, b, c, d] {
        result.unwrap();
    }
    for name in ["a", "b", "c", "d"] {
        let key = format!("{}.example.com._1", name);
        assert!(cluster.wait_for_value(&key, Some(name), SETTLE).await);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_leader_steps_down() {
    let mut cluster = TestCluster::new(3).await;
    let old_leader = cluster.wait_for_leader(SETTLE).await;
    let old_addr = cluster.addresses[old_leader].clone();
    cluster.network.isolate(&old_addr);
    cluster.wait_for_leader_except(Some(old_leader), SETTLE).await;

    let stranded = cluster.node(old_leader);
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = stranded.status().await.unwrap();
        if status.role != NodeRole::Leader && stranded.leader().as_deref() != Some(old_addr.as_str()) {
            break;
        }
        assert!(Instant::now() < deadline, "isolated leader kept leading: {:?}", status.role);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(matches!(
        stranded.set("zone", "minority").await,
        Err(StoreError::NotLeader { .. })
    ));

    cluster.network.heal();
    cluster.shutdown().await;
}

/// Fails if two nodes have ever claimed leadership of the same term.
async fn record_leaders(cluster: &TestCluster, seen: &mut HashMap<u64, String>) {
    for (i, node) in cluster.running() {
        if let Ok(status) = node.status().await {
            if status.role == NodeRole::Leader {
                let first = seen
                    .entry(status.term)
                    .or_insert_with(|| cluster.addresses[i].clone());
                assert_eq!(
                    first, &cluster.addresses[i],
                    "two leaders in term {}",
                    status.term
                );
            }
        }
    }
}

#[tokio::test]
async fn test_at_most_one_leader_per_term() {
    let mut cluster = TestCluster::new(5).await;
    let mut seen = HashMap::new();

    for _ in 0..4 {
        let leader = cluster.wait_for_leader(SETTLE).await;
        cluster.network.isolate(&cluster.addresses[leader]);
        let until = Instant::now() + Duration::from_millis(800);
        while Instant::now() < until {
            record_leaders(&cluster, &mut seen).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cluster.network.heal();
    }

    cluster.wait_for_leader(SETTLE).await;
    record_leaders(&cluster, &mut seen).await;
    assert!(seen.len() >= 2, "expected several elections, saw {:?}", seen);
    cluster.shutdown().await;
}
