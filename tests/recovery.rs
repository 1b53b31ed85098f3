//! Restart replay, snapshots and lagging followers

mod common;

use common::{addr, eventually, fast_options, TestCluster};
use std::time::Duration;
use tidemaster::common::RaftOptions;
use tidemaster::topology::Command;

#[tokio::test]
async fn full_restart_replays_log() {
    let mut cluster = TestCluster::start(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(3)).await;
    for vid in 1..=5 {
        cluster
            .node(leader)
            .propose(Command::max_volume_id(vid))
            .await
            .unwrap();
    }
    assert!(cluster.wait_for_topology(5, Duration::from_secs(3)).await);
    let term = cluster.node(leader).term();

    for i in 0..3 {
        cluster.stop_node(i).await;
    }
    for i in 0..3 {
        cluster.restart_node(i);
    }

    // restarted masters have logs, so they elect on their own
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    assert!(cluster.node(leader).term() > term);
    assert!(cluster.wait_for_topology(5, Duration::from_secs(5)).await);
    for node in cluster.running() {
        assert_eq!(node.peers().len(), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn leader_compacts_and_ships_snapshot_to_lagging_follower() {
    let options = RaftOptions {
        snapshot_threshold: 5,
        ..fast_options()
    };
    let cluster = TestCluster::start_with(3, options).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(3)).await;
    let lagging = (leader + 1) % 3;
    cluster.network.isolate(&addr(lagging));

    for vid in 1..=20 {
        cluster
            .node(leader)
            .propose(Command::max_volume_id(vid))
            .await
            .unwrap();
    }
    assert!(
        eventually(Duration::from_secs(3), || cluster.node(leader).snapshot_index() >= 10).await,
        "leader never compacted"
    );
    assert_eq!(cluster.node(lagging).snapshot_index(), 0);

    cluster.network.heal();
    cluster.wait_for_leader(Duration::from_secs(5)).await;
    assert!(cluster.wait_for_topology(20, Duration::from_secs(5)).await);
    assert!(cluster.node(lagging).snapshot_index() > 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn restart_from_snapshot_restores_state() {
    let options = RaftOptions {
        snapshot_threshold: 3,
        ..fast_options()
    };
    let mut cluster = TestCluster::start_with(1, options).await;
    for vid in 1..=10 {
        cluster
            .node(0)
            .propose(Command::max_volume_id(vid))
            .await
            .unwrap();
    }
    assert!(cluster.node(0).snapshot_index() > 0);

    cluster.stop_node(0).await;
    cluster.restart_node(0);
    // state comes back from the snapshot before any replay
    assert!(cluster.node(0).snapshot_index() > 0);
    assert!(cluster.node(0).topology().max_volume_id > 0);
    assert!(cluster.wait_for_topology(10, Duration::from_secs(3)).await);
    cluster.wait_for_leader(Duration::from_secs(3)).await;
    cluster.shutdown().await;
}
