//! Cluster startup through the bootstrap sequence

mod common;

use common::eventually;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tidemaster::common::MasterConfig;
use tidemaster::coordinator::{ClusterBootstrap, MemoryNetwork, RaftNode};
use tidemaster::topology::Command;

fn master(dir: &Path, port: u16, peers: &[u16], jitter_ms: (u64, u64)) -> MasterConfig {
    MasterConfig {
        ip: "10.0.0.1".into(),
        port,
        data_dir: dir.to_path_buf(),
        peers: peers.iter().map(|p| format!("http://10.0.0.1:{}", p)).collect(),
        pulse_seconds: 1,
        heartbeat_interval_ms: 20,
        rpc_timeout_ms: 50,
        propose_timeout_ms: 2_000,
        join_timeout_ms: 5_000,
        join_jitter_min_ms: jitter_ms.0,
        join_jitter_max_ms: jitter_ms.1,
        ..Default::default()
    }
}

async fn boot(network: &Arc<MemoryNetwork>, config: MasterConfig) -> Arc<RaftNode> {
    let transport = network.transport(&config.address());
    ClusterBootstrap::new(config)
        .start(transport, |node| network.install(&node))
        .await
        .unwrap()
}

/// Boot every master concurrently; jitter decides who founds the cluster
async fn boot_all(network: &Arc<MemoryNetwork>, configs: Vec<MasterConfig>) -> Vec<Arc<RaftNode>> {
    let futures = configs.into_iter().map(|config| boot(network, config));
    futures_util::future::join_all(futures).await
}

#[tokio::test]
async fn three_fresh_masters_form_one_cluster() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let network = MemoryNetwork::new();
    let ports = [9333, 9334, 9335];

    let nodes = boot_all(
        &network,
        vec![
            master(dirs[0].path(), 9333, &ports, (0, 1)),
            master(dirs[1].path(), 9334, &ports, (300, 400)),
            master(dirs[2].path(), 9335, &ports, (300, 400)),
        ],
    )
    .await;

    assert!(nodes[0].is_leader());
    assert!(
        eventually(Duration::from_secs(3), || {
            nodes
                .iter()
                .all(|n| n.current_leader().as_deref() == Some("10.0.0.1:9333"))
        })
        .await
    );
    for node in &nodes {
        assert_eq!(node.members(), vec!["10.0.0.1:9333", "10.0.0.1:9334", "10.0.0.1:9335"]);
    }

    nodes[0].propose(Command::max_volume_id(12)).await.unwrap();
    assert!(
        eventually(Duration::from_secs(3), || {
            nodes.iter().all(|n| n.topology().max_volume_id == 12)
        })
        .await
    );
    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn restart_with_same_peers_keeps_state() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let network = MemoryNetwork::new();
    let ports = [9333, 9334, 9335];
    let configs = |jitter: [(u64, u64); 3]| {
        (0..3)
            .map(|i| master(dirs[i].path(), ports[i], &ports, jitter[i]))
            .collect::<Vec<_>>()
    };

    let nodes = boot_all(&network, configs([(0, 1), (300, 400), (300, 400)])).await;
    nodes[0].propose(Command::max_volume_id(30)).await.unwrap();
    assert!(
        eventually(Duration::from_secs(3), || {
            nodes.iter().all(|n| n.topology().max_volume_id == 30)
        })
        .await
    );
    for node in &nodes {
        node.stop().await;
        network.remove(node.name());
    }

    // same membership: nothing is wiped and the masters re-elect on their own
    let nodes = boot_all(&network, configs([(0, 1), (0, 1), (0, 1)])).await;
    for node in &nodes {
        assert!(!node.is_log_empty());
    }
    assert!(
        eventually(Duration::from_secs(5), || {
            nodes.iter().all(|n| n.topology().max_volume_id == 30)
                && nodes.iter().filter(|n| n.is_leader()).count() == 1
        })
        .await
    );
    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn changed_peers_reset_state() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let network = MemoryNetwork::new();
    let old_ports = [9333, 9334];

    let nodes = boot_all(
        &network,
        vec![
            master(dirs[0].path(), 9333, &old_ports, (0, 1)),
            master(dirs[1].path(), 9334, &old_ports, (300, 400)),
        ],
    )
    .await;
    nodes[0].propose(Command::max_volume_id(77)).await.unwrap();
    assert!(
        eventually(Duration::from_secs(3), || {
            nodes.iter().all(|n| n.topology().max_volume_id == 77)
        })
        .await
    );
    for node in &nodes {
        node.stop().await;
        network.remove(node.name());
    }

    // {A, B} -> {A, B, C}: every master starts over
    let new_ports = [9333, 9334, 9335];
    let nodes = boot_all(
        &network,
        vec![
            master(dirs[0].path(), 9333, &new_ports, (0, 1)),
            master(dirs[1].path(), 9334, &new_ports, (300, 400)),
            master(dirs[2].path(), 9335, &new_ports, (300, 400)),
        ],
    )
    .await;
    assert!(nodes[0].is_leader());
    for node in &nodes {
        assert_eq!(node.topology().max_volume_id, 0);
        assert_eq!(node.peers().len(), 2);
    }
    for node in &nodes {
        node.stop().await;
    }
}
