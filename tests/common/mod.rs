//! In-memory master cluster for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidemaster::common::RaftOptions;
use tidemaster::coordinator::{MemoryNetwork, RaftNode, RaftRole};

pub fn fast_options() -> RaftOptions {
    RaftOptions {
        heartbeat_interval: Duration::from_millis(20),
        election_timeout: Duration::from_millis(100),
        rpc_timeout: Duration::from_millis(50),
        propose_timeout: Duration::from_secs(2),
        snapshot_threshold: 10_000,
    }
}

pub fn addr(i: usize) -> String {
    format!("m{}:9333", i)
}

/// Poll `cond` every 10ms until it holds or `limit` passes
pub async fn eventually<F>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub async fn with_deadline<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut)
        .await
        .expect("deadline exceeded")
}

pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<Option<Arc<RaftNode>>>,
    pub dirs: Vec<TempDir>,
    pub options: RaftOptions,
}

impl TestCluster {
    /// `n` masters that know each other; master 0 founds the cluster
    pub async fn start(n: usize) -> Self {
        Self::start_with(n, fast_options()).await
    }

    pub async fn start_with(n: usize, options: RaftOptions) -> Self {
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
            dirs: (0..n).map(|_| tempfile::tempdir().unwrap()).collect(),
            options,
        };
        for i in 0..n {
            let node = cluster.open(i);
            cluster.nodes.push(Some(node));
        }
        cluster
            .node(0)
            .self_join(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("fresh log");
        cluster
    }

    fn open(&self, i: usize) -> Arc<RaftNode> {
        let name = addr(i);
        let node = RaftNode::open(
            &name,
            self.dirs[i].path(),
            self.network.transport(&name),
            self.options,
        )
        .unwrap();
        self.network.install(&node);
        for peer in 0..self.dirs.len() {
            node.add_peer(&addr(peer)).unwrap();
        }
        node.start();
        node
    }

    pub fn node(&self, i: usize) -> &Arc<RaftNode> {
        self.nodes[i].as_ref().expect("node is stopped")
    }

    pub fn running(&self) -> impl Iterator<Item = &Arc<RaftNode>> {
        self.nodes.iter().flatten()
    }

    /// Index of the single running leader, if there is exactly one
    pub fn leader_index(&self) -> Option<usize> {
        let leaders: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().filter(|n| n.role() == RaftRole::Leader).map(|_| i))
            .collect();
        match leaders.as_slice() {
            [i] => Some(*i),
            _ => None,
        }
    }

    /// Wait for a leader that every node in `among` agrees on
    pub async fn wait_for_leader_among(&self, among: &[usize], limit: Duration) -> usize {
        let mut found = None;
        let agreed = eventually(limit, || {
            let leader = among
                .iter()
                .copied()
                .find(|&i| self.node(i).role() == RaftRole::Leader);
            let Some(leader) = leader else {
                return false;
            };
            let name = self.node(leader).name().to_string();
            let all_follow = among
                .iter()
                .all(|&i| self.node(i).current_leader().as_deref() == Some(name.as_str()));
            if all_follow {
                found = Some(leader);
            }
            all_follow
        })
        .await;
        assert!(agreed, "no agreed leader among {:?}", among);
        found.expect("leader recorded")
    }

    pub async fn wait_for_leader(&self, limit: Duration) -> usize {
        let among: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_some())
            .collect();
        self.wait_for_leader_among(&among, limit).await
    }

    /// Wait until every running node has applied `max_volume_id`
    pub async fn wait_for_topology(&self, max_volume_id: u32, limit: Duration) -> bool {
        eventually(limit, || {
            self.running()
                .all(|n| n.topology().max_volume_id == max_volume_id)
        })
        .await
    }

    pub async fn stop_node(&mut self, i: usize) {
        if let Some(node) = self.nodes[i].take() {
            node.stop().await;
            self.network.remove(node.name());
        }
    }

    pub fn restart_node(&mut self, i: usize) {
        assert!(self.nodes[i].is_none(), "node {} still running", i);
        let node = self.open(i);
        self.nodes[i] = Some(node);
    }

    pub async fn shutdown(mut self) {
        for i in 0..self.nodes.len() {
            self.stop_node(i).await;
        }
    }
}
