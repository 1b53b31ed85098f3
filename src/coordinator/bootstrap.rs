//! Master startup sequence
//!
//! 1. reconcile the requested peers against the persisted conf and wipe
//!    conf, log and snapshot together on drift
//! 2. open the consensus node (fatal on failure)
//! 3. let the caller mount the RPC handlers, then start the node
//! 4. register every requested peer
//! 5. sleep a random jitter
//! 6. with the log still empty, ask each peer to join its cluster, and
//!    self-join only when none knows a leader (fatal on failure)
//! 7. report the leader
//!
//! Two fresh masters whose jitters overlap can both self-join and end up
//! as separate single-node clusters. Nothing here detects that; stagger
//! first starts or give them persisted state.

use crate::common::{normalize_address, Error, MasterConfig, Result};
use crate::coordinator::peers::{reconcile, CONF_FILE};
use crate::coordinator::raft_node::RaftNode;
use crate::coordinator::storage::RaftStorage;
use crate::coordinator::transport::Transport;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

pub struct ClusterBootstrap {
    config: MasterConfig,
}

impl ClusterBootstrap {
    pub fn new(config: MasterConfig) -> Self {
        Self { config }
    }

    /// Run the startup sequence. `install` receives the node before it
    /// starts so inbound RPCs can be routed to it.
    pub async fn start<F>(&self, transport: Arc<dyn Transport>, install: F) -> Result<Arc<RaftNode>>
    where
        F: FnOnce(Arc<RaftNode>),
    {
        let self_addr = self.config.address();
        let data_dir = &self.config.data_dir;

        let reconciliation = reconcile(&self.config.peers, &self_addr, &data_dir.join(CONF_FILE));
        if reconciliation.changed {
            tracing::info!(
                "Peers changed from {:?} to {:?}; resetting raft state in {}",
                reconciliation.old_peers,
                self.requested_peers(),
                data_dir.display()
            );
            RaftStorage::wipe(data_dir).map_err(|e| {
                Error::Fatal(format!("cannot reset {}: {}", data_dir.display(), e))
            })?;
        }

        let raft = RaftNode::open(&self_addr, data_dir, transport, self.config.raft_options())
            .map_err(|e| {
                Error::Fatal(format!(
                    "cannot open raft state in {}: {}",
                    data_dir.display(),
                    e
                ))
            })?;

        install(raft.clone());
        raft.start();

        for peer in &self.config.peers {
            raft.add_peer(peer)?;
        }

        let jitter = self.jitter();
        tracing::debug!("Waiting {:?} before checking for an existing cluster", jitter);
        tokio::time::sleep(jitter).await;

        if raft.is_log_empty() && self.join_existing(&raft, &self_addr).await {
            tracing::info!("Joined an existing cluster through a configured peer");
        } else if raft.is_log_empty() {
            let limit = Duration::from_millis(self.config.join_timeout_ms);
            match raft.self_join(limit).await {
                Ok(Some(index)) => tracing::info!("Self-joined as {} at index {}", self_addr, index),
                Ok(None) => tracing::debug!("Log filled during jitter; not self-joining"),
                Err(e) => {
                    raft.stop().await;
                    return Err(Error::Fatal(format!("self-join failed: {}", e)));
                }
            }
        } else {
            tracing::info!("Resuming with persisted raft state");
        }

        match raft.current_leader() {
            Some(leader) => tracing::info!("Leader is {}", leader),
            None => tracing::info!("No leader yet"),
        }
        Ok(raft)
    }

    /// Whether a configured peer already belongs to a led cluster.
    ///
    /// True once a leader accepted the join or was named by a peer; the
    /// leader then replicates to this node. Unreachable peers and peers
    /// that know no leader leave the decision to self-join.
    async fn join_existing(&self, raft: &RaftNode, self_addr: &str) -> bool {
        for peer in self.requested_peers() {
            if peer == self_addr {
                continue;
            }
            match raft.request_join(&peer).await {
                Ok(index) => {
                    tracing::debug!("{} accepted the join at index {}", peer, index);
                    return true;
                }
                Err(Error::NotLeader(leader)) if !leader.is_empty() => {
                    tracing::debug!("{} reports leader {}", peer, leader);
                    return true;
                }
                Err(e) => tracing::debug!("No cluster found through {}: {}", peer, e),
            }
        }
        false
    }

    fn requested_peers(&self) -> Vec<String> {
        self.config
            .peers
            .iter()
            .map(|p| normalize_address(p))
            .collect()
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (self.config.join_jitter_min_ms, self.config.join_jitter_max_ms);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}
