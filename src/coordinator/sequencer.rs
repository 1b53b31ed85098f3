//! Cluster-wide volume id allocation
//!
//! The leader hands out ids by replicating `max + 1`. A barrier entry is
//! committed once per term so the state it reads includes every entry of
//! earlier leaders.

use crate::common::{Error, Result};
use crate::coordinator::raft_node::RaftNode;
use crate::topology::{Command, VolumeId};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct VolumeIdSequencer {
    /// Term in which the last read barrier committed
    barrier_term: Mutex<u64>,
}

impl VolumeIdSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next volume id. Calls are serialized.
    pub async fn next_volume_id(&self, raft: &RaftNode) -> Result<VolumeId> {
        let mut barrier_term = self.barrier_term.lock().await;
        if !raft.is_leader() {
            return Err(Error::NotLeader(raft.current_leader().unwrap_or_default()));
        }

        let term = raft.term();
        if *barrier_term != term {
            raft.propose(Command::NoOp).await?;
            *barrier_term = term;
        }

        let next = raft.topology().next_volume_id();
        raft.propose(Command::max_volume_id(next)).await?;
        tracing::info!("Allocated volume id {}", next);
        Ok(next)
    }
}
