//! Raft message structures exchanged between master nodes
//!
//! Every type here travels as a JSON body on the `/cluster/*` routes.

use crate::topology::{Command, CommandRegistry, TopologyState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index known to match the leader (valid when `success`)
    pub match_index: u64,
    /// Where the leader should resume sending (valid when `!success`)
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
    pub last_index: u64,
}

/// Ask the leader to add a member through the replicated log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub connection_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub ok: bool,
    /// Commit index of the join entry when `ok`
    pub index: u64,
    /// Leader hint when this node could not accept the join
    pub leader: Option<String>,
    /// Full roster once accepted, so the newcomer knows every voter
    #[serde(default)]
    pub members: Vec<PeerRecord>,
}

/// A replicated log entry; the command travels as registry name + payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command_name: String,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: &Command) -> crate::Result<Self> {
        let (name, payload) = command.encode()?;
        Ok(Self {
            term,
            index,
            command_name: name.to_string(),
            command: payload,
        })
    }

    pub fn decode_command(&self) -> crate::Result<Command> {
        CommandRegistry::decode(&self.command_name, &self.command)
    }
}

/// A member as recorded in conf and snapshots
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub name: String,
    pub connection_string: String,
}

/// Compacted state machine at `last_index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    /// Full membership at `last_index`, including the node that took it
    pub members: Vec<PeerRecord>,
    pub state: TopologyState,
}
