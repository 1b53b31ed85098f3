//! Replicable commands
//!
//! Commands travel through the log as `(name, payload)` where the payload
//! is the JSON form of the variant. `CommandRegistry` maps each name back to
//! its decoder, so adding a command means adding a variant, a name and a
//! registry entry.

use crate::common::raft::PeerRecord;
use crate::common::{Error, Result};
use crate::topology::state::{TopologyState, VolumeId};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_VOLUME_ID_COMMAND: &str = "topology:max_volume_id";
pub const JOIN_COMMAND: &str = "raft:join";
pub const LEAVE_COMMAND: &str = "raft:leave";
pub const NOP_COMMAND: &str = "raft:nop";

/// Propose a new maximum volume id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxVolumeIdCommand {
    pub max_volume_id: VolumeId,
}

/// Add a master to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCommand {
    pub name: String,
    pub connection_string: String,
}

/// Remove a master from the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveCommand {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    MaxVolumeId(MaxVolumeIdCommand),
    Join(JoinCommand),
    Leave(LeaveCommand),
    /// Appended by a new leader so entries from earlier terms can commit
    NoOp,
}

/// Effect of a committed command on the consensus roster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(PeerRecord),
    Remove(String),
}

impl Command {
    pub fn max_volume_id(max_volume_id: VolumeId) -> Self {
        Command::MaxVolumeId(MaxVolumeIdCommand { max_volume_id })
    }

    pub fn join(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Command::Join(JoinCommand {
            name: name.into(),
            connection_string: connection_string.into(),
        })
    }

    pub fn leave(name: impl Into<String>) -> Self {
        Command::Leave(LeaveCommand { name: name.into() })
    }

    /// Registry name of this command
    pub fn name(&self) -> &'static str {
        match self {
            Command::MaxVolumeId(_) => MAX_VOLUME_ID_COMMAND,
            Command::Join(_) => JOIN_COMMAND,
            Command::Leave(_) => LEAVE_COMMAND,
            Command::NoOp => NOP_COMMAND,
        }
    }

    /// Serialize into `(name, payload)` for the log and the wire
    pub fn encode(&self) -> Result<(&'static str, Vec<u8>)> {
        let payload = match self {
            Command::MaxVolumeId(cmd) => serde_json::to_vec(cmd)?,
            Command::Join(cmd) => serde_json::to_vec(cmd)?,
            Command::Leave(cmd) => serde_json::to_vec(cmd)?,
            Command::NoOp => Vec::new(),
        };
        Ok((self.name(), payload))
    }

    /// Deterministic effect on the topology state machine
    pub fn apply(&self, state: TopologyState) -> TopologyState {
        match self {
            Command::MaxVolumeId(cmd) => state.up_adjust_max_volume_id(cmd.max_volume_id),
            Command::Join(_) | Command::Leave(_) | Command::NoOp => state,
        }
    }

    pub fn membership(&self) -> Option<MembershipChange> {
        match self {
            Command::Join(cmd) => Some(MembershipChange::Add(PeerRecord {
                name: cmd.name.clone(),
                connection_string: cmd.connection_string.clone(),
            })),
            Command::Leave(cmd) => Some(MembershipChange::Remove(cmd.name.clone())),
            _ => None,
        }
    }
}

type DecodeFn = fn(&[u8]) -> Result<Command>;

fn decode_max_volume_id(payload: &[u8]) -> Result<Command> {
    Ok(Command::MaxVolumeId(serde_json::from_slice(payload)?))
}

fn decode_join(payload: &[u8]) -> Result<Command> {
    Ok(Command::Join(serde_json::from_slice(payload)?))
}

fn decode_leave(payload: &[u8]) -> Result<Command> {
    Ok(Command::Leave(serde_json::from_slice(payload)?))
}

fn decode_nop(_payload: &[u8]) -> Result<Command> {
    Ok(Command::NoOp)
}

static REGISTRY: Lazy<HashMap<&'static str, DecodeFn>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, DecodeFn> = HashMap::new();
    registry.insert(MAX_VOLUME_ID_COMMAND, decode_max_volume_id);
    registry.insert(JOIN_COMMAND, decode_join);
    registry.insert(LEAVE_COMMAND, decode_leave);
    registry.insert(NOP_COMMAND, decode_nop);
    registry
});

/// Static name -> decoder mapping for every replicable command
pub struct CommandRegistry;

impl CommandRegistry {
    pub fn decode(name: &str, payload: &[u8]) -> Result<Command> {
        let decode = REGISTRY
            .get(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))?;
        decode(payload)
    }
}
