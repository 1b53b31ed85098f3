//! Replicated cluster topology
//!
//! The state machine every master converges on by applying committed log
//! entries in index order, and the closed set of commands that mutate it.

pub mod command;
pub mod state;

pub use command::{Command, CommandRegistry, MembershipChange};
pub use state::{TopologyState, VolumeId};
