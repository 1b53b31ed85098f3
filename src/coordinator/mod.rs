//! Master implementation with Raft consensus
//!
//! A master is responsible for:
//! - Agreeing with its peers on a single leader
//! - Replicating topology mutations through the Raft log
//! - Resetting stale consensus state when the peer set changes
//! - Reporting leader and membership

pub mod bootstrap;
pub mod http;
pub mod peers;
pub mod raft_node;
pub mod sequencer;
pub mod server;
pub mod storage;
pub mod transport;

pub use bootstrap::ClusterBootstrap;
pub use raft_node::{ClusterStatus, RaftNode, RaftRole};
pub use server::MasterServer;
pub use transport::{HttpTransport, MemoryNetwork, Transport};
