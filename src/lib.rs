//! # tidemaster
//!
//! Master election and topology replication for a volume storage cluster:
//! - Raft consensus between masters (JSON over HTTP)
//! - Framed, checksummed log with snapshots and compaction
//! - Peer-set drift detection and state reset on restart
//! - Replicated volume id allocation
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               Master Cluster               │
//! │  ┌──────────┐   ┌──────────┐  ┌──────────┐ │
//! │  │ master 1 │◄─►│ master 2 │◄►│ master 3 │ │
//! │  │ (leader) │   │          │  │          │ │
//! │  └────┬─────┘   └──────────┘  └──────────┘ │
//! │       │ /cluster/{vote,append,snapshot}    │
//! └───────┼────────────────────────────────────┘
//!         ▼
//!   topology state machine (max volume id)
//! ```
//!
//! ## Usage
//!
//! ### Start three masters
//! ```bash
//! tidemaster serve --ip 10.0.0.1 --port 9333 --mdir ./m1 \
//!   --peers 10.0.0.1:9333,10.0.0.2:9333,10.0.0.3:9333
//! ```
//!
//! ### Ask a master who leads
//! ```bash
//! tidemaster status --master 10.0.0.2:9333
//! ```

pub mod common;
pub mod coordinator;
pub mod topology;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{MasterServer, RaftNode};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

