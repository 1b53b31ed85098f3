//! Common utilities and types shared across tidemaster

pub mod config;
pub mod error;
pub mod metrics;
pub mod raft;
pub mod utils;

pub use config::{Config, MasterConfig, RaftOptions};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{connection_string, crc32, normalize_address};
