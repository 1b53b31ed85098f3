//! Configuration for tidemaster
//!
//! Values come from (lowest to highest priority) built-in defaults, an
//! optional TOML file, `TIDEMASTER__*` environment variables and finally
//! CLI flags applied by the binary.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `TIDEMASTER__MASTER__PORT=9334`
pub const ENV_PREFIX: &str = "TIDEMASTER";

/// Upper bound on `pulse_seconds`
pub const MAX_PULSE_SECONDS: u64 = 3600;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Master node config
    pub master: MasterConfig,

    /// Logging level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master: MasterConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("tidemaster").required(false)),
        };
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("master.peers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.master.validate()?;
        Ok(config)
    }
}

/// Master (coordinator) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address other masters reach this node at; also its identity
    pub ip: String,

    /// HTTP port for status and inter-node RPC
    pub port: u16,

    /// Interface to bind
    pub bind_ip: String,

    /// Directory holding conf, log and snapshot
    pub data_dir: PathBuf,

    /// Requested cluster membership (host:port), usually including self
    pub peers: Vec<String>,

    /// Election pulse; election timeout is `pulse_seconds * 500ms`
    pub pulse_seconds: u64,

    /// Leader heartbeat interval
    pub heartbeat_interval_ms: u64,

    /// Per-RPC timeout for vote/append/snapshot requests
    pub rpc_timeout_ms: u64,

    /// How long `propose` waits for a majority commit
    pub propose_timeout_ms: u64,

    /// How long the initial self-join may take before startup fails
    pub join_timeout_ms: u64,

    /// Startup jitter before deciding to self-join
    pub join_jitter_min_ms: u64,
    pub join_jitter_max_ms: u64,

    /// Applied entries between snapshots
    pub snapshot_threshold: u64,

    /// Idle pooled connections kept per peer
    pub max_idle_conns_per_host: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            ip: "localhost".to_string(),
            port: 9333,
            bind_ip: "0.0.0.0".to_string(),
            data_dir: PathBuf::from("./master-data"),
            peers: Vec::new(),
            pulse_seconds: 5,
            heartbeat_interval_ms: 500,
            rpc_timeout_ms: 1_000,
            propose_timeout_ms: 5_000,
            join_timeout_ms: 60_000,
            join_jitter_min_ms: 1_000,
            join_jitter_max_ms: 4_000,
            snapshot_threshold: 10_000,
            max_idle_conns_per_host: 1024,
        }
    }
}

impl MasterConfig {
    /// This node's identity, `ip:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_ip, self.port)
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("bind address: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.pulse_seconds == 0 || self.pulse_seconds > MAX_PULSE_SECONDS {
            return Err(Error::InvalidConfig(format!(
                "pulse_seconds must be in 1..={}, got {}",
                MAX_PULSE_SECONDS, self.pulse_seconds
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.join_jitter_min_ms > self.join_jitter_max_ms {
            return Err(Error::InvalidConfig(format!(
                "join jitter range is empty: {}..{}",
                self.join_jitter_min_ms, self.join_jitter_max_ms
            )));
        }
        Ok(())
    }

    /// Consensus engine tunables derived from this config
    pub fn raft_options(&self) -> RaftOptions {
        RaftOptions {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            election_timeout: Duration::from_millis(self.pulse_seconds.saturating_mul(500)),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            propose_timeout: Duration::from_millis(self.propose_timeout_ms),
            snapshot_threshold: self.snapshot_threshold,
        }
    }
}

/// Consensus engine tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftOptions {
    /// Fixed leader heartbeat period
    pub heartbeat_interval: Duration,
    /// Base election timeout, randomized into `[t, 2t)` per node
    pub election_timeout: Duration,
    pub rpc_timeout: Duration,
    pub propose_timeout: Duration,
    pub snapshot_threshold: u64,
}

impl Default for RaftOptions {
    fn default() -> Self {
        MasterConfig::default().raft_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let conf = MasterConfig::default();
        assert_eq!(conf.address(), "localhost:9333");
        let opts = conf.raft_options();
        assert_eq!(opts.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(opts.election_timeout, Duration::from_millis(2500));
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[master]\nip = \"10.0.0.5\"\nport = 9444\npeers = [\"10.0.0.5:9444\", \"10.0.0.6:9444\"]\npulse_seconds = 2"
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.master.address(), "10.0.0.5:9444");
        assert_eq!(config.master.peers.len(), 2);
        assert_eq!(
            config.master.raft_options().election_timeout,
            Duration::from_millis(1000)
        );
        // untouched fields keep their defaults
        assert_eq!(config.master.max_idle_conns_per_host, 1024);
    }

    #[test]
    fn test_invalid_jitter() {
        let conf = MasterConfig {
            join_jitter_min_ms: 10,
            join_jitter_max_ms: 5,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_pulse_bounds() {
        let conf = MasterConfig {
            pulse_seconds: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(Error::InvalidConfig(_))));
        // derived options stay finite even for unvalidated input
        assert_eq!(
            conf.raft_options().election_timeout,
            Duration::from_millis(u64::MAX)
        );

        let conf = MasterConfig {
            pulse_seconds: MAX_PULSE_SECONDS,
            ..Default::default()
        };
        assert!(conf.validate().is_ok());
        assert_eq!(
            conf.raft_options().election_timeout,
            Duration::from_secs(MAX_PULSE_SECONDS / 2)
        );
    }
}
