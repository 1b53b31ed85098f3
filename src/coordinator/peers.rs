//! Persisted peer configuration and peer-set drift detection
//!
//! The `conf` record lists the members this node last ran with (excluding
//! itself) along with the term, vote and commit index. On startup the
//! requested peer list is compared against it; any difference means the
//! persisted consensus state describes another cluster and must be reset.

use crate::common::raft::PeerRecord;
use crate::common::{normalize_address, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// File name of the configuration record inside the data directory
pub const CONF_FILE: &str = "conf";

/// On-disk configuration record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    pub commit_index: u64,
    #[serde(default)]
    pub term: u64,
    #[serde(default)]
    pub voted_for: Option<String>,
    pub peers: Vec<PeerRecord>,
}

impl PersistedConfig {
    /// Read the record; `Ok(None)` when the file does not exist
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Atomically replace the record (write temp file, fsync, rename)
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Normalized addresses of the recorded peers
    pub fn peer_addresses(&self) -> BTreeSet<String> {
        self.peers
            .iter()
            .map(|p| normalize_address(&p.connection_string))
            .collect()
    }
}

/// Result of comparing requested membership against the persisted one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReconciliation {
    /// Persisted peers plus self; empty when nothing usable was persisted
    pub old_peers: BTreeSet<String>,
    pub changed: bool,
}

/// Order-independent comparison of two address lists
pub fn same_peer_set<A, B>(a: A, b: B) -> bool
where
    A: IntoIterator,
    A::Item: AsRef<str>,
    B: IntoIterator,
    B::Item: AsRef<str>,
{
    let a: BTreeSet<String> = a.into_iter().map(|p| normalize_address(p.as_ref())).collect();
    let b: BTreeSet<String> = b.into_iter().map(|p| normalize_address(p.as_ref())).collect();
    a == b
}

/// Decide whether the requested peers differ from the persisted ones.
///
/// A missing or unparsable conf always counts as changed. A single-node
/// cluster restarting without an explicit peer list does not.
pub fn reconcile(requested: &[String], self_addr: &str, conf_path: &Path) -> PeerReconciliation {
    let conf = match PersistedConfig::read(conf_path) {
        Ok(Some(conf)) => conf,
        Ok(None) => {
            return PeerReconciliation {
                old_peers: BTreeSet::new(),
                changed: true,
            }
        }
        Err(e) => {
            tracing::warn!(path = %conf_path.display(), error = %e, "Unreadable peer configuration");
            return PeerReconciliation {
                old_peers: BTreeSet::new(),
                changed: true,
            };
        }
    };

    let mut old_peers = conf.peer_addresses();
    old_peers.insert(normalize_address(self_addr));

    if requested.is_empty() && old_peers.len() <= 1 {
        return PeerReconciliation {
            old_peers,
            changed: false,
        };
    }

    let changed = !same_peer_set(requested, &old_peers);
    PeerReconciliation { old_peers, changed }
}
