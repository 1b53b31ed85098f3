use serde::{Deserialize, Serialize};

pub type VolumeId = u32;

/// In-memory topology metadata shared by all masters.
///
/// Only the consensus apply loop mutates this; everyone else reads the
/// last-applied copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyState {
    /// Highest volume id handed out so far
    pub max_volume_id: VolumeId,
}

impl TopologyState {
    /// Raise the max volume id; lower values are ignored so replay is idempotent
    pub fn up_adjust_max_volume_id(self, vid: VolumeId) -> Self {
        Self {
            max_volume_id: self.max_volume_id.max(vid),
        }
    }

    /// The id the next allocation should propose
    pub fn next_volume_id(&self) -> VolumeId {
        self.max_volume_id + 1
    }
}
