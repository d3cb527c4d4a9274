//! The rebalance descriptor.

use cairn_types::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::smap::Smap;
use crate::store::{MetaKind, VersionedMeta};

/// Versioned rebalance descriptor.
///
/// A new version exists iff a rebalance should run; the version doubles as
/// the rebalance (round) ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rmd {
    pub version: u64,
    pub uuid: Uuid,
    /// Targets participating in the round.
    pub target_ids: Vec<NodeId>,
    /// Set when the round is a single-node resilver rather than a global
    /// rebalance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resilver: Option<NodeId>,
}

impl Rmd {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            version: 1,
            uuid,
            target_ids: Vec::new(),
            resilver: None,
        }
    }

    /// Placeholder held before the first delivery from the primary.
    pub fn unattached() -> Self {
        Self {
            version: 0,
            uuid: Uuid::nil(),
            target_ids: Vec::new(),
            resilver: None,
        }
    }

    /// The round this descriptor names.
    pub fn rebalance_id(&self) -> u64 {
        self.version
    }

    /// Refreshes the participant list from a newly installed cluster map.
    pub fn set_targets_from(&mut self, smap: &Smap) {
        self.target_ids = smap.active_targets().map(|t| t.id.clone()).collect();
        self.resilver = None;
    }
}

impl VersionedMeta for Rmd {
    const KIND: MetaKind = MetaKind::Rmd;

    fn version(&self) -> u64 {
        self.version
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}
