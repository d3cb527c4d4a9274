//! Metasync wire format.

use cairn_meta::{MetaKind, VersionedMeta};
use cairn_types::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;

/// Why a revision exists; shown in logs on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNote {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
}

impl SyncNote {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            node: None,
        }
    }

    pub fn about(action: impl Into<String>, node: NodeId) -> Self {
        Self {
            action: action.into(),
            node: Some(node),
        }
    }
}

/// One metadata revision plus the action message that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPair {
    pub kind: MetaKind,
    pub version: u64,
    pub payload: Value,
    pub note: SyncNote,
}

impl SyncPair {
    /// Wraps a typed snapshot for the wire.
    pub fn of<T: VersionedMeta + Serialize>(meta: &T, note: SyncNote) -> Result<Self, SyncError> {
        let payload = serde_json::to_value(meta).map_err(|source| SyncError::Decode {
            kind: T::KIND,
            source,
        })?;
        Ok(Self {
            kind: T::KIND,
            version: meta.version(),
            payload,
            note,
        })
    }
}

/// What actually travels: all pairs of one transition, delivered atomically
/// per peer in a single round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Cluster UUID of the sender; receivers reject foreign batches.
    pub uuid: Uuid,
    pub sender: NodeId,
    pub pairs: Vec<SyncPair>,
}

#[cfg(test)]
mod tests {
    use cairn_meta::Rmd;

    use super::*;

    #[test]
    fn test_pair_carries_kind_and_version() {
        let rmd = Rmd::new(Uuid::new_v4());
        let pair = SyncPair::of(&rmd, SyncNote::new("rebalance")).unwrap();

        assert_eq!(pair.kind, MetaKind::Rmd);
        assert_eq!(pair.version, 1);
        assert_eq!(pair.payload["version"], 1);
    }
}
