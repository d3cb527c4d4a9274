//! The bucket map.

use std::collections::BTreeMap;

use cairn_types::AccessAttrs;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{MetaKind, VersionedMeta};

/// Per-bucket properties carried by the bucket map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProps {
    pub access: AccessAttrs,
}

impl Default for BucketProps {
    fn default() -> Self {
        Self {
            access: AccessAttrs::rw(),
        }
    }
}

/// Versioned bucket metadata.
///
/// The control plane treats bucket contents as opaque; what matters here is
/// the `(uuid, version)` pair for metasync cache-coherence and the persisted
/// access mask per bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bmd {
    pub version: u64,
    pub uuid: Uuid,
    pub buckets: BTreeMap<String, BucketProps>,
}

impl Bmd {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            version: 1,
            uuid,
            buckets: BTreeMap::new(),
        }
    }

    /// Placeholder held before the first delivery from the primary.
    pub fn unattached() -> Self {
        Self {
            version: 0,
            uuid: Uuid::nil(),
            buckets: BTreeMap::new(),
        }
    }
}

impl VersionedMeta for Bmd {
    const KIND: MetaKind = MetaKind::Bmd;

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
