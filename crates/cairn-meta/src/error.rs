//! Metadata error types.

use cairn_types::NodeId;
use thiserror::Error;
use uuid::Uuid;

use crate::store::MetaKind;

/// Errors raised by the versioned-metadata layer.
#[derive(Debug, Error)]
pub enum MetaError {
    /// An installation would not advance the version. Indicates a logic bug
    /// in the caller; the store refuses rather than corrupting monotonicity.
    #[error("{kind} version regression: attempted v{attempted}, current v{current}")]
    VersionRegression {
        kind: MetaKind,
        current: u64,
        attempted: u64,
    },

    /// Cluster-integrity violation: the peer belongs to a different cluster.
    #[error("cluster integrity: {local_id} has UUID {local}, {peer_id} advertises {incoming}")]
    UuidMismatch {
        local: Uuid,
        incoming: Uuid,
        local_id: NodeId,
        peer_id: NodeId,
    },

    /// The modify's `pre` phase vetoed the change; nothing was installed.
    #[error("metadata update rejected: {0}")]
    Rejected(String),

    /// The change is a no-op (e.g. a keepalive for an unchanged node);
    /// nothing was installed and the version did not move.
    #[error("no-op: {0}")]
    NoChange(String),

    /// Persistence backend failure.
    #[error("metadata persistence: {0}")]
    Persist(String),
}

impl MetaError {
    /// True for [`MetaError::NoChange`], which callers usually treat as
    /// success without a new revision.
    pub fn is_no_change(&self) -> bool {
        matches!(self, Self::NoChange(_))
    }
}
