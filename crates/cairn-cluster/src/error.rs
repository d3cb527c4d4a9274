//! Cluster control errors.

use cairn_meta::MetaError;
use cairn_types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// A join advertised an ID that is alive at a different endpoint.
    #[error("duplicate node ID {0}")]
    DuplicateNodeId(NodeId),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// A mutating verb landed on a non-primary proxy and could not be
    /// forwarded; the caller gets the primary's identity to retry against.
    #[error("not primary; cluster primary is {primary} at {url}")]
    NotPrimary { primary: NodeId, url: String },

    /// The requested primary is flagged non-electable.
    #[error("proxy {0} is not electable")]
    NonElectable(NodeId),

    /// Handover prepare phase failed; no state was changed.
    #[error("handover prepare failed on {node}: {reason}")]
    PrepareFailed { node: NodeId, reason: String },

    /// The new primary failed during handover commit. Unrecoverable: the
    /// daemon is expected to exit on this error.
    #[error("handover commit failed on new primary {node}: {reason}")]
    CommitFatal { node: NodeId, reason: String },

    #[error("transport to {node}: {reason}")]
    Transport { node: NodeId, reason: String },

    #[error(transparent)]
    Meta(#[from] MetaError),
}

impl ClusterError {
    /// True when the error is terminal for the daemon process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CommitFatal { .. })
    }
}
