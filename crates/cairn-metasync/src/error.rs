//! Metasync error types.

use cairn_meta::{MetaError, MetaKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer could not be reached or answered non-OK.
    #[error("transport to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    /// This node is not (or no longer) the primary.
    #[error("not primary; refusing to initiate sync")]
    NotPrimary,

    /// A received payload did not decode as its advertised kind.
    #[error("decoding {kind} payload: {source}")]
    Decode {
        kind: MetaKind,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Meta(#[from] MetaError),
}
