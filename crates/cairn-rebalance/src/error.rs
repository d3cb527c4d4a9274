//! Rebalance error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RebError {
    /// A status probe or object transmission failed at the transport level.
    #[error("transport to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    /// The round was aborted, locally or by a peer.
    #[error("round {reb_id} aborted: {reason}")]
    Aborted { reb_id: u64, reason: String },

    /// A round older than (or equal to) the one already running was asked to
    /// start; the caller should simply drop it.
    #[error("round {0} is stale")]
    StaleRound(u64),

    /// Peers did not reach the required stage within the budget.
    #[error("round {reb_id}: peers not ready for {what} in time")]
    PeersNotReady { reb_id: u64, what: &'static str },
}
