//! # cairn-cluster: membership control
//!
//! The primary proxy serializes every membership mutation: joins, keepalives,
//! maintenance, decommission, and the primary handover itself. All of them
//! funnel through the cluster map's `modify`, so the primary applies them one
//! at a time; when a change calls for data movement, the rebalance descriptor
//! is bumped inside the same critical section and both revisions replicate in
//! one metasync batch.
//!
//! Nothing in this crate talks HTTP. Outbound calls go through the
//! [`NodeClient`] seam; the server crate supplies the real transport.

pub mod error;
pub mod handover;
pub mod membership;
pub mod notif;

pub use error::ClusterError;
pub use handover::adopt_primary;
pub use membership::{Controller, JoinResponse, NodeClient, requires_rebalance};
pub use notif::{NotifListener, NotifMsg, NotifRegistry, XactSnapshot};
