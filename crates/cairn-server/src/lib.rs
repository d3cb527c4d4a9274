//! # cairn-server: the node daemon
//!
//! One binary (`cairnd`) serves both roles. A **proxy** exposes the cluster
//! API, runs the membership controller, and — when primary — drives
//! metasync. A **target** runs the rebalance coordinator and the object
//! handoff plane. Both speak the same intra-cluster HTTP surface.
//!
//! The crate also houses the reqwest-backed implementations of every
//! outbound seam the lower crates define ([`transport`]).

pub mod daemon;
pub mod error;
pub mod persist;
pub mod routes;
pub mod transport;

pub use daemon::Daemon;
pub use error::{ServerError, ServerResult};
pub use persist::FsMetadataStore;
pub use transport::{HttpMover, HttpTransport};
