//! # cairn-metasync: metadata replication
//!
//! The primary proxy replicates metadata revisions to every other node. A
//! replication unit is a *pair* `(revision, note)`; several pairs changed by
//! one transition (say, a join that also bumps the rebalance descriptor)
//! travel as one batch and land atomically per peer.
//!
//! Guarantees:
//! - per peer and per metadata kind, delivered versions strictly increase;
//! - a peer is only sent revisions newer than what it has acknowledged;
//! - unreachable peers are retried with exponential backoff bounded by the
//!   keepalive window, and dropped once the map no longer lists them;
//! - peers that stay unreachable are reported through [`DegradedSink`] —
//!   eviction is the membership controller's call, never the syncer's.

pub mod error;
pub mod msg;
pub mod receiver;
pub mod syncer;

pub use error::SyncError;
pub use msg::{SyncBatch, SyncNote, SyncPair};
pub use receiver::{ApplyHook, MetaReceiver};
pub use syncer::{DegradedSink, Metasyncer, NullDegradedSink, SyncTransport};
