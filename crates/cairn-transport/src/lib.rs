//! # cairn-transport: intra-cluster transport plane
//!
//! Shared plumbing for the control plane's fan-out patterns:
//! - [`bcast`] — bounded-parallel broadcast with an aggregate failure count
//! - [`KeepaliveTracker`] — single funnel for per-peer liveness bookkeeping

pub mod bcast;
pub mod keepalive;

pub use bcast::bcast;
pub use keepalive::KeepaliveTracker;
