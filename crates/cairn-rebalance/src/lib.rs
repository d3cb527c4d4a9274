//! # cairn-rebalance: the data-movement round
//!
//! When the rebalance descriptor bumps, every target independently runs one
//! *round* named by the descriptor version. A round walks the local object
//! inventory, pushes every object whose owner changed under the new map to
//! its new target, and synchronizes progress with its peers through a
//! push/pull status protocol until all acks are in.
//!
//! Stages advance monotonically: `Init → Traverse → EcNamespace (optional) →
//! WaitAck → Fin → Done | Aborted`. Abort is edge-triggered and idempotent;
//! every wait in the round wakes on it.

pub mod coordinator;
pub mod error;
pub mod seams;


pub use coordinator::{RebConfig, RebCoordinator};
pub use error::RebError;
pub use seams::{Inventory, Mover, SendOutcome, StatusProbe};
