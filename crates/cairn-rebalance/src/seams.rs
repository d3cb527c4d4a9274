//! Interfaces the coordinator consumes.
//!
//! The coordinator never holds back-pointers into the daemon; object
//! transmission, the local inventory, and peer status exchange all arrive as
//! trait objects.

use async_trait::async_trait;
use cairn_types::{RebStatus, Snode};

use crate::error::RebError;

/// Result of transmitting one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Framed, streamed, awaiting the receiver's commit ack.
    Sent,
    /// The object vanished between traverse and send; not an error.
    NotFound,
}

/// Object transmission. One object per framed message; the receiver acks
/// after committing to its own storage.
#[async_trait]
pub trait Mover: Send + Sync + 'static {
    async fn send(&self, to: &Snode, obj: &str) -> Result<SendOutcome, RebError>;
}

/// The target's local object inventory. The on-disk layout is not this
/// crate's business; a traverse only needs the names.
pub trait Inventory: Send + Sync + 'static {
    fn objects(&self) -> Vec<String>;
}

/// Peer status exchange: pull one peer's round status, push our stage
/// transitions, propagate aborts.
#[async_trait]
pub trait StatusProbe: Send + Sync + 'static {
    async fn reb_status(&self, peer: &Snode) -> Result<RebStatus, RebError>;
    async fn push_stage(&self, peer: &Snode, status: &RebStatus) -> Result<(), RebError>;
    async fn push_abort(&self, peer: &Snode, reb_id: u64) -> Result<(), RebError>;
}
