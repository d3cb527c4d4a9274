//! # cairn-types: Core types for `Cairn`
//!
//! This crate contains shared types used across the `Cairn` control plane:
//! - Node identity ([`NodeId`], [`Snode`], [`NetInfo`], [`NodeFlags`])
//! - Control-plane actions ([`ControlAction`], [`RmKind`])
//! - Bucket access control ([`AccessAttrs`], [`modify_access`])
//! - Rebalance status on the wire ([`Stage`], [`RebStatus`])

pub mod access;
pub mod action;
pub mod node;
pub mod reb;

pub use access::{AccessAttrs, AccessError, modify_access};
pub use action::{ControlAction, RmKind, RmNodeArgs, XactArgs};
pub use node::{NetInfo, NodeFlags, NodeId, NodeRole, Snode};
pub use reb::{RebStatus, Stage};
