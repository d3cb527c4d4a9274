//! # cairn-meta: Versioned cluster metadata
//!
//! The control plane keeps three replicated metadata documents:
//! - [`Smap`] — the cluster map (membership, primary, endpoints)
//! - [`Rmd`] — the rebalance descriptor; its version is the rebalance ID
//! - [`Bmd`] — the bucket map
//!
//! Each lives in a [`VersionedStore`]: readers get the current immutable
//! snapshot without locking; writers go through a compare-and-swap
//! [`VersionedStore::modify`] that clones, mutates the clone, and installs it
//! under the store's exclusive lock. Old snapshots stay readable by in-flight
//! readers for as long as they hold the `Arc`.
//!
//! The crate also hosts the placement function ([`hrw::locate`]): placement is
//! a pure function of an `Smap` snapshot, so it belongs next to the map.

pub mod bmd;
pub mod error;
pub mod hrw;
pub mod persist;
pub mod reg;
pub mod rmd;
pub mod smap;
pub mod store;

pub use bmd::{Bmd, BucketProps};
pub use error::MetaError;
pub use hrw::{PromoteArgs, keep_entry, locate, locate_id};
pub use persist::{MemMetadataStore, MetadataStore};
pub use reg::NodeRegMeta;
pub use rmd::Rmd;
pub use smap::{IC_SIZE, Smap, SmapSource};
pub use store::{FnModify, MetaKind, Modify, VersionedMeta, VersionedStore, validate_uuid};
