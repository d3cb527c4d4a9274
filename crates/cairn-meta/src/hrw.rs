//! Highest-random-weight placement.
//!
//! Object → target selection is a pure function of the object name and the
//! active-target set of an [`Smap`] snapshot, so every node that holds the
//! same map version routes identically without coordination.

use std::path::PathBuf;

use cairn_types::{NodeId, Snode};

use crate::smap::Smap;

/// Selects the owner of `name` among the active targets of `smap`.
///
/// Each active target is scored with a digest of `(target_id, name)`; the
/// highest score wins, ties going to the lexicographically smaller ID.
/// Returns `None` on a map with no active targets.
pub fn locate<'a>(name: &str, smap: &'a Smap) -> Option<&'a Snode> {
    let mut best: Option<(&Snode, u64)> = None;
    for t in smap.active_targets() {
        let score = weight(t.id.as_str(), name);
        best = match best {
            None => Some((t, score)),
            Some((bt, bs)) if score > bs || (score == bs && t.id < bt.id) => Some((t, score)),
            keep => keep,
        };
    }
    best.map(|(t, _)| t)
}

/// [`locate`], returning just the owner's ID.
pub fn locate_id(name: &str, smap: &Smap) -> Option<NodeId> {
    locate(name, smap).map(|t| t.id.clone())
}

fn weight(target_id: &str, name: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(target_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(raw)
}

/// Options of the directory-promote routine.
#[derive(Debug, Clone)]
pub struct PromoteArgs {
    pub src_path: PathBuf,
    pub dst_obj_name: String,
    pub recursive: bool,
    pub overwrite_dst: bool,
    pub delete_src: bool,
    /// The source directory is shared storage mounted on every target; each
    /// target keeps only the entries it owns.
    pub file_share: bool,
}

/// Decides whether a target walking a promote source should handle `obj_name`.
///
/// Without `file_share` the walk is local-only and every entry is kept. With
/// it, ownership falls back to placement so that each file is promoted
/// exactly once cluster-wide.
pub fn keep_entry(args: &PromoteArgs, obj_name: &str, smap: &Smap, self_id: &NodeId) -> bool {
    if !args.file_share {
        return true;
    }
    locate(obj_name, smap).is_some_and(|owner| owner.id == *self_id)
}
