//! The cluster map.

use std::collections::BTreeMap;
use std::sync::Arc;

use cairn_types::{NodeId, NodeRole, Snode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MetaError;
use crate::store::{MetaKind, VersionedMeta, VersionedStore};

/// Size of the information council: the proxies that track long-lived job
/// notifications. Derived from the map so every node computes the same set.
pub const IC_SIZE: usize = 3;

/// Versioned snapshot of cluster membership.
///
/// Exactly one primary, always present in `proxies`; a node ID never appears
/// in both maps. The snapshot is immutable once installed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Smap {
    pub version: u64,
    pub uuid: Uuid,
    pub primary_id: NodeId,
    pub proxies: BTreeMap<NodeId, Snode>,
    pub targets: BTreeMap<NodeId, Snode>,
    pub creation_time: DateTime<Utc>,
}

impl Smap {
    /// Placeholder held by a node that has not joined a cluster yet.
    /// Version 0 never replicates; the first metasync delivery replaces it.
    pub fn unattached() -> Self {
        Self {
            version: 0,
            uuid: Uuid::nil(),
            primary_id: NodeId::new(""),
            proxies: BTreeMap::new(),
            targets: BTreeMap::new(),
            creation_time: Utc::now(),
        }
    }

    /// Bootstrap map: version 1, the founding primary as the only member.
    pub fn bootstrap(uuid: Uuid, primary: Snode) -> Self {
        let mut proxies = BTreeMap::new();
        let primary_id = primary.id.clone();
        proxies.insert(primary_id.clone(), primary);
        Self {
            version: 1,
            uuid,
            primary_id,
            proxies,
            targets: BTreeMap::new(),
            creation_time: Utc::now(),
        }
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Snode> {
        self.proxies.get(id).or_else(|| self.targets.get(id))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get_node(id).is_some()
    }

    pub fn primary(&self) -> Option<&Snode> {
        self.proxies.get(&self.primary_id)
    }

    pub fn is_primary(&self, id: &NodeId) -> bool {
        self.primary_id == *id
    }

    /// Inserts or replaces a node in the map matching its role.
    pub fn put_node(&mut self, snode: Snode) {
        match snode.role {
            NodeRole::Proxy => {
                self.targets.remove(&snode.id);
                self.proxies.insert(snode.id.clone(), snode);
            }
            NodeRole::Target => {
                self.proxies.remove(&snode.id);
                self.targets.insert(snode.id.clone(), snode);
            }
        }
    }

    /// Removes a node; `Err` when the ID is unknown.
    pub fn del_node(&mut self, id: &NodeId) -> Result<Snode, MetaError> {
        self.proxies
            .remove(id)
            .or_else(|| self.targets.remove(id))
            .ok_or_else(|| MetaError::Rejected(format!("node {id} not in map v{}", self.version)))
    }

    /// Targets that participate in placement: not maintenance, not
    /// decommissioning.
    pub fn active_targets(&self) -> impl Iterator<Item = &Snode> {
        self.targets.values().filter(|t| !t.in_maint_or_decomm())
    }

    pub fn count_active_targets(&self) -> usize {
        self.active_targets().count()
    }

    pub fn count_active_proxies(&self) -> usize {
        self.proxies.values().filter(|p| !p.in_maint_or_decomm()).count()
    }

    /// All nodes except `skip`, proxies first.
    pub fn all_nodes_except(&self, skip: &NodeId) -> Vec<Snode> {
        self.proxies
            .values()
            .chain(self.targets.values())
            .filter(|n| n.id != *skip)
            .cloned()
            .collect()
    }

    /// The information council: the primary plus the first electable,
    /// non-maintenance proxies in ID order, up to [`IC_SIZE`] members.
    ///
    /// Purely a function of the snapshot, so every node derives the same
    /// council without coordination.
    pub fn staff_ic(&self) -> Vec<NodeId> {
        let mut ic = vec![self.primary_id.clone()];
        for (id, p) in &self.proxies {
            if ic.len() >= IC_SIZE {
                break;
            }
            if *id == self.primary_id || p.non_electable() || p.in_maint_or_decomm() {
                continue;
            }
            ic.push(id.clone());
        }
        ic
    }

    /// Checks the structural invariants of the snapshot.
    pub fn validate(&self) -> Result<(), MetaError> {
        if !self.proxies.contains_key(&self.primary_id) {
            return Err(MetaError::Rejected(format!(
                "primary {} not among proxies (smap v{})",
                self.primary_id, self.version
            )));
        }
        if let Some(id) = self.proxies.keys().find(|id| self.targets.contains_key(*id)) {
            return Err(MetaError::Rejected(format!(
                "node {id} present in both proxy and target maps (smap v{})",
                self.version
            )));
        }
        Ok(())
    }
}

impl VersionedMeta for Smap {
    const KIND: MetaKind = MetaKind::Smap;

    fn version(&self) -> u64 {
        self.version
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

/// Read access to the current cluster map, for components that must not hold
/// a back-pointer into the owning daemon.
pub trait SmapSource: Send + Sync + 'static {
    fn smap(&self) -> Arc<Smap>;
}

impl SmapSource for VersionedStore<Smap> {
    fn smap(&self) -> Arc<Smap> {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use cairn_types::{NetInfo, NodeFlags};

    use super::*;

    fn proxy(id: &str) -> Snode {
        Snode::new(id, NodeRole::Proxy, NetInfo::new("10.0.0.1", 8080))
    }

    fn target(id: &str) -> Snode {
        Snode::new(id, NodeRole::Target, NetInfo::new("10.0.0.2", 8081))
    }

    fn smap() -> Smap {
        let mut m = Smap::bootstrap(Uuid::new_v4(), proxy("p1"));
        m.put_node(proxy("p2"));
        m.put_node(proxy("p3"));
        m.put_node(target("t1"));
        m.put_node(target("t2"));
        m
    }

    #[test]
    fn test_primary_among_proxies() {
        let m = smap();
        m.validate().unwrap();
        assert!(m.is_primary(&NodeId::from("p1")));
        assert_eq!(m.primary().unwrap().id, NodeId::from("p1"));
    }

    #[test]
    fn test_role_maps_disjoint() {
        let mut m = smap();
        // Re-registering t1 as a proxy moves it, never duplicates it.
        m.put_node(proxy("t1"));
        m.validate().unwrap();
        assert!(m.proxies.contains_key(&NodeId::from("t1")));
        assert!(!m.targets.contains_key(&NodeId::from("t1")));
    }

    #[test]
    fn test_del_unknown_node() {
        let mut m = smap();
        assert!(m.del_node(&NodeId::from("t9")).is_err());
        assert!(m.del_node(&NodeId::from("t1")).is_ok());
    }

    #[test]
    fn test_active_targets_exclude_maintenance() {
        let mut m = smap();
        assert_eq!(m.count_active_targets(), 2);

        let mut t1 = m.targets.get(&NodeId::from("t1")).unwrap().clone();
        t1.flags = NodeFlags::MAINTENANCE;
        m.put_node(t1);
        assert_eq!(m.count_active_targets(), 1);
    }

    #[test]
    fn test_staff_ic_deterministic_and_capped() {
        let m = smap();
        let ic = m.staff_ic();
        assert_eq!(ic.len(), IC_SIZE);
        assert_eq!(ic[0], NodeId::from("p1"));
        assert_eq!(ic, m.staff_ic());
    }

    #[test]
    fn test_staff_ic_skips_non_electable() {
        let mut m = smap();
        let mut p2 = m.proxies.get(&NodeId::from("p2")).unwrap().clone();
        p2.flags = NodeFlags::NON_ELECTABLE;
        m.put_node(p2);
        m.put_node(proxy("p4"));

        let ic = m.staff_ic();
        assert!(!ic.contains(&NodeId::from("p2")));
        assert_eq!(ic, vec![NodeId::from("p1"), NodeId::from("p3"), NodeId::from("p4")]);
    }
}
