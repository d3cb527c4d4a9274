//! Node identity: IDs, endpoints, roles, and lifecycle flags.

use std::fmt::{self, Display};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Stable, opaque identifier of a cluster node.
///
/// IDs survive restarts and endpoint changes; a node re-registering with the
/// same ID but different endpoints is "renewing" its registration rather than
/// joining as a new member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One network endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetInfo {
    pub hostname: String,
    pub port: u16,
}

impl NetInfo {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Base URL for HTTP calls against this endpoint.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

impl Display for NetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Stateless gateway; serializes cluster mutations when primary.
    Proxy,
    /// Data-bearing node; participates in placement and rebalance.
    Target,
}

bitflags! {
    /// Lifecycle flags of a cluster node, carried in the cluster map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeFlags: u16 {
        /// Proxy may never be elected primary.
        const NON_ELECTABLE   = 1 << 0;
        /// Node is in maintenance; excluded from placement.
        const MAINTENANCE     = 1 << 1;
        /// Node is being decommissioned; removed once rebalance completes.
        const DECOMMISSIONING = 1 << 2;
    }
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A cluster node: identity, endpoints, role, and flags.
///
/// Two `Snode`s describe the same registration only when both the ID and all
/// three endpoints match ([`Snode::eq_endpoints`]); flags are runtime state
/// and excluded from that comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snode {
    pub id: NodeId,
    pub public_net: NetInfo,
    pub control_net: NetInfo,
    pub data_net: NetInfo,
    pub role: NodeRole,
    #[serde(default)]
    pub flags: NodeFlags,
}

impl Snode {
    /// Convenience constructor with a single endpoint reused for all three
    /// networks, as in single-NIC deployments.
    pub fn new(id: impl Into<NodeId>, role: NodeRole, net: NetInfo) -> Self {
        Self {
            id: id.into(),
            public_net: net.clone(),
            control_net: net.clone(),
            data_net: net,
            role,
            flags: NodeFlags::empty(),
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.role == NodeRole::Proxy
    }

    pub fn is_target(&self) -> bool {
        self.role == NodeRole::Target
    }

    /// True when the node is flagged maintenance or decommissioning and must
    /// be excluded from placement and rebalance activity.
    pub fn in_maint_or_decomm(&self) -> bool {
        self.flags
            .intersects(NodeFlags::MAINTENANCE | NodeFlags::DECOMMISSIONING)
    }

    pub fn non_electable(&self) -> bool {
        self.flags.contains(NodeFlags::NON_ELECTABLE)
    }

    /// Endpoint-level equality: same ID and same three endpoints.
    pub fn eq_endpoints(&self, other: &Snode) -> bool {
        self.id == other.id
            && self.public_net == other.public_net
            && self.control_net == other.control_net
            && self.data_net == other.data_net
    }
}

impl Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            NodeRole::Proxy => "p",
            NodeRole::Target => "t",
        };
        write!(f, "{}[{}]", role, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, port: u16) -> Snode {
        Snode::new(id, NodeRole::Target, NetInfo::new("10.0.0.1", port))
    }

    #[test]
    fn test_eq_endpoints_ignores_flags() {
        let a = node("t1", 8081);
        let mut b = node("t1", 8081);
        b.flags = NodeFlags::MAINTENANCE;

        assert!(a.eq_endpoints(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_eq_endpoints_detects_renew() {
        let a = node("t1", 8081);
        let b = node("t1", 9091);

        assert!(!a.eq_endpoints(&b));
    }

    #[test]
    fn test_maint_or_decomm() {
        let mut n = node("t1", 8081);
        assert!(!n.in_maint_or_decomm());

        n.flags = NodeFlags::MAINTENANCE;
        assert!(n.in_maint_or_decomm());

        n.flags = NodeFlags::DECOMMISSIONING;
        assert!(n.in_maint_or_decomm());

        n.flags = NodeFlags::NON_ELECTABLE;
        assert!(!n.in_maint_or_decomm());
    }

    #[test]
    fn test_snode_serde_roundtrip() {
        let mut n = node("t1", 8081);
        n.flags = NodeFlags::MAINTENANCE | NodeFlags::DECOMMISSIONING;

        let json = serde_json::to_string(&n).unwrap();
        let back: Snode = serde_json::from_str(&json).unwrap();
        assert_eq!(n, back);
    }
}
