//! Control-plane action messages.
//!
//! Mutating cluster verbs arrive as a JSON document
//! `{"action": "...", "value": ...}`. [`ControlAction`] models that document
//! as a sum type so handlers dispatch by variant instead of matching on raw
//! action strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeId;

/// Arguments of the node-removal family of verbs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmNodeArgs {
    pub daemon_id: NodeId,
    /// Suppress the rebalance this membership change would otherwise trigger.
    #[serde(default)]
    pub skip_rebalance: bool,
}

impl RmNodeArgs {
    pub fn new(daemon_id: impl Into<NodeId>) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            skip_rebalance: false,
        }
    }
}

/// Arguments for starting or stopping a named cluster activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XactArgs {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// The kind of removal an action requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmKind {
    /// Flag for maintenance; node stays in the map.
    Maintenance,
    /// Flag, rebalance away, then remove from the map.
    Decommission,
    /// Flag, rebalance away, then power the node down.
    Shutdown,
}

/// A mutating cluster operation, as carried by `PUT /v1/cluster`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "kebab-case")]
pub enum ControlAction {
    /// Set a runtime configuration knob on all nodes.
    SetConfig { name: String, value: Value },
    /// Shut the whole cluster down.
    Shutdown,
    /// Start a named cluster activity.
    XactStart(XactArgs),
    /// Stop a named cluster activity.
    XactStop(XactArgs),
    /// Push the ownership table to a peer cluster.
    SendOwnershipTbl { daemon_id: NodeId },
    StartMaintenance(RmNodeArgs),
    Decommission(RmNodeArgs),
    ShutdownNode(RmNodeArgs),
    StopMaintenance(RmNodeArgs),
    /// Hand the primary role to another proxy.
    SetPrimary { daemon_id: NodeId },
}

impl ControlAction {
    /// Maps the removal verbs onto their [`RmKind`]; `None` for the rest.
    pub fn rm_kind(&self) -> Option<RmKind> {
        match self {
            Self::StartMaintenance(_) => Some(RmKind::Maintenance),
            Self::Decommission(_) => Some(RmKind::Decommission),
            Self::ShutdownNode(_) => Some(RmKind::Shutdown),
            _ => None,
        }
    }

    /// The wire name of the action, as it appears in the JSON `action` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetConfig { .. } => "set-config",
            Self::Shutdown => "shutdown",
            Self::XactStart(_) => "xact-start",
            Self::XactStop(_) => "xact-stop",
            Self::SendOwnershipTbl { .. } => "send-ownership-tbl",
            Self::StartMaintenance(_) => "start-maintenance",
            Self::Decommission(_) => "decommission",
            Self::ShutdownNode(_) => "shutdown-node",
            Self::StopMaintenance(_) => "stop-maintenance",
            Self::SetPrimary { .. } => "set-primary",
        }
    }
}
