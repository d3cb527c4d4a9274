//! Join-request payload.

use cairn_types::Snode;
use serde::{Deserialize, Serialize};

use crate::bmd::Bmd;
use crate::smap::Smap;

/// Body of the join verbs (`user-register`, `autoreg`, renewing keepalive).
///
/// The candidate advertises its identity plus whatever cluster state it
/// already knows, so the primary can detect foreign-cluster joins and decide
/// whether the newcomer needs a rebalance to pick up its share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegMeta {
    pub snode: Snode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smap: Option<Smap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmd: Option<Bmd>,
    /// "needs-rebalance" bit: the node carries data from a prior life.
    #[serde(default)]
    pub reb: bool,
}

impl NodeRegMeta {
    pub fn new(snode: Snode) -> Self {
        Self {
            snode,
            smap: None,
            bmd: None,
            reb: false,
        }
    }
}
