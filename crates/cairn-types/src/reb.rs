//! Rebalance status as exchanged between targets.

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Position within a rebalance round. Advances monotonically per round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    #[default]
    Init,
    Traverse,
    EcNamespace,
    WaitAck,
    Fin,
    Done,
    Aborted,
}

impl Stage {
    /// True for the stages a round can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Aborted)
    }
}

/// A target's view of its current round, served by
/// `GET /v1/health?reb-status=true` and pushed on stage transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RebStatus {
    /// Round identifier; the rebalance-descriptor version that started it.
    pub reb_id: u64,
    pub stage: Stage,
    pub aborted: bool,
    /// No data movement in flight on this target.
    pub quiescent: bool,
    /// Targets this node still awaits object acks from.
    #[serde(default)]
    pub targets: Vec<NodeId>,
}

impl RebStatus {
    /// True when this status proves the reporter no longer needs anything
    /// from `peer`: it finished, or it is not waiting on that peer's acks.
    pub fn releases(&self, peer: &NodeId) -> bool {
        self.stage >= Stage::Fin || !self.targets.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::Init < Stage::Traverse);
        assert!(Stage::Traverse < Stage::WaitAck);
        assert!(Stage::WaitAck < Stage::Fin);
        assert!(Stage::Fin < Stage::Done);
    }

    #[test]
    fn test_terminal_stages() {
        assert!(Stage::Done.is_terminal());
        assert!(Stage::Aborted.is_terminal());
        assert!(!Stage::Fin.is_terminal());
    }

    #[test]
    fn test_releases() {
        let me = NodeId::from("t1");
        let status = RebStatus {
            reb_id: 7,
            stage: Stage::WaitAck,
            targets: vec![NodeId::from("t2")],
            ..RebStatus::default()
        };
        // Still in WaitAck but not waiting on t1.
        assert!(status.releases(&me));
        assert!(!status.releases(&NodeId::from("t2")));

        let done = RebStatus {
            stage: Stage::Fin,
            targets: vec![me.clone()],
            ..RebStatus::default()
        };
        assert!(done.releases(&me));
    }
}
