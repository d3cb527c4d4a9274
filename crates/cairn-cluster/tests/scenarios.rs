//! End-to-end membership scenarios over in-memory transports.
//!
//! A `Hub` stands in for the network: metasync batches are applied straight
//! to the peer's stores, probes consult an aliveness table, and node-to-node
//! calls are recorded for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cairn_cluster::{ClusterError, Controller, NodeClient, NotifMsg, NotifRegistry};
use cairn_meta::{Bmd, NodeRegMeta, Rmd, Smap, VersionedStore};
use cairn_metasync::{ApplyHook, MetaReceiver, Metasyncer, SyncBatch, SyncError, SyncNote, SyncTransport};
use cairn_transport::KeepaliveTracker;
use cairn_types::{NetInfo, NodeFlags, NodeId, NodeRole, RmNodeArgs, Snode};
use uuid::Uuid;

// ----------------------------------------------------------------------
// In-memory cluster harness
// ----------------------------------------------------------------------

struct TestNode {
    smap: Arc<VersionedStore<Smap>>,
    rmd: Arc<VersionedStore<Rmd>>,
    receiver: MetaReceiver,
    /// Rebalance rounds this node would have started (RMD adoptions).
    rounds: Arc<Mutex<Vec<u64>>>,
}

struct RoundRecorder(Arc<Mutex<Vec<u64>>>);

impl ApplyHook for RoundRecorder {
    fn on_rmd(&self, rmd: &Arc<Rmd>, _note: &SyncNote) {
        self.0.lock().unwrap().push(rmd.rebalance_id());
    }
}

impl TestNode {
    fn new(id: &str) -> Arc<Self> {
        let smap = Arc::new(VersionedStore::new(Smap::unattached()));
        let rmd = Arc::new(VersionedStore::new(Rmd::unattached()));
        let bmd = Arc::new(VersionedStore::new(Bmd::unattached()));
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let mut receiver = MetaReceiver::new(
            NodeId::from(id),
            Arc::clone(&smap),
            Arc::clone(&rmd),
            Arc::clone(&bmd),
        );
        receiver.add_hook(Arc::new(RoundRecorder(Arc::clone(&rounds))));
        Arc::new(Self {
            smap,
            rmd,
            receiver,
            rounds,
        })
    }
}

#[derive(Default)]
struct Hub {
    nodes: Mutex<HashMap<NodeId, Arc<TestNode>>>,
    /// Nodes that answer probes.
    alive: Mutex<HashSet<NodeId>>,
    /// Handover deliveries as (node, new_primary, prepare).
    handovers: Mutex<Vec<(NodeId, NodeId, bool)>>,
    /// Nodes whose prepare phase is rigged to fail.
    fail_prepare: Mutex<HashSet<NodeId>>,
    rm_self_calls: Mutex<Vec<NodeId>>,
    register_to_calls: Mutex<Vec<NodeId>>,
}

impl Hub {
    fn add_node(&self, id: &str) -> Arc<TestNode> {
        let node = TestNode::new(id);
        self.nodes
            .lock()
            .unwrap()
            .insert(NodeId::from(id), Arc::clone(&node));
        self.alive.lock().unwrap().insert(NodeId::from(id));
        node
    }

    fn set_alive(&self, id: &str, alive: bool) {
        let mut set = self.alive.lock().unwrap();
        if alive {
            set.insert(NodeId::from(id));
        } else {
            set.remove(&NodeId::from(id));
        }
    }
}

#[async_trait]
impl SyncTransport for Hub {
    async fn send(&self, peer: &Snode, batch: &SyncBatch) -> Result<(), SyncError> {
        let node = self.nodes.lock().unwrap().get(&peer.id).cloned();
        let alive = self.alive.lock().unwrap().contains(&peer.id);
        match node {
            Some(node) if alive => {
                node.receiver.apply(batch).await?;
                Ok(())
            }
            _ => Err(SyncError::Transport {
                peer: peer.id.to_string(),
                reason: "unreachable".to_string(),
            }),
        }
    }
}

#[async_trait]
impl NodeClient for Hub {
    async fn probe(&self, node: &Snode) -> bool {
        self.alive.lock().unwrap().contains(&node.id)
    }

    async fn register_to(
        &self,
        candidate: &Snode,
        smap: &Smap,
        _bmd: &Bmd,
    ) -> Result<(), ClusterError> {
        self.register_to_calls.lock().unwrap().push(candidate.id.clone());
        let node = self.nodes.lock().unwrap().get(&candidate.id).cloned();
        match node {
            Some(node) => {
                node.smap.install(smap.clone()).await.ok();
                Ok(())
            }
            None => Err(ClusterError::Transport {
                node: candidate.id.clone(),
                reason: "unreachable".to_string(),
            }),
        }
    }

    async fn rm_self(&self, node: &Snode) -> Result<(), ClusterError> {
        self.rm_self_calls.lock().unwrap().push(node.id.clone());
        Ok(())
    }

    async fn handover(
        &self,
        node: &Snode,
        new_primary: &NodeId,
        prepare: bool,
    ) -> Result<(), ClusterError> {
        if prepare && self.fail_prepare.lock().unwrap().contains(&node.id) {
            return Err(ClusterError::Transport {
                node: node.id.clone(),
                reason: "prepare refused (500)".to_string(),
            });
        }
        self.handovers
            .lock()
            .unwrap()
            .push((node.id.clone(), new_primary.clone(), prepare));
        Ok(())
    }
}

struct Cluster {
    hub: Arc<Hub>,
    controller: Arc<Controller>,
    syncer: Arc<Metasyncer>,
    smap: Arc<VersionedStore<Smap>>,
    rmd: Arc<VersionedStore<Rmd>>,
}

fn proxy(id: &str, port: u16) -> Snode {
    Snode::new(id, NodeRole::Proxy, NetInfo::new("10.1.0.1", port))
}

fn target(id: &str, port: u16) -> Snode {
    Snode::new(id, NodeRole::Target, NetInfo::new("10.1.0.2", port))
}

fn reg(snode: Snode) -> NodeRegMeta {
    NodeRegMeta::new(snode)
}

/// A cluster with primary `p1`, already started.
async fn bootstrap() -> Cluster {
    let hub = Arc::new(Hub::default());
    let uuid = Uuid::new_v4();
    let primary = proxy("p1", 8080);

    let smap = Arc::new(VersionedStore::new(Smap::bootstrap(uuid, primary.clone())));
    let rmd = Arc::new(VersionedStore::new(Rmd::new(uuid)));
    let bmd = Arc::new(VersionedStore::new(Bmd::new(uuid)));

    let syncer = Metasyncer::new(
        NodeId::from("p1"),
        Arc::clone(&smap) as Arc<dyn cairn_meta::SmapSource>,
        Arc::clone(&hub) as Arc<dyn SyncTransport>,
        Arc::new(cairn_metasync::NullDegradedSink),
        Duration::from_millis(5),
        Duration::from_millis(50),
    );
    syncer.become_primary();

    let controller = Controller::new(
        primary,
        true,
        Arc::clone(&smap),
        Arc::clone(&rmd),
        Arc::clone(&bmd),
        Arc::clone(&syncer),
        Arc::clone(&hub) as Arc<dyn NodeClient>,
        Arc::new(NotifRegistry::new()),
        Arc::new(KeepaliveTracker::new(Duration::from_secs(1), 3)),
    );
    controller.mark_started().await;

    Cluster {
        hub,
        controller,
        syncer,
        smap,
        rmd,
    }
}

/// Joins a target and returns the response.
async fn join_target(c: &Cluster, id: &str, port: u16) -> cairn_cluster::JoinResponse {
    c.hub.add_node(id);
    c.controller.join(reg(target(id, port)), false).await.unwrap()
}

async fn settle() {
    // Let spawned sync tasks drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ----------------------------------------------------------------------
// S1 — target join bumps the map and the descriptor, and both replicate
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_target_join_triggers_rebalance_everywhere() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    join_target(&c, "t2", 9002).await;
    settle().await;

    let v_before = c.smap.get().version;
    let r_before = c.rmd.get().rebalance_id();
    assert_eq!(v_before, 3); // bootstrap + two joins

    c.hub.add_node("t3");
    let resp = c.controller.join(reg(target("t3", 9003)), false).await.unwrap();
    settle().await;

    // Map and descriptor moved together.
    assert_eq!(resp.smap_version, v_before + 1);
    assert_eq!(resp.reb_id, Some(r_before + 1));
    assert_eq!(c.smap.get().targets.len(), 3);

    // Every target received both revisions and would start round r+1.
    for id in ["t1", "t2", "t3"] {
        let node = c.hub.nodes.lock().unwrap().get(&NodeId::from(id)).cloned().unwrap();
        assert_eq!(node.smap.get().version, v_before + 1, "{id} smap");
        assert_eq!(node.rmd.get().rebalance_id(), r_before + 1, "{id} rmd");
        assert!(
            node.rounds.lock().unwrap().contains(&(r_before + 1)),
            "{id} should start round {}",
            r_before + 1
        );
    }
    // And t3 is a participant in the new descriptor.
    assert!(c.rmd.get().target_ids.contains(&NodeId::from("t3")));
}

// ----------------------------------------------------------------------
// S2 — duplicate node ID
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_id_rejected_when_original_is_alive() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    let v = c.smap.get().version;

    // Same ID, different endpoint, original still answering probes.
    let err = c.controller.join(reg(target("t1", 9999)), false).await.unwrap_err();
    assert!(matches!(err, ClusterError::DuplicateNodeId(id) if id == NodeId::from("t1")));
    assert_eq!(c.smap.get().version, v, "map unchanged");
}

#[tokio::test]
async fn test_dead_original_is_renewed() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    let v = c.smap.get().version;

    c.hub.set_alive("t1", false);
    let resp = c.controller.join(reg(target("t1", 9999)), false).await.unwrap();

    assert_eq!(resp.smap_version, v + 1);
    let node = c.smap.get().targets.get(&NodeId::from("t1")).cloned().unwrap();
    assert_eq!(node.public_net.port, 9999);
    // Same set of active targets: renewal does not rebalance.
    assert_eq!(resp.reb_id, None);
}

// ----------------------------------------------------------------------
// S3 — graceful decommission
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_decommission_removes_node_after_clean_round() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    join_target(&c, "t2", 9002).await;
    join_target(&c, "t3", 9003).await;
    settle().await;

    let reb_id = c
        .controller
        .decommission(&RmNodeArgs::new("t2"))
        .await
        .unwrap()
        .expect("decommission of an active target must rebalance");

    // Flagged, still in the map, excluded from placement.
    let flagged = c.smap.get().targets.get(&NodeId::from("t2")).cloned().unwrap();
    assert!(flagged.flags.contains(NodeFlags::DECOMMISSIONING));
    assert!(!c.rmd.get().target_ids.contains(&NodeId::from("t2")));

    // The round completes cleanly; the listener finishes the removal.
    let fired = c.controller.notifs().on_status(&NotifMsg {
        id: format!("reb-{reb_id}"),
        node: NodeId::from("t1"),
        err: None,
        aborted: false,
        finished: true,
    });
    assert!(fired);

    // The spawned finalizer needs a moment.
    for _ in 0..50 {
        if !c.smap.get().contains(&NodeId::from("t2")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!c.smap.get().contains(&NodeId::from("t2")));
    assert_eq!(c.hub.rm_self_calls.lock().unwrap().clone(), vec![NodeId::from("t2")]);

    let ids: Vec<String> = c.smap.get().targets.keys().map(ToString::to_string).collect();
    assert_eq!(ids, vec!["t1", "t3"]);
}

#[tokio::test]
async fn test_aborted_round_cancels_removal() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    join_target(&c, "t2", 9002).await;

    let reb_id = c
        .controller
        .decommission(&RmNodeArgs::new("t2"))
        .await
        .unwrap()
        .unwrap();

    c.controller.notifs().on_status(&NotifMsg {
        id: format!("reb-{reb_id}"),
        node: NodeId::from("t1"),
        err: None,
        aborted: true,
        finished: true,
    });
    settle().await;

    // Aborted: the node stays, nobody got told to remove itself.
    assert!(c.smap.get().contains(&NodeId::from("t2")));
    assert!(c.hub.rm_self_calls.lock().unwrap().is_empty());
}

// ----------------------------------------------------------------------
// S4 — handover prepare failure
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_handover_prepare_failure_changes_nothing() {
    let c = bootstrap().await;
    c.hub.add_node("p2");
    c.controller.join(reg(proxy("p2", 8081)), false).await.unwrap();
    let v = c.smap.get().version;

    c.hub.fail_prepare.lock().unwrap().insert(NodeId::from("p2"));
    let err = c.controller.set_primary(&NodeId::from("p2")).await.unwrap_err();

    match err {
        ClusterError::PrepareFailed { node, .. } => assert_eq!(node, NodeId::from("p2")),
        other => panic!("expected PrepareFailed, got {other}"),
    }
    assert_eq!(c.smap.get().version, v);
    assert_eq!(c.smap.get().primary_id, NodeId::from("p1"));
    assert!(!c.controller.in_primary_transition());
    assert!(c.syncer.is_primary(), "old primary keeps its role");
    // No commit phase was ever broadcast.
    assert!(
        c.hub.handovers.lock().unwrap().iter().all(|(_, _, prepare)| *prepare),
        "only prepare deliveries"
    );
}

#[tokio::test]
async fn test_handover_commit_demotes_old_primary() {
    let c = bootstrap().await;
    c.hub.add_node("p2");
    c.controller.join(reg(proxy("p2", 8081)), false).await.unwrap();
    c.hub.add_node("t1");
    c.controller.join(reg(target("t1", 9001)), false).await.unwrap();

    c.controller.set_primary(&NodeId::from("p2")).await.unwrap();

    assert_eq!(c.smap.get().primary_id, NodeId::from("p2"));
    assert!(!c.syncer.is_primary());
    assert!(!c.controller.in_primary_transition());

    // Both phases reached both peers.
    let calls = c.hub.handovers.lock().unwrap().clone();
    let commits: Vec<&NodeId> = calls
        .iter()
        .filter(|(_, _, prepare)| !prepare)
        .map(|(node, _, _)| node)
        .collect();
    assert!(commits.contains(&&NodeId::from("p2")));
    assert!(commits.contains(&&NodeId::from("t1")));
}

#[tokio::test]
async fn test_handover_to_non_electable_is_refused() {
    let c = bootstrap().await;
    c.hub.add_node("p2");
    let mut p2 = proxy("p2", 8081);
    p2.flags = NodeFlags::NON_ELECTABLE;
    c.controller.join(reg(p2), false).await.unwrap();

    let err = c.controller.set_primary(&NodeId::from("p2")).await.unwrap_err();
    assert!(matches!(err, ClusterError::NonElectable(_)));
}

// ----------------------------------------------------------------------
// Idempotence and boundary properties
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_repeated_keepalive_changes_nothing() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    let v = c.smap.get().version;

    let meta = reg(target("t1", 9001));
    assert_eq!(c.controller.keepalive(&meta).await.unwrap(), v);
    assert_eq!(c.controller.keepalive(&meta).await.unwrap(), v);
    assert_eq!(c.smap.get().version, v);
}

#[tokio::test]
async fn test_keepalive_from_unknown_node_is_told_to_register() {
    let c = bootstrap().await;
    let err = c.controller.keepalive(&reg(target("t9", 9009))).await.unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound(_)));
}

#[tokio::test]
async fn test_maintenance_flags_round_trip() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    join_target(&c, "t2", 9002).await;

    c.controller
        .start_maintenance(&RmNodeArgs::new("t1"))
        .await
        .unwrap();
    let flagged = c.smap.get().targets.get(&NodeId::from("t1")).unwrap().flags;

    c.controller.stop_maintenance(&RmNodeArgs::new("t1")).await.unwrap();
    assert!(
        !c.smap.get().targets.get(&NodeId::from("t1")).unwrap().flags
            .contains(NodeFlags::MAINTENANCE)
    );

    c.controller
        .start_maintenance(&RmNodeArgs::new("t1"))
        .await
        .unwrap();
    assert_eq!(
        c.smap.get().targets.get(&NodeId::from("t1")).unwrap().flags,
        flagged
    );
}

#[tokio::test]
async fn test_skip_rebalance_is_honored() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    join_target(&c, "t2", 9002).await;
    let r = c.rmd.get().rebalance_id();

    let mut args = RmNodeArgs::new("t1");
    args.skip_rebalance = true;
    let reb = c.controller.start_maintenance(&args).await.unwrap();

    assert_eq!(reb, None);
    assert_eq!(c.rmd.get().rebalance_id(), r, "descriptor untouched");
}

#[tokio::test]
async fn test_joins_before_startup_replay_exactly_once() {
    let hub = Arc::new(Hub::default());
    let uuid = Uuid::new_v4();
    let primary = proxy("p1", 8080);

    let smap = Arc::new(VersionedStore::new(Smap::bootstrap(uuid, primary.clone())));
    let rmd = Arc::new(VersionedStore::new(Rmd::new(uuid)));
    let bmd = Arc::new(VersionedStore::new(Bmd::new(uuid)));
    let syncer = Metasyncer::new(
        NodeId::from("p1"),
        Arc::clone(&smap) as Arc<dyn cairn_meta::SmapSource>,
        Arc::clone(&hub) as Arc<dyn SyncTransport>,
        Arc::new(cairn_metasync::NullDegradedSink),
        Duration::from_millis(5),
        Duration::from_millis(50),
    );
    syncer.become_primary();
    let controller = Controller::new(
        primary,
        true,
        Arc::clone(&smap),
        rmd,
        bmd,
        syncer,
        Arc::clone(&hub) as Arc<dyn NodeClient>,
        Arc::new(NotifRegistry::new()),
        Arc::new(KeepaliveTracker::new(Duration::from_secs(1), 3)),
    );

    hub.add_node("t1");
    let resp = controller.join(reg(target("t1", 9001)), false).await.unwrap();
    assert!(resp.buffered);
    assert_eq!(smap.get().version, 1, "nothing installed before startup");

    controller.mark_started().await;
    assert_eq!(smap.get().version, 2);
    assert!(smap.get().contains(&NodeId::from("t1")));

    // Marking started again replays nothing.
    controller.mark_started().await;
    assert_eq!(smap.get().version, 2);
}

#[tokio::test]
async fn test_user_register_pushes_state_first_and_returns_reb_id() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    c.hub.add_node("t2");

    let resp = c
        .controller
        .user_register(reg(target("t2", 9002)), false)
        .await
        .unwrap();

    assert_eq!(
        c.hub.register_to_calls.lock().unwrap().clone(),
        vec![NodeId::from("t2")]
    );
    assert!(resp.reb_id.is_some(), "returned immediately, not awaited");
}

#[tokio::test]
async fn test_rm_unknown_node_is_terminal_404() {
    let c = bootstrap().await;
    let err = c.controller.rm_node_final(&NodeId::from("ghost")).await.unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound(_)));
}

#[tokio::test]
async fn test_foreign_cluster_join_is_integrity_error() {
    let c = bootstrap().await;
    c.hub.add_node("t1");

    let mut meta = reg(target("t1", 9001));
    let foreign = Smap::bootstrap(Uuid::new_v4(), proxy("px", 7000));
    meta.smap = Some(foreign);

    let err = c.controller.join(meta, false).await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Meta(cairn_meta::MetaError::UuidMismatch { .. })
    ));
}

// Metasync progress sanity: the second join only replays what each peer
// still misses (no duplicate smap deliveries to already-synced nodes).
#[tokio::test]
async fn test_metasync_delivers_strictly_increasing_versions() {
    let c = bootstrap().await;
    join_target(&c, "t1", 9001).await;
    settle().await;
    join_target(&c, "t2", 9002).await;
    settle().await;

    for id in ["t1", "t2"] {
        let node = c.hub.nodes.lock().unwrap().get(&NodeId::from(id)).cloned().unwrap();
        let version = node.smap.get().version;
        assert_eq!(version, c.smap.get().version, "{id} converged");
    }
}
