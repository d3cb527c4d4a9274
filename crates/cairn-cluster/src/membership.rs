//! The membership controller.
//!
//! Runs on every proxy but only acts on the primary; non-primary proxies
//! forward mutating verbs (the server layer owns the forwarding) or answer
//! with the primary's identity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use cairn_meta::{
    Bmd, FnModify, MetaError, Modify, NodeRegMeta, Rmd, Smap, VersionedStore, validate_uuid,
};
use cairn_metasync::{Metasyncer, SyncNote, SyncPair};
use cairn_transport::KeepaliveTracker;
use cairn_types::{NodeFlags, NodeId, RmNodeArgs, Snode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::notif::{NotifListener, NotifMsg, NotifRegistry};

/// Outbound node-to-node calls the controller needs; implemented over HTTP
/// by the server crate, in memory by the tests.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Liveness probe against a node's control endpoint.
    async fn probe(&self, node: &Snode) -> bool;

    /// Pushes current cluster state to a candidate during `user-register`.
    async fn register_to(
        &self,
        candidate: &Snode,
        smap: &Smap,
        bmd: &Bmd,
    ) -> Result<(), ClusterError>;

    /// Asks a node to remove itself (`DELETE /v1/daemon/{id}` with the
    /// caller-id header set to the node's own ID).
    async fn rm_self(&self, node: &Snode) -> Result<(), ClusterError>;

    /// Delivers one handover phase to a node.
    async fn handover(
        &self,
        node: &Snode,
        new_primary: &NodeId,
        prepare: bool,
    ) -> Result<(), ClusterError>;
}

/// Answer to a join verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub smap_version: u64,
    /// The rebalance round this join triggered, if any. Returned
    /// immediately; the caller does not wait for the round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reb_id: Option<u64>,
    /// The join arrived before cluster startup finished and was queued.
    #[serde(default)]
    pub buffered: bool,
}

/// True iff the map delta moves data: an active target appeared, an active
/// target disappeared, or a target's maintenance state flipped.
pub fn requires_rebalance(old: &Smap, new: &Smap) -> bool {
    for (id, t) in &new.targets {
        match old.targets.get(id) {
            None => {
                if !t.in_maint_or_decomm() {
                    return true;
                }
            }
            Some(prev) => {
                if prev.in_maint_or_decomm() != t.in_maint_or_decomm() {
                    return true;
                }
            }
        }
    }
    old.targets
        .iter()
        .any(|(id, t)| !t.in_maint_or_decomm() && !new.targets.contains_key(id))
}

/// A serialized cluster-map transition: mutate the map, decide on rebalance
/// inside the same critical section, replicate both revisions afterwards.
struct SmapTransition {
    note: SyncNote,
    mutate: Box<dyn FnMut(&mut Smap) -> Result<(), MetaError> + Send>,
    old: Arc<Smap>,
    skip_reb: bool,
    force_reb: bool,
    reb_enabled: bool,
    rmd: Arc<VersionedStore<Rmd>>,
    syncer: Arc<Metasyncer>,
    extra_pairs: Vec<SyncPair>,
    replicate: bool,
    new_rmd: Option<Arc<Rmd>>,
}

#[async_trait]
impl Modify<Smap> for SmapTransition {
    fn pre(&mut self, clone: &mut Smap) -> Result<(), MetaError> {
        (self.mutate)(clone)?;
        clone.validate()
    }

    async fn post(&mut self, installed: &Arc<Smap>) {
        let needed = self.force_reb || requires_rebalance(&self.old, installed);
        if !needed {
            return;
        }
        if self.skip_reb || !self.reb_enabled {
            warn!(
                smap_version = installed.version,
                skip_reb = self.skip_reb,
                "rebalance required but suppressed"
            );
            return;
        }

        // Still under the map lock: the descriptor bump cannot interleave
        // with a competing membership change.
        let smap = Arc::clone(installed);
        let mut bump = FnModify(move |rmd: &mut Rmd| {
            rmd.set_targets_from(&smap);
            Ok(())
        });
        match self.rmd.modify(&mut bump).await {
            Ok(rmd) => self.new_rmd = Some(rmd),
            Err(err) => warn!(%err, "rebalance descriptor bump failed"),
        }
    }

    async fn fin(&mut self, installed: &Arc<Smap>) {
        if !self.replicate {
            return;
        }
        let mut pairs = Vec::with_capacity(2 + self.extra_pairs.len());
        match SyncPair::of(&**installed, self.note.clone()) {
            Ok(pair) => pairs.push(pair),
            Err(err) => warn!(%err, "smap revision not serializable"),
        }
        if let Some(rmd) = &self.new_rmd {
            match SyncPair::of(&**rmd, self.note.clone()) {
                Ok(pair) => pairs.push(pair),
                Err(err) => warn!(%err, "rmd revision not serializable"),
            }
        }
        pairs.append(&mut self.extra_pairs);
        // Fire-and-track: the syncer retries stragglers on its own.
        let _join = self.syncer.sync(pairs);
    }
}

/// The primary-side membership state machine.
pub struct Controller {
    self_node: Snode,
    reb_enabled: bool,
    smap: Arc<VersionedStore<Smap>>,
    rmd: Arc<VersionedStore<Rmd>>,
    bmd: Arc<VersionedStore<Bmd>>,
    syncer: Arc<Metasyncer>,
    client: Arc<dyn NodeClient>,
    notifs: Arc<NotifRegistry>,
    keepalive: Arc<KeepaliveTracker>,
    started: AtomicBool,
    in_transition: AtomicBool,
    pending_joins: Mutex<Vec<(NodeRegMeta, bool)>>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_node: Snode,
        reb_enabled: bool,
        smap: Arc<VersionedStore<Smap>>,
        rmd: Arc<VersionedStore<Rmd>>,
        bmd: Arc<VersionedStore<Bmd>>,
        syncer: Arc<Metasyncer>,
        client: Arc<dyn NodeClient>,
        notifs: Arc<NotifRegistry>,
        keepalive: Arc<KeepaliveTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_node,
            reb_enabled,
            smap,
            rmd,
            bmd,
            syncer,
            client,
            notifs,
            keepalive,
            started: AtomicBool::new(false),
            in_transition: AtomicBool::new(false),
            pending_joins: Mutex::new(Vec::new()),
        })
    }

    pub fn cluster_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn in_primary_transition(&self) -> bool {
        self.in_transition.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_transition(&self, on: bool) {
        self.in_transition.store(on, Ordering::SeqCst);
    }

    pub fn notifs(&self) -> &Arc<NotifRegistry> {
        &self.notifs
    }

    pub(crate) fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub(crate) fn syncer(&self) -> &Arc<Metasyncer> {
        &self.syncer
    }

    pub(crate) fn smap_store(&self) -> &Arc<VersionedStore<Smap>> {
        &self.smap
    }

    pub(crate) fn self_id(&self) -> &NodeId {
        &self.self_node.id
    }

    /// Errors with the primary's identity unless this proxy is it.
    pub fn ensure_primary(&self) -> Result<(), ClusterError> {
        let smap = self.smap.get();
        if smap.version == 0 || smap.is_primary(&self.self_node.id) {
            return Ok(());
        }
        let (primary, url) = match smap.primary() {
            Some(p) => (p.id.clone(), p.control_net.url()),
            None => (smap.primary_id.clone(), String::new()),
        };
        Err(ClusterError::NotPrimary { primary, url })
    }

    /// Flips the cluster to started and replays joins that arrived early,
    /// each exactly once.
    pub async fn mark_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<(NodeRegMeta, bool)> = {
            let mut pending = match self.pending_joins.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.drain(..).collect()
        };
        info!(replayed = pending.len(), "cluster started");
        for (meta, skip_reb) in pending {
            if let Err(err) = self.join(meta, skip_reb).await {
                warn!(%err, "buffered join failed on replay");
            }
        }
    }

    // ------------------------------------------------------------------
    // Join verbs
    // ------------------------------------------------------------------

    /// `self-register` / `autoreg`: a node announces itself.
    pub async fn join(
        &self,
        meta: NodeRegMeta,
        skip_reb: bool,
    ) -> Result<JoinResponse, ClusterError> {
        let smap = self.smap.get();

        // Too early: queue for replay at startup.
        if !self.cluster_started() {
            debug!(node = %meta.snode.id, "join buffered until cluster start");
            let version = smap.version;
            if let Ok(mut pending) = self.pending_joins.lock() {
                pending.push((meta, skip_reb));
            }
            return Ok(JoinResponse {
                smap_version: version,
                reb_id: None,
                buffered: true,
            });
        }

        // Foreign-cluster joins are integrity errors, never silent.
        if let Some(their_smap) = &meta.smap {
            if their_smap.version > 0 && smap.version > 0 {
                validate_uuid(smap.uuid, their_smap.uuid, &self.self_node.id, &meta.snode.id)
                    .map_err(ClusterError::Meta)?;
            }
        }

        // Duplicate-ID detection and renewal.
        if let Some(existing) = smap.get_node(&meta.snode.id) {
            if existing.eq_endpoints(&meta.snode) {
                // Same node, same endpoints: refresh liveness, change nothing.
                self.keepalive.heard_from(&meta.snode.id);
                return Ok(JoinResponse {
                    smap_version: smap.version,
                    reb_id: None,
                    buffered: false,
                });
            }
            if self.client.probe(existing).await {
                warn!(node = %meta.snode.id, "join rejected: duplicate node ID");
                return Err(ClusterError::DuplicateNodeId(meta.snode.id.clone()));
            }
            info!(node = %meta.snode.id, "renewing registration at new endpoints");
        }

        let force_reb = meta.reb && meta.snode.is_target();
        let snode = meta.snode.clone();
        let action = if snode.is_target() { "join-target" } else { "join-proxy" };

        // Pre-announce a target join so peers can warm up (get-from-neighbor
        // readiness) before the committed map lands.
        if snode.is_target() {
            if let Ok(pair) = SyncPair::of(&*smap, SyncNote::about("pre-join", snode.id.clone())) {
                self.syncer.notify(false, vec![pair]).await;
            }
        }

        let bmd_pair = SyncPair::of(&*self.bmd.get(), SyncNote::about(action, snode.id.clone()))
            .map_err(|err| warn!(%err, "bmd pair skipped"))
            .ok();

        let mut transition = self.transition(
            SyncNote::about(action, snode.id.clone()),
            smap,
            skip_reb,
            force_reb,
        );
        transition.extra_pairs.extend(bmd_pair);
        transition.mutate = Box::new(move |map: &mut Smap| {
            map.put_node(snode.clone());
            Ok(())
        });

        let installed = self.smap.modify(&mut transition).await?;
        self.keepalive.heard_from(&meta.snode.id);
        info!(node = %meta.snode.id, smap_version = installed.version, "node joined");

        Ok(JoinResponse {
            smap_version: installed.version,
            reb_id: transition.new_rmd.as_ref().map(|rmd| rmd.rebalance_id()),
            buffered: false,
        })
    }

    /// `user-register`: administrator-initiated join. The primary first
    /// hands the candidate the current cluster state, then registers it.
    /// Returns the rebalance ID immediately rather than waiting on it.
    pub async fn user_register(
        &self,
        meta: NodeRegMeta,
        skip_reb: bool,
    ) -> Result<JoinResponse, ClusterError> {
        let smap = self.smap.get();
        let bmd = self.bmd.get();
        self.client.register_to(&meta.snode, &smap, &bmd).await?;
        self.join(meta, skip_reb).await
    }

    /// Periodic liveness refresh. Unknown nodes are told to re-register;
    /// endpoint changes renew through the join path; during a primary
    /// transition keepalives are dropped without effect.
    pub async fn keepalive(&self, meta: &NodeRegMeta) -> Result<u64, ClusterError> {
        let smap = self.smap.get();
        if self.in_primary_transition() {
            return Ok(smap.version);
        }

        match smap.get_node(&meta.snode.id) {
            None => Err(ClusterError::NodeNotFound(meta.snode.id.clone())),
            Some(existing) if existing.eq_endpoints(&meta.snode) => {
                self.keepalive.heard_from(&meta.snode.id);
                Ok(smap.version)
            }
            Some(_) => {
                debug!(node = %meta.snode.id, "keepalive with changed endpoints, renewing");
                let resp = self.join(meta.clone(), false).await?;
                Ok(resp.smap_version)
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance / removal verbs
    // ------------------------------------------------------------------

    /// Flags a node for maintenance; data rebalances away from targets.
    pub async fn start_maintenance(
        &self,
        args: &RmNodeArgs,
    ) -> Result<Option<u64>, ClusterError> {
        self.flag_node(
            &args.daemon_id,
            NodeFlags::MAINTENANCE,
            NodeFlags::empty(),
            args.skip_rebalance,
            "start-maintenance",
        )
        .await
    }

    /// Clears maintenance flags; data may rebalance back.
    pub async fn stop_maintenance(&self, args: &RmNodeArgs) -> Result<Option<u64>, ClusterError> {
        self.flag_node(
            &args.daemon_id,
            NodeFlags::empty(),
            NodeFlags::MAINTENANCE | NodeFlags::DECOMMISSIONING,
            args.skip_rebalance,
            "stop-maintenance",
        )
        .await
    }

    /// Flags the node, rebalances its data away, and removes it from the map
    /// once the round completes cleanly.
    pub async fn decommission(
        self: &Arc<Self>,
        args: &RmNodeArgs,
    ) -> Result<Option<u64>, ClusterError> {
        let reb_id = self
            .flag_node(
                &args.daemon_id,
                NodeFlags::MAINTENANCE | NodeFlags::DECOMMISSIONING,
                NodeFlags::empty(),
                args.skip_rebalance,
                "decommission",
            )
            .await?;

        match reb_id {
            Some(reb_id) => {
                self.watch_removal(reb_id, &args.daemon_id, true);
            }
            // Nothing to move (or the caller suppressed the move): the node
            // goes right away.
            None => self.finalize_removal(&args.daemon_id, true).await,
        }
        Ok(reb_id)
    }

    /// Like decommission, but the node powers down and stays in the map
    /// flagged for maintenance.
    pub async fn shutdown_node(
        self: &Arc<Self>,
        args: &RmNodeArgs,
    ) -> Result<Option<u64>, ClusterError> {
        let reb_id = self
            .flag_node(
                &args.daemon_id,
                NodeFlags::MAINTENANCE,
                NodeFlags::empty(),
                args.skip_rebalance,
                "shutdown-node",
            )
            .await?;

        match reb_id {
            Some(reb_id) => self.watch_removal(reb_id, &args.daemon_id, false),
            None => self.finalize_removal(&args.daemon_id, false).await,
        }
        Ok(reb_id)
    }

    /// Administratively forced rebalance (`xact-start rebalance`): bumps the
    /// descriptor against the current map and replicates it.
    pub async fn force_rebalance(&self) -> Result<u64, ClusterError> {
        let smap = self.smap.get();
        let targets = Arc::clone(&smap);
        let rmd = self
            .rmd
            .modify(&mut FnModify(move |rmd: &mut Rmd| {
                rmd.set_targets_from(&targets);
                Ok(())
            }))
            .await?;

        match SyncPair::of(&*rmd, SyncNote::new("xact-start-rebalance")) {
            Ok(pair) => {
                let _join = self.syncer.sync(vec![pair]);
            }
            Err(err) => warn!(%err, "rmd revision not serializable"),
        }
        info!(reb_id = rmd.rebalance_id(), "rebalance forced");
        Ok(rmd.rebalance_id())
    }

    /// Final removal from the map; 404 when unknown.
    pub async fn rm_node_final(&self, id: &NodeId) -> Result<(), ClusterError> {
        let smap = self.smap.get();
        if !smap.contains(id) {
            return Err(ClusterError::NodeNotFound(id.clone()));
        }

        let victim = id.clone();
        let mut transition = self.transition(
            SyncNote::about("rm-node", id.clone()),
            smap,
            // The data already moved while the node sat in maintenance.
            true,
            false,
        );
        transition.mutate = Box::new(move |map: &mut Smap| {
            map.del_node(&victim)?;
            Ok(())
        });
        self.smap.modify(&mut transition).await?;

        self.keepalive.forget(id);
        info!(node = %id, "node removed from cluster map");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn transition(
        &self,
        note: SyncNote,
        old: Arc<Smap>,
        skip_reb: bool,
        force_reb: bool,
    ) -> SmapTransition {
        SmapTransition {
            note,
            mutate: Box::new(|_map| Ok(())),
            old,
            skip_reb,
            force_reb,
            reb_enabled: self.reb_enabled,
            rmd: Arc::clone(&self.rmd),
            syncer: Arc::clone(&self.syncer),
            extra_pairs: Vec::new(),
            replicate: true,
            new_rmd: None,
        }
    }

    async fn flag_node(
        &self,
        id: &NodeId,
        add: NodeFlags,
        remove: NodeFlags,
        skip_reb: bool,
        action: &str,
    ) -> Result<Option<u64>, ClusterError> {
        let smap = self.smap.get();
        if !smap.contains(id) {
            return Err(ClusterError::NodeNotFound(id.clone()));
        }

        let victim = id.clone();
        let mut transition =
            self.transition(SyncNote::about(action, id.clone()), smap, skip_reb, false);
        transition.mutate = Box::new(move |map: &mut Smap| {
            let node = map
                .proxies
                .get_mut(&victim)
                .or_else(|| map.targets.get_mut(&victim))
                .ok_or_else(|| MetaError::Rejected(format!("node {victim} not in map")))?;
            let mut flags = node.flags;
            flags.insert(add);
            flags.remove(remove);
            if flags == node.flags {
                return Err(MetaError::NoChange(format!("{victim}: flags unchanged")));
            }
            node.flags = flags;
            Ok(())
        });

        match self.smap.modify(&mut transition).await {
            Ok(installed) => {
                info!(node = %id, action, smap_version = installed.version, "flags updated");
                Ok(transition.new_rmd.as_ref().map(|rmd| rmd.rebalance_id()))
            }
            Err(err) if err.is_no_change() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Registers the completion listener that finishes a removal once the
    /// round ends cleanly (not aborted, no error).
    fn watch_removal(self: &Arc<Self>, reb_id: u64, id: &NodeId, rm_from_map: bool) {
        let weak: Weak<Controller> = Arc::downgrade(self);
        let victim = id.clone();
        let ic = self.smap.get().staff_ic();

        let listener = NotifListener::new(format!("reb-{reb_id}"), "rebalance", ic)
            .with_callback(move |msg: &NotifMsg| {
                if msg.aborted || msg.err.is_some() {
                    warn!(
                        node = %victim,
                        aborted = msg.aborted,
                        err = msg.err.as_deref().unwrap_or(""),
                        "removal canceled: rebalance did not finish cleanly"
                    );
                    return;
                }
                let Some(ctrl) = weak.upgrade() else {
                    return;
                };
                let victim = victim.clone();
                tokio::spawn(async move {
                    ctrl.finalize_removal(&victim, rm_from_map).await;
                });
            });
        self.notifs.register(listener);
    }

    async fn finalize_removal(&self, id: &NodeId, rm_from_map: bool) {
        let smap = self.smap.get();
        if let Some(node) = smap.get_node(id) {
            if let Err(err) = self.client.rm_self(node).await {
                warn!(node = %id, %err, "rm-self call failed");
            }
        }
        if rm_from_map {
            if let Err(err) = self.rm_node_final(id).await {
                warn!(node = %id, %err, "final removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cairn_types::{NetInfo, NodeRole};
    use test_case::test_case;
    use uuid::Uuid;

    use super::*;

    fn smap_of(targets: &[(&str, bool)]) -> Smap {
        let mut m = Smap::bootstrap(
            Uuid::nil(),
            Snode::new("p1", NodeRole::Proxy, NetInfo::new("h", 8080)),
        );
        for (i, (id, maint)) in targets.iter().enumerate() {
            let mut t = Snode::new(*id, NodeRole::Target, NetInfo::new("h", 9000 + i as u16));
            if *maint {
                t.flags = NodeFlags::MAINTENANCE;
            }
            m.put_node(t);
        }
        m
    }

    #[test_case(&[("t1", false)], &[("t1", false), ("t2", false)], true; "active target added")]
    #[test_case(&[("t1", false), ("t2", false)], &[("t1", false)], true; "active target removed")]
    #[test_case(&[("t1", false)], &[("t1", true)], true; "maintenance flag set")]
    #[test_case(&[("t1", true)], &[("t1", false)], true; "maintenance flag cleared")]
    #[test_case(&[("t1", false)], &[("t1", false)], false; "no delta")]
    #[test_case(&[("t1", false)], &[("t1", false), ("t2", true)], false; "inactive target added")]
    #[test_case(&[("t1", false), ("t2", true)], &[("t1", false)], false; "inactive target removed")]
    #[test_case(&[], &[("t1", true)], false; "join straight into maintenance")]
    fn test_requires_rebalance(old: &[(&str, bool)], new: &[(&str, bool)], expect: bool) {
        assert_eq!(requires_rebalance(&smap_of(old), &smap_of(new)), expect);
    }
}
