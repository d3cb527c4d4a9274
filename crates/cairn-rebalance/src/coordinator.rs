//! The round coordinator.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cairn_config::{RebalanceConfig, TimeoutConfig};
use cairn_meta::{Rmd, SmapSource, locate_id};
use cairn_types::{NodeId, RebStatus, Snode, Stage};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RebError;
use crate::seams::{Inventory, Mover, SendOutcome, StatusProbe};

/// Knobs the coordinator reads. Assembled by the daemon from its config.
#[derive(Debug, Clone)]
pub struct RebConfig {
    pub timeouts: TimeoutConfig,
    pub rebalance: RebalanceConfig,
    pub max_bcast_parallel: usize,
    /// Run the erasure-coding namespace stage after traverse.
    pub ec_namespace: bool,
}

impl RebConfig {
    /// Budget for waiting on peers to open their receive side.
    fn rx_ready_budget(&self) -> Duration {
        self.rebalance.dest_retry_time() * 3 / 2
    }
}

/// Bootstrap ping attempts per peer, spaced `cplane_operation` apart.
const PING_ATTEMPTS: u32 = 4;

struct Round {
    reb_id: u64,
    stage: Stage,
    /// Map version the round started under; a newer map supersedes it.
    smap_version: u64,
    /// Participating targets as named by the descriptor, self excluded.
    peers: Vec<NodeId>,
    /// Unacked objects per destination.
    pending: HashMap<NodeId, HashSet<String>>,
    /// Best-known peer progress, max-merged from pushes and pulls.
    peer_stage: HashMap<NodeId, Stage>,
    aborted: bool,
    abort_tx: watch::Sender<bool>,
}

impl Round {
    fn idle() -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            reb_id: 0,
            stage: Stage::Done,
            smap_version: 0,
            peers: Vec::new(),
            pending: HashMap::new(),
            peer_stage: HashMap::new(),
            aborted: false,
            abort_tx,
        }
    }

    fn status(&self, _self_id: &NodeId) -> RebStatus {
        RebStatus {
            reb_id: self.reb_id,
            stage: self.stage,
            aborted: self.aborted,
            quiescent: self.stage >= Stage::WaitAck && self.pending.values().all(HashSet::is_empty),
            targets: self
                .pending
                .iter()
                .filter(|(_, objs)| !objs.is_empty())
                .map(|(id, _)| id.clone())
                .collect(),
        }
    }
}

/// Drives rebalance rounds on one target.
///
/// A new round is started by [`RebCoordinator::run_round`] whenever a newer
/// rebalance descriptor is adopted; at most one round is live at a time and
/// starting a newer one aborts the incumbent.
pub struct RebCoordinator {
    self_id: NodeId,
    cfg: RebConfig,
    smap: Arc<dyn SmapSource>,
    probe: Arc<dyn StatusProbe>,
    mover: Arc<dyn Mover>,
    inventory: Arc<dyn Inventory>,
    round: Mutex<Round>,
}

impl RebCoordinator {
    pub fn new(
        self_id: NodeId,
        cfg: RebConfig,
        smap: Arc<dyn SmapSource>,
        probe: Arc<dyn StatusProbe>,
        mover: Arc<dyn Mover>,
        inventory: Arc<dyn Inventory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            cfg,
            smap,
            probe,
            mover,
            inventory,
            round: Mutex::new(Round::idle()),
        })
    }

    /// Current round status, served over the health endpoint.
    pub fn status(&self) -> RebStatus {
        self.lock().status(&self.self_id)
    }

    // ------------------------------------------------------------------
    // Round lifecycle
    // ------------------------------------------------------------------

    /// Runs the round named by `rmd` to completion.
    ///
    /// Returns the terminal stage, or an error when the round never started
    /// (stale descriptor) or died on the way.
    pub async fn run_round(self: &Arc<Self>, rmd: &Rmd) -> Result<Stage, RebError> {
        let reb_id = rmd.rebalance_id();
        let mut abort_rx = self.begin_round(reb_id, &rmd.target_ids)?;
        info!(node = %self.self_id, reb_id, "rebalance: round starting");

        let result = self.drive(reb_id, &mut abort_rx).await;
        match &result {
            Ok(stage) => info!(node = %self.self_id, reb_id, ?stage, "rebalance: round finished"),
            Err(err) => warn!(node = %self.self_id, reb_id, %err, "rebalance: round failed"),
        }
        result
    }

    fn begin_round(&self, reb_id: u64, targets: &[NodeId]) -> Result<watch::Receiver<bool>, RebError> {
        let mut round = self.lock();
        if reb_id <= round.reb_id {
            return Err(RebError::StaleRound(reb_id));
        }
        if !round.stage.is_terminal() {
            debug!(old = round.reb_id, new = reb_id, "rebalance: superseding live round");
            round.aborted = true;
            let _ = round.abort_tx.send(true);
        }

        let (abort_tx, abort_rx) = watch::channel(false);
        *round = Round {
            reb_id,
            stage: Stage::Init,
            smap_version: self.smap.smap().version,
            peers: targets.iter().filter(|id| **id != self.self_id).cloned().collect(),
            pending: HashMap::new(),
            peer_stage: HashMap::new(),
            aborted: false,
            abort_tx,
        };
        Ok(abort_rx)
    }

    async fn drive(
        self: &Arc<Self>,
        reb_id: u64,
        abort_rx: &mut watch::Receiver<bool>,
    ) -> Result<Stage, RebError> {
        // Bootstrap: make sure every peer answers at all.
        self.ping_peers(reb_id).await?;

        self.advance(reb_id, Stage::Traverse)?;
        self.push_stage_to_peers(reb_id).await;

        // Peers must be receiving before we start streaming at them.
        self.wait_peers_stage(reb_id, Stage::Traverse, self.cfg.rx_ready_budget(), "rx-ready", abort_rx)
            .await
            .inspect_err(|_| {
                self.abort_local(reb_id, "peers not rx-ready", false);
            })?;

        self.traverse(reb_id, abort_rx).await?;

        if self.cfg.ec_namespace {
            self.advance(reb_id, Stage::EcNamespace)?;
            self.push_stage_to_peers(reb_id).await;
        }

        self.advance(reb_id, Stage::WaitAck)?;
        self.push_stage_to_peers(reb_id).await;
        self.wait_acks(reb_id, abort_rx).await?;

        self.advance(reb_id, Stage::Fin)?;
        self.push_stage_to_peers(reb_id).await;
        self.wait_fin_extended(reb_id, abort_rx).await;

        self.advance(reb_id, Stage::Done)?;
        Ok(Stage::Done)
    }

    /// Monotonic stage transition; fails once the round is gone or aborted.
    fn advance(&self, reb_id: u64, next: Stage) -> Result<(), RebError> {
        let mut round = self.lock();
        if round.reb_id != reb_id || round.aborted {
            return Err(RebError::Aborted {
                reb_id,
                reason: "superseded or aborted".to_string(),
            });
        }
        debug_assert!(next > round.stage, "stage must advance");
        debug!(node = %self.self_id, reb_id, from = ?round.stage, to = ?next, "rebalance: stage");
        round.stage = next;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stage bodies
    // ------------------------------------------------------------------

    async fn ping_peers(self: &Arc<Self>, reb_id: u64) -> Result<(), RebError> {
        let peers = self.peer_snodes(reb_id);
        let this = Arc::clone(self);
        let failed = cairn_transport::bcast(peers, self.cfg.max_bcast_parallel, move |peer| {
            let this = Arc::clone(&this);
            async move { this.ping_one(reb_id, &peer).await }
        })
        .await;

        if failed > 0 {
            self.abort_and_broadcast(reb_id, "unreachable peers at bootstrap").await;
            return Err(RebError::PeersNotReady {
                reb_id,
                what: "bootstrap ping",
            });
        }
        Ok(())
    }

    async fn ping_one(&self, reb_id: u64, peer: &Snode) -> bool {
        for attempt in 0..PING_ATTEMPTS {
            // A newer map supersedes this round; stop burning probes on it.
            if self.smap.smap().version > self.round_smap_version(reb_id) {
                return true;
            }
            match self.probe.reb_status(peer).await {
                Ok(_) => return true,
                Err(err) => {
                    debug!(node = %peer.id, attempt, %err, "rebalance: ping failed");
                    if attempt + 1 < PING_ATTEMPTS {
                        tokio::time::sleep(self.cfg.timeouts.cplane_operation()).await;
                    }
                }
            }
        }
        false
    }

    async fn traverse(
        self: &Arc<Self>,
        reb_id: u64,
        abort_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), RebError> {
        let smap = self.smap.smap();
        let mut moved = 0usize;
        let mut errors = 0usize;

        for obj in self.inventory.objects() {
            if *abort_rx.borrow() {
                return Err(RebError::Aborted {
                    reb_id,
                    reason: "abort during traverse".to_string(),
                });
            }

            let Some(owner) = locate_id(&obj, &smap) else {
                continue;
            };
            if owner == self.self_id {
                continue;
            }
            let Some(dest) = smap.get_node(&owner).cloned() else {
                continue;
            };

            match self.mover.send(&dest, &obj).await {
                Ok(SendOutcome::Sent) => {
                    moved += 1;
                    let mut round = self.lock();
                    if round.reb_id == reb_id {
                        round.pending.entry(owner).or_default().insert(obj);
                    }
                }
                // Deleted between traverse and send; the new owner has
                // nothing to miss.
                Ok(SendOutcome::NotFound) => {}
                Err(err) => {
                    errors += 1;
                    warn!(node = %self.self_id, obj, dest = %dest.id, %err, "rebalance: send failed");
                }
            }
        }

        info!(node = %self.self_id, reb_id, moved, errors, "rebalance: traverse done");
        Ok(())
    }

    async fn wait_acks(
        self: &Arc<Self>,
        reb_id: u64,
        abort_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), RebError> {
        loop {
            let waiting_on: Vec<NodeId> = {
                let mut round = self.lock();
                if round.reb_id != reb_id || round.aborted {
                    return Err(RebError::Aborted {
                        reb_id,
                        reason: "abort during wait-ack".to_string(),
                    });
                }
                // A peer that reached Fin no longer needs our unacked
                // objects; its pending set is logically satisfied.
                let finished: Vec<NodeId> = round
                    .pending
                    .keys()
                    .filter(|id| round.peer_stage.get(*id).copied().unwrap_or(Stage::Init) >= Stage::Fin)
                    .cloned()
                    .collect();
                for id in finished {
                    round.pending.remove(&id);
                }
                round.pending.retain(|_, objs| !objs.is_empty());

                if round.pending.is_empty() {
                    return Ok(());
                }
                round.pending.keys().cloned().collect()
            };

            // Pull the laggards we have no pushed progress for.
            for id in waiting_on {
                if self.known_stage(reb_id, &id) >= Stage::Fin {
                    continue;
                }
                if let Some(peer) = self.smap.smap().get_node(&id).cloned() {
                    if let Some(status) = self.check_glob_status(&peer).await {
                        self.observe_status(&id, &status).await;
                    }
                }
            }

            if self.aborted_after(abort_rx, self.cfg.timeouts.keepalive_retry()).await {
                return Err(RebError::Aborted {
                    reb_id,
                    reason: "abort during wait-ack".to_string(),
                });
            }
        }
    }

    /// Waits for the stragglers after reaching `Fin`.
    ///
    /// Bounded by the destination-retry budget per peer; a peer that is
    /// provably not waiting for any ack from us counts as done even if it
    /// has not reached `Fin` itself.
    async fn wait_fin_extended(self: &Arc<Self>, reb_id: u64, _abort_rx: &mut watch::Receiver<bool>) {
        let peers = self.peer_snodes(reb_id);
        let this = Arc::clone(self);
        let failed = cairn_transport::bcast(peers, self.cfg.max_bcast_parallel, move |peer| {
            let this = Arc::clone(&this);
            async move { this.wait_fin_one(reb_id, &peer).await }
        })
        .await;

        if failed > 0 {
            warn!(node = %self.self_id, reb_id, laggards = failed, "rebalance: finishing with unfinished peers");
        }
    }

    async fn wait_fin_one(self: &Arc<Self>, reb_id: u64, peer: &Snode) -> bool {
        let deadline = tokio::time::Instant::now() + self.cfg.rebalance.dest_retry_time();
        loop {
            if self.known_stage(reb_id, &peer.id) >= Stage::Fin {
                return true;
            }
            if let Some(status) = self.check_glob_status(peer).await {
                self.observe_status(&peer.id, &status).await;
                if status.reb_id == reb_id && status.releases(&self.self_id) {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.cfg.timeouts.keepalive_retry()).await;
        }
    }

    // ------------------------------------------------------------------
    // Status exchange
    // ------------------------------------------------------------------

    /// Pulls one peer's status; a transport error is retried exactly once
    /// after a keepalive-retry sleep.
    async fn check_glob_status(&self, peer: &Snode) -> Option<RebStatus> {
        match self.probe.reb_status(peer).await {
            Ok(status) => Some(status),
            Err(err) => {
                debug!(node = %peer.id, %err, "rebalance: status probe failed, retrying once");
                tokio::time::sleep(self.cfg.timeouts.keepalive_retry()).await;
                match self.probe.reb_status(peer).await {
                    Ok(status) => Some(status),
                    Err(err) => {
                        warn!(node = %peer.id, %err, "rebalance: status probe failed");
                        None
                    }
                }
            }
        }
    }

    /// Digests a peer's status: merges pushed/pulled progress and applies the
    /// epoch rules.
    pub async fn observe_status(self: &Arc<Self>, from: &NodeId, status: &RebStatus) {
        let (local_reb_id, live) = {
            let round = self.lock();
            (round.reb_id, !round.stage.is_terminal())
        };

        if status.reb_id > local_reb_id {
            if live {
                // Our round is stale; kill it and tell everyone else.
                info!(node = %self.self_id, local_reb_id, peer_reb_id = status.reb_id, peer = %from,
                    "rebalance: newer round seen, aborting");
                self.abort_and_broadcast(local_reb_id, "superseded by newer round").await;
            }
            return;
        }
        if status.reb_id < local_reb_id {
            debug!(node = %self.self_id, peer = %from, peer_reb_id = status.reb_id,
                "rebalance: peer lagging behind");
            return;
        }

        let mut round = self.lock();
        if round.reb_id != status.reb_id {
            return;
        }
        // Observed progress never regresses.
        let slot = round.peer_stage.entry(from.clone()).or_insert(Stage::Init);
        if status.stage > *slot {
            *slot = status.stage;
        }
        if status.aborted && !round.aborted {
            // The peer already broadcast this abort; no re-broadcast.
            round.aborted = true;
            round.stage = Stage::Aborted;
            let _ = round.abort_tx.send(true);
            info!(node = %self.self_id, reb_id = round.reb_id, peer = %from, "rebalance: abort propagated");
        }
    }

    /// An ack from `dest`: the object it received from us is committed.
    pub fn ack(&self, dest: &NodeId, obj: &str) {
        let mut round = self.lock();
        if let Some(objs) = round.pending.get_mut(dest) {
            objs.remove(obj);
            if objs.is_empty() {
                round.pending.remove(dest);
            }
        }
    }

    /// Handles a remote abort notification for `reb_id`.
    pub fn on_abort(&self, reb_id: u64) {
        self.abort_local(reb_id, "abort received", true);
    }

    /// Aborts the current round. Idempotent; `remote` only changes logging.
    fn abort_local(&self, reb_id: u64, reason: &str, remote: bool) {
        let mut round = self.lock();
        if round.reb_id != reb_id || round.aborted {
            return;
        }
        round.aborted = true;
        round.stage = Stage::Aborted;
        let _ = round.abort_tx.send(true);
        info!(node = %self.self_id, reb_id, reason, remote, "rebalance: round aborted");
    }

    /// Aborts locally and tells every peer to do the same.
    async fn abort_and_broadcast(self: &Arc<Self>, reb_id: u64, reason: &str) {
        self.abort_local(reb_id, reason, false);

        let peers = self.peer_snodes(reb_id);
        let this = Arc::clone(self);
        let failed = cairn_transport::bcast(peers, self.cfg.max_bcast_parallel, move |peer| {
            let this = Arc::clone(&this);
            async move {
                match this.probe.push_abort(&peer, reb_id).await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(node = %peer.id, %err, "rebalance: abort push undelivered");
                        false
                    }
                }
            }
        })
        .await;
        if failed > 0 {
            warn!(node = %self.self_id, reb_id, undelivered = failed, "rebalance: abort broadcast incomplete");
        }
    }

    async fn push_stage_to_peers(self: &Arc<Self>, reb_id: u64) {
        let status = self.status();
        if status.reb_id != reb_id {
            return;
        }
        let peers = self.peer_snodes(reb_id);
        let this = Arc::clone(self);
        let status = Arc::new(status);
        cairn_transport::bcast(peers, self.cfg.max_bcast_parallel, move |peer| {
            let this = Arc::clone(&this);
            let status = Arc::clone(&status);
            async move {
                // Best-effort: peers that miss the push will pull instead.
                this.probe.push_stage(&peer, &status).await.is_ok()
            }
        })
        .await;
    }

    /// Waits until every peer is known to have reached `want` in this round.
    async fn wait_peers_stage(
        self: &Arc<Self>,
        reb_id: u64,
        want: Stage,
        budget: Duration,
        what: &'static str,
        abort_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), RebError> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let behind: Vec<NodeId> = {
                let round = self.lock();
                if round.reb_id != reb_id || round.aborted {
                    return Err(RebError::Aborted {
                        reb_id,
                        reason: format!("abort while waiting for {what}"),
                    });
                }
                round
                    .peers
                    .iter()
                    .filter(|id| round.peer_stage.get(*id).copied().unwrap_or(Stage::Init) < want)
                    .cloned()
                    .collect()
            };
            if behind.is_empty() {
                return Ok(());
            }

            // Pushed progress short-circuits the probe; pull only laggards.
            let smap = self.smap.smap();
            for id in behind {
                if self.known_stage(reb_id, &id) >= want {
                    continue;
                }
                if let Some(peer) = smap.get_node(&id).cloned() {
                    if let Some(status) = self.check_glob_status(&peer).await {
                        self.observe_status(&id, &status).await;
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(RebError::PeersNotReady { reb_id, what });
            }
            if self.aborted_after(abort_rx, self.cfg.timeouts.keepalive_retry()).await {
                return Err(RebError::Aborted {
                    reb_id,
                    reason: format!("abort while waiting for {what}"),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, Round> {
        match self.round.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn known_stage(&self, reb_id: u64, id: &NodeId) -> Stage {
        let round = self.lock();
        if round.reb_id != reb_id {
            return Stage::Init;
        }
        round.peer_stage.get(id).copied().unwrap_or(Stage::Init)
    }

    fn round_smap_version(&self, reb_id: u64) -> u64 {
        let round = self.lock();
        if round.reb_id == reb_id { round.smap_version } else { u64::MAX }
    }

    fn peer_snodes(&self, reb_id: u64) -> Vec<Snode> {
        let ids = {
            let round = self.lock();
            if round.reb_id != reb_id {
                return Vec::new();
            }
            round.peers.clone()
        };
        let smap = self.smap.smap();
        ids.iter().filter_map(|id| smap.get_node(id).cloned()).collect()
    }

    /// Sleeps, waking early on abort; returns whether the round is aborted.
    async fn aborted_after(&self, abort_rx: &mut watch::Receiver<bool>, dur: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(dur) => *abort_rx.borrow(),
            _ = abort_rx.changed() => true,
        }
    }
}
