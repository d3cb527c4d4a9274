//! Daemon assembly: one process, one node, proxy or target.

use std::sync::{Arc, Weak};
use std::time::Duration;

use cairn_cluster::{Controller, NotifMsg, NotifRegistry};
use cairn_config::CairnConfig;
use cairn_meta::{
    Bmd, MetaKind, MetadataStore, NodeRegMeta, Rmd, Smap, SmapSource, VersionedMeta,
    VersionedStore,
};
use cairn_metasync::{ApplyHook, DegradedSink, MetaReceiver, Metasyncer, SyncNote};
use cairn_rebalance::{Inventory, Mover, RebCoordinator, RebConfig, StatusProbe};
use cairn_transport::KeepaliveTracker;
use cairn_types::{NetInfo, NodeId, NodeRole, Snode};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::persist::FsMetadataStore;
use crate::routes;
use crate::transport::{HttpMover, HttpTransport};

/// Empty inventory placeholder; the storage engine swaps in the real walker.
struct EmptyInventory;

impl Inventory for EmptyInventory {
    fn objects(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Degraded metasync peers only feed the keepalive funnel; eviction stays a
/// human (or future watchdog) decision.
struct DegradeToKeepalive(Arc<KeepaliveTracker>);

impl DegradedSink for DegradeToKeepalive {
    fn degraded(&self, peer: &NodeId, reason: &str) {
        self.0.on_err(peer, reason);
    }
}

/// Loads the persisted snapshot of one kind, if present and readable.
fn load_snapshot<T: VersionedMeta + serde::de::DeserializeOwned>(
    store: &dyn MetadataStore,
    kind: MetaKind,
) -> Option<T> {
    match store.load(kind) {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(%kind, %err, "persisted snapshot unreadable; starting fresh");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            warn!(%kind, %err, "persisted snapshot unavailable");
            None
        }
    }
}

fn persist_snapshot<T: VersionedMeta + serde::Serialize>(store: &dyn MetadataStore, meta: &T) {
    if meta.version() == 0 {
        return;
    }
    match serde_json::to_vec(meta) {
        Ok(bytes) => {
            if let Err(err) = store.save(T::KIND, &bytes) {
                warn!(kind = %T::KIND, %err, "snapshot not persisted");
            }
        }
        Err(err) => warn!(kind = %T::KIND, %err, "snapshot not serializable"),
    }
}

/// Reacts to adopted metadata: snapshots are persisted, and a fresh
/// rebalance descriptor starts a round on targets, reporting completion to
/// the information council.
struct DaemonHook(Weak<Daemon>);

impl ApplyHook for DaemonHook {
    fn on_smap(&self, smap: &Arc<Smap>, _note: &SyncNote) {
        if let Some(daemon) = self.0.upgrade() {
            persist_snapshot(&*daemon.meta_store, &**smap);
        }
    }

    fn on_bmd(&self, bmd: &Arc<Bmd>, _note: &SyncNote) {
        if let Some(daemon) = self.0.upgrade() {
            persist_snapshot(&*daemon.meta_store, &**bmd);
        }
    }

    fn on_rmd(&self, rmd: &Arc<Rmd>, _note: &SyncNote) {
        let Some(daemon) = self.0.upgrade() else {
            return;
        };
        persist_snapshot(&*daemon.meta_store, &**rmd);
        let Some(coordinator) = daemon.coordinator.clone() else {
            return;
        };
        if !daemon.cfg.rebalance.enabled {
            warn!("rebalance disabled; descriptor v{} ignored", rmd.version);
            return;
        }

        let rmd = Arc::clone(rmd);
        tokio::spawn(async move {
            let reb_id = rmd.rebalance_id();
            let result = coordinator.run_round(&rmd).await;

            let msg = NotifMsg {
                id: format!("reb-{reb_id}"),
                node: daemon.snode.id.clone(),
                err: result.as_ref().err().map(ToString::to_string),
                aborted: result.is_err(),
                finished: true,
            };
            daemon.report_to_ic(msg).await;
        });
    }
}

/// One Cairn node.
pub struct Daemon {
    pub cfg: CairnConfig,
    pub snode: Snode,
    pub smap: Arc<VersionedStore<Smap>>,
    pub rmd: Arc<VersionedStore<Rmd>>,
    pub bmd: Arc<VersionedStore<Bmd>>,
    pub syncer: Arc<Metasyncer>,
    pub receiver: Arc<MetaReceiver>,
    /// Present on proxies.
    pub controller: Option<Arc<Controller>>,
    /// Present on targets.
    pub coordinator: Option<Arc<RebCoordinator>>,
    pub notifs: Arc<NotifRegistry>,
    pub keepalive: Arc<KeepaliveTracker>,
    pub transport: Arc<HttpTransport>,
    pub meta_store: Arc<FsMetadataStore>,
    shutdown: Notify,
}

impl Daemon {
    pub fn new(cfg: CairnConfig) -> anyhow::Result<Arc<Self>> {
        let role = match cfg.node.role.as_str() {
            "proxy" => NodeRole::Proxy,
            _ => NodeRole::Target,
        };
        let id = if cfg.node.id.is_empty() {
            let prefix = if role == NodeRole::Proxy { "p" } else { "t" };
            format!("{prefix}{}", &Uuid::new_v4().simple().to_string()[..8])
        } else {
            cfg.node.id.clone()
        };
        let snode = Snode {
            id: NodeId::new(id),
            public_net: NetInfo::new(cfg.node.public_addr.clone(), cfg.node.public_port),
            control_net: NetInfo::new(cfg.node.public_addr.clone(), cfg.node.control_port),
            data_net: NetInfo::new(cfg.node.public_addr.clone(), cfg.node.data_port),
            role,
            flags: cairn_types::NodeFlags::empty(),
        };

        // A proxy with no one to join founds the cluster as its primary;
        // anyone else starts from its persisted snapshots (a restarted node
        // keeps its cluster identity) or from scratch.
        let meta_store = Arc::new(FsMetadataStore::new(cfg.node.meta_dir.clone()));
        let founding = role == NodeRole::Proxy && cfg.node.join_url.is_empty();
        let (smap, rmd, bmd) = if founding {
            let uuid = Uuid::new_v4();
            info!(node = %snode.id, %uuid, "founding a new cluster");
            (
                Arc::new(VersionedStore::new(Smap::bootstrap(uuid, snode.clone()))),
                Arc::new(VersionedStore::new(Rmd::new(uuid))),
                Arc::new(VersionedStore::new(Bmd::new(uuid))),
            )
        } else {
            (
                Arc::new(VersionedStore::new(
                    load_snapshot(&*meta_store, MetaKind::Smap).unwrap_or_else(Smap::unattached),
                )),
                Arc::new(VersionedStore::new(
                    load_snapshot(&*meta_store, MetaKind::Rmd).unwrap_or_else(Rmd::unattached),
                )),
                Arc::new(VersionedStore::new(
                    load_snapshot(&*meta_store, MetaKind::Bmd).unwrap_or_else(Bmd::unattached),
                )),
            )
        };

        let keepalive = Arc::new(KeepaliveTracker::new(cfg.timeouts.max_keepalive(), 3));
        let transport = Arc::new(HttpTransport::new(
            snode.id.clone(),
            cfg.timeouts.cplane_operation(),
        ));
        let syncer = Metasyncer::new(
            snode.id.clone(),
            Arc::clone(&smap) as Arc<dyn SmapSource>,
            Arc::clone(&transport) as Arc<dyn cairn_metasync::SyncTransport>,
            Arc::new(DegradeToKeepalive(Arc::clone(&keepalive))),
            cfg.timeouts.keepalive_retry(),
            cfg.timeouts.max_keepalive(),
        );
        if founding {
            syncer.become_primary();
        }

        let notifs = Arc::new(NotifRegistry::new());

        let daemon = Arc::new_cyclic(|weak: &Weak<Daemon>| {
            let mut receiver = MetaReceiver::new(
                snode.id.clone(),
                Arc::clone(&smap),
                Arc::clone(&rmd),
                Arc::clone(&bmd),
            );
            receiver.add_hook(Arc::new(DaemonHook(weak.clone())));

            let controller = (role == NodeRole::Proxy).then(|| {
                Controller::new(
                    snode.clone(),
                    cfg.rebalance.enabled,
                    Arc::clone(&smap),
                    Arc::clone(&rmd),
                    Arc::clone(&bmd),
                    Arc::clone(&syncer),
                    Arc::clone(&transport) as Arc<dyn cairn_cluster::NodeClient>,
                    Arc::clone(&notifs),
                    Arc::clone(&keepalive),
                )
            });

            let coordinator = (role == NodeRole::Target).then(|| {
                RebCoordinator::new(
                    snode.id.clone(),
                    RebConfig {
                        timeouts: cfg.timeouts.clone(),
                        rebalance: cfg.rebalance.clone(),
                        max_bcast_parallel: cfg.broadcast.max_parallel,
                        ec_namespace: false,
                    },
                    Arc::clone(&smap) as Arc<dyn SmapSource>,
                    Arc::clone(&transport) as Arc<dyn StatusProbe>,
                    Arc::new(HttpMover::new(
                        snode.id.clone(),
                        cfg.timeouts.cplane_operation(),
                    )) as Arc<dyn Mover>,
                    Arc::new(EmptyInventory) as Arc<dyn Inventory>,
                )
            });

            Daemon {
                cfg,
                snode,
                smap,
                rmd,
                bmd,
                syncer,
                receiver: Arc::new(receiver),
                controller,
                coordinator,
                notifs,
                keepalive,
                transport,
                meta_store,
                shutdown: Notify::new(),
            }
        });
        Ok(daemon)
    }

    pub fn is_proxy(&self) -> bool {
        self.snode.is_proxy()
    }

    /// True when this node currently holds the primary role.
    pub fn is_primary(&self) -> bool {
        let smap = self.smap.get();
        smap.version > 0 && smap.is_primary(&self.snode.id)
    }

    /// Registration payload advertising this node.
    pub fn reg_meta(&self) -> NodeRegMeta {
        let mut meta = NodeRegMeta::new(self.snode.clone());
        let smap = self.smap.get();
        if smap.version > 0 {
            meta.smap = Some((*smap).clone());
        }
        meta
    }

    /// Asks the daemon to exit; `run` unblocks and returns.
    pub fn trigger_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Reports a round result to every information-council proxy.
    pub async fn report_to_ic(&self, msg: NotifMsg) {
        let smap = self.smap.get();
        for id in smap.staff_ic() {
            let Some(proxy) = smap.get_node(&id) else {
                continue;
            };
            if let Err(err) = self.transport.notify_ic(proxy, &msg).await {
                warn!(proxy = %id, err, "ic notification undelivered");
            }
        }
    }

    /// Serves the HTTP surface and runs the periodic loops until shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let app = routes::router(Arc::clone(&self));

        // One router, every plane: public for clients, control for the
        // cluster, data for object handoff.
        let mut ports = vec![self.snode.control_net.port];
        for port in [self.snode.public_net.port, self.snode.data_net.port] {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        let mut servers = Vec::new();
        for port in ports {
            let addr = format!("{}:{port}", self.cfg.node.public_addr);
            let listener = TcpListener::bind(&addr).await?;
            info!(node = %self.snode.id, %addr, "listening");
            let app = app.clone();
            servers.push(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app).await {
                    warn!(%err, "server exited");
                }
            }));
        }

        if let Some(controller) = &self.controller {
            if self.is_primary() {
                controller.mark_started().await;
            }
        }
        if !self.is_primary() && !self.cfg.node.join_url.is_empty() {
            tokio::spawn(Arc::clone(&self).join_loop());
        }
        tokio::spawn(Arc::clone(&self).keepalive_loop());
        tokio::spawn(Arc::clone(&self).persist_loop());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            () = self.shutdown.notified() => info!("shutdown requested"),
        }
        for server in servers {
            server.abort();
        }
        Ok(())
    }

    /// Registers with the cluster until it sticks.
    async fn join_loop(self: Arc<Self>) {
        let join_url = self.cfg.node.join_url.trim_end_matches('/').to_string();
        loop {
            match self.transport.join(&join_url, &self.reg_meta()).await {
                Ok(()) => {
                    info!(node = %self.snode.id, "registered with the cluster");
                    return;
                }
                Err(err) => {
                    warn!(node = %self.snode.id, err, "join attempt failed");
                    tokio::time::sleep(self.cfg.timeouts.max_keepalive()).await;
                }
            }
        }
    }

    /// Periodic snapshot flush. The receiver hooks persist adopted
    /// revisions as they land; this loop covers the primary's own writes.
    async fn persist_loop(self: Arc<Self>) {
        let period = self.cfg.timeouts.stats_time();
        loop {
            tokio::time::sleep(period).await;
            persist_snapshot(&*self.meta_store, &*self.smap.get());
            persist_snapshot(&*self.meta_store, &*self.rmd.get());
            persist_snapshot(&*self.meta_store, &*self.bmd.get());
        }
    }

    /// Periodic keepalive to the primary; a 404 means the primary forgot us
    /// and we re-register.
    async fn keepalive_loop(self: Arc<Self>) {
        let period = self.cfg.timeouts.max_keepalive();
        loop {
            tokio::time::sleep(period).await;

            let smap = self.smap.get();
            if smap.version == 0 || smap.is_primary(&self.snode.id) {
                continue;
            }
            let Some(primary) = smap.primary().cloned() else {
                continue;
            };

            match self.transport.keepalive(&primary, &self.reg_meta()).await {
                Ok(404) => {
                    warn!(node = %self.snode.id, "primary lost us; re-registering");
                    let url = primary.control_net.url();
                    if let Err(err) = self.transport.join(&url, &self.reg_meta()).await {
                        warn!(err, "re-registration failed");
                    }
                }
                Ok(status) if status >= 500 => {
                    self.keepalive.on_err(&primary.id, &format!("keepalive: {status}"));
                }
                Ok(_) => self.keepalive.heard_from(&primary.id),
                Err(err) => self.keepalive.on_err(&primary.id, &err),
            }
        }
    }
}
