//! The sending side: primary → peers fan-out with per-peer progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cairn_meta::{MetaKind, SmapSource};
use cairn_types::{NodeId, Snode};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::msg::{SyncBatch, SyncPair};

/// One round trip delivering a batch to one peer.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    async fn send(&self, peer: &Snode, batch: &SyncBatch) -> Result<(), SyncError>;
}

/// Where persistently unreachable peers get reported. The membership
/// controller decides what to do about them.
pub trait DegradedSink: Send + Sync + 'static {
    fn degraded(&self, peer: &NodeId, reason: &str);
}

/// No-op sink for tests and bootstrap.
pub struct NullDegradedSink;

impl DegradedSink for NullDegradedSink {
    fn degraded(&self, peer: &NodeId, reason: &str) {
        warn!(node = %peer, reason, "peer degraded (unhandled)");
    }
}

struct PeerState {
    /// Serializes deliveries to this peer, which is what makes per-kind
    /// version order strictly increasing.
    in_flight: tokio::sync::Mutex<()>,
    acked: Mutex<HashMap<MetaKind, u64>>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            in_flight: tokio::sync::Mutex::new(()),
            acked: Mutex::new(HashMap::new()),
        }
    }

    fn acked_version(&self, kind: MetaKind) -> u64 {
        self.acked
            .lock()
            .map(|acked| acked.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn record(&self, kind: MetaKind, version: u64) {
        if let Ok(mut acked) = self.acked.lock() {
            let slot = acked.entry(kind).or_insert(0);
            if version > *slot {
                *slot = version;
            }
        }
    }
}

/// The metasyncer proper. One instance per node; only the primary initiates.
pub struct Metasyncer {
    self_id: NodeId,
    smap: Arc<dyn SmapSource>,
    transport: Arc<dyn SyncTransport>,
    degraded: Arc<dyn DegradedSink>,
    primary: AtomicBool,
    retry_base: Duration,
    retry_window: Duration,
    peers: Mutex<HashMap<NodeId, Arc<PeerState>>>,
}

impl Metasyncer {
    pub fn new(
        self_id: NodeId,
        smap: Arc<dyn SmapSource>,
        transport: Arc<dyn SyncTransport>,
        degraded: Arc<dyn DegradedSink>,
        retry_base: Duration,
        retry_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            smap,
            transport,
            degraded,
            primary: AtomicBool::new(false),
            retry_base,
            retry_window,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Primary-side switch: flipped on at bootstrap or handover commit.
    pub fn become_primary(&self) {
        self.primary.store(true, Ordering::SeqCst);
    }

    /// Former primary stops initiating new syncs; incoming deliveries keep
    /// being accepted by the receiver, which this switch does not touch.
    pub fn become_non_primary(&self) {
        if self.primary.swap(false, Ordering::SeqCst) {
            info!(node = %self.self_id, "metasync: no longer primary");
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Replicates `pairs` to every other node in the current map.
    ///
    /// Returns a handle resolving to the number of peers that could not be
    /// brought up to date within the retry window.
    pub fn sync(self: &Arc<Self>, pairs: Vec<SyncPair>) -> JoinHandle<usize> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !this.is_primary() {
                warn!(node = %this.self_id, "metasync: sync requested while not primary");
                return 0;
            }
            this.fan_out(pairs).await
        })
    }

    /// Fire-and-forget pre-announcement: one attempt per peer, no progress
    /// bookkeeping, so the real revision still syncs afterwards.
    pub async fn notify(self: &Arc<Self>, wait: bool, pairs: Vec<SyncPair>) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let smap = this.smap.smap();
            let batch = this.batch(&pairs);
            let peers = smap.all_nodes_except(&this.self_id);
            for peer in peers {
                if let Err(err) = this.transport.send(&peer, &batch).await {
                    debug!(node = %peer.id, %err, "metasync: notify undelivered");
                }
            }
        });
        if wait {
            let _ = task.await;
        }
    }

    async fn fan_out(self: &Arc<Self>, pairs: Vec<SyncPair>) -> usize {
        let smap = self.smap.smap();
        let peers = smap.all_nodes_except(&self.self_id);
        debug!(
            node = %self.self_id,
            peers = peers.len(),
            pairs = pairs.len(),
            "metasync: fan-out"
        );

        let mut tasks = Vec::with_capacity(peers.len());
        for peer in peers {
            let this = Arc::clone(self);
            let pairs = pairs.clone();
            tasks.push(tokio::spawn(async move { this.sync_one(&peer, &pairs).await }));
        }

        let mut failed = 0;
        for task in tasks {
            if !task.await.unwrap_or(false) {
                failed += 1;
            }
        }
        failed
    }

    /// Delivers to one peer; `true` on success or benign drop.
    async fn sync_one(&self, peer: &Snode, pairs: &[SyncPair]) -> bool {
        let state = self.peer_state(&peer.id);
        let _in_flight = state.in_flight.lock().await;

        // Only revisions strictly newer than what the peer acked.
        let fresh: Vec<SyncPair> = pairs
            .iter()
            .filter(|p| p.version > state.acked_version(p.kind))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return true;
        }
        let batch = self.batch(&fresh);

        let mut delay = self.retry_base;
        let deadline = tokio::time::Instant::now() + self.retry_window;
        loop {
            match self.transport.send(peer, &batch).await {
                Ok(()) => {
                    for pair in &batch.pairs {
                        state.record(pair.kind, pair.version);
                    }
                    return true;
                }
                Err(err) => {
                    if !self.is_primary() {
                        return true;
                    }
                    // A peer the map no longer lists is not worth chasing.
                    if !self.smap.smap().contains(&peer.id) {
                        debug!(node = %peer.id, "metasync: peer left the map, dropping");
                        self.drop_peer(&peer.id);
                        return true;
                    }
                    if tokio::time::Instant::now() + delay > deadline {
                        self.degraded.degraded(&peer.id, &err.to_string());
                        return false;
                    }
                    debug!(node = %peer.id, %err, ?delay, "metasync: retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    fn batch(&self, pairs: &[SyncPair]) -> SyncBatch {
        SyncBatch {
            uuid: self.smap.smap().uuid,
            sender: self.self_id.clone(),
            pairs: pairs.to_vec(),
        }
    }

    fn peer_state(&self, id: &NodeId) -> Arc<PeerState> {
        let mut peers = match self.peers.lock() {
            Ok(peers) => peers,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(peers.entry(id.clone()).or_insert_with(|| Arc::new(PeerState::new())))
    }

    fn drop_peer(&self, id: &NodeId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use cairn_meta::{Rmd, Smap, VersionedStore};
    use cairn_types::{NetInfo, NodeRole};
    use uuid::Uuid;

    use super::*;
    use crate::msg::SyncNote;

    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, SyncBatch)>>,
        fail_first: AtomicUsize,
    }

    impl RecordingTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }

        fn batches_for(&self, id: &str) -> Vec<SyncBatch> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(peer, _)| peer.as_str() == id)
                .map(|(_, b)| b.clone())
                .collect()
        }
    }

    #[async_trait]
    impl SyncTransport for RecordingTransport {
        async fn send(&self, peer: &Snode, batch: &SyncBatch) -> Result<(), SyncError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(SyncError::Transport {
                    peer: peer.id.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((peer.id.clone(), batch.clone()));
            Ok(())
        }
    }

    struct CountingSink(AtomicUsize);

    impl DegradedSink for CountingSink {
        fn degraded(&self, _peer: &NodeId, _reason: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cluster(uuid: Uuid) -> Arc<VersionedStore<Smap>> {
        let mut smap = Smap::bootstrap(
            uuid,
            Snode::new("p1", NodeRole::Proxy, NetInfo::new("h", 8080)),
        );
        smap.put_node(Snode::new("t1", NodeRole::Target, NetInfo::new("h", 8081)));
        smap.put_node(Snode::new("t2", NodeRole::Target, NetInfo::new("h", 8082)));
        smap.version = 3;
        Arc::new(VersionedStore::new(smap))
    }

    fn syncer(
        smap: Arc<VersionedStore<Smap>>,
        transport: Arc<RecordingTransport>,
        sink: Arc<CountingSink>,
    ) -> Arc<Metasyncer> {
        let s = Metasyncer::new(
            NodeId::from("p1"),
            smap,
            transport,
            sink,
            Duration::from_millis(5),
            Duration::from_millis(40),
        );
        s.become_primary();
        s
    }

    fn rmd_pair(uuid: Uuid, version: u64) -> SyncPair {
        let mut rmd = Rmd::new(uuid);
        rmd.version = version;
        SyncPair::of(&rmd, SyncNote::new("rebalance")).unwrap()
    }

    #[tokio::test]
    async fn test_sync_reaches_all_peers() {
        let uuid = Uuid::new_v4();
        let transport = RecordingTransport::new(0);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let s = syncer(cluster(uuid), Arc::clone(&transport), sink);

        let failed = s.sync(vec![rmd_pair(uuid, 2)]).await.unwrap();
        assert_eq!(failed, 0);
        assert_eq!(transport.batches_for("t1").len(), 1);
        assert_eq!(transport.batches_for("t2").len(), 1);
        // Sender never syncs to itself.
        assert!(transport.batches_for("p1").is_empty());
    }

    #[tokio::test]
    async fn test_already_acked_versions_are_skipped() {
        let uuid = Uuid::new_v4();
        let transport = RecordingTransport::new(0);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let s = syncer(cluster(uuid), Arc::clone(&transport), sink);

        s.sync(vec![rmd_pair(uuid, 2)]).await.unwrap();
        // Same revision again: every peer already acked v2.
        s.sync(vec![rmd_pair(uuid, 2)]).await.unwrap();
        assert_eq!(transport.batches_for("t1").len(), 1);

        // A newer revision goes out.
        s.sync(vec![rmd_pair(uuid, 3)]).await.unwrap();
        let batches = transport.batches_for("t1");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].pairs[0].version, 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let uuid = Uuid::new_v4();
        // First two attempts (one per peer) fail, retries succeed.
        let transport = RecordingTransport::new(2);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let s = syncer(cluster(uuid), Arc::clone(&transport), Arc::clone(&sink));

        let failed = s.sync(vec![rmd_pair(uuid, 2)]).await.unwrap();
        assert_eq!(failed, 0);
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);
        assert_eq!(transport.batches_for("t1").len(), 1);
        assert_eq!(transport.batches_for("t2").len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_degraded() {
        let uuid = Uuid::new_v4();
        let transport = RecordingTransport::new(usize::MAX);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let s = syncer(cluster(uuid), transport, Arc::clone(&sink));

        let failed = s.sync(vec![rmd_pair(uuid, 2)]).await.unwrap();
        assert_eq!(failed, 2);
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_primary_refuses() {
        let uuid = Uuid::new_v4();
        let transport = RecordingTransport::new(0);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let s = syncer(cluster(uuid), Arc::clone(&transport), sink);
        s.become_non_primary();

        let failed = s.sync(vec![rmd_pair(uuid, 2)]).await.unwrap();
        assert_eq!(failed, 0);
        assert!(transport.batches_for("t1").is_empty());
    }

    #[tokio::test]
    async fn test_notify_leaves_progress_untouched() {
        let uuid = Uuid::new_v4();
        let transport = RecordingTransport::new(0);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let s = syncer(cluster(uuid), Arc::clone(&transport), sink);

        // Pre-announcement reaches everyone...
        s.notify(true, vec![rmd_pair(uuid, 2)]).await;
        assert_eq!(transport.batches_for("t1").len(), 1);

        // ...but does not count as delivered: the real sync still goes out.
        s.sync(vec![rmd_pair(uuid, 2)]).await.unwrap();
        assert_eq!(transport.batches_for("t1").len(), 2);
    }

    #[tokio::test]
    async fn test_batch_is_atomic_per_peer() {
        let uuid = Uuid::new_v4();
        let transport = RecordingTransport::new(0);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let smap_store = cluster(uuid);
        let s = syncer(Arc::clone(&smap_store), Arc::clone(&transport), sink);

        let smap_pair = SyncPair::of(&*smap_store.get(), SyncNote::new("join")).unwrap();
        let failed = s.sync(vec![smap_pair, rmd_pair(uuid, 2)]).await.unwrap();
        assert_eq!(failed, 0);

        let batches = transport.batches_for("t1");
        assert_eq!(batches.len(), 1, "both pairs share one round trip");
        assert_eq!(batches[0].pairs.len(), 2);
    }
}
