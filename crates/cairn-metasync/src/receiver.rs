//! The receiving side: applying delivered revisions to the local stores.

use std::sync::Arc;

use cairn_meta::{Bmd, MetaError, MetaKind, Rmd, Smap, VersionedStore, validate_uuid};
use cairn_types::NodeId;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::msg::{SyncBatch, SyncNote, SyncPair};

/// Reactions to freshly adopted revisions.
///
/// The daemon uses these to wire deliveries to behavior: a new rebalance
/// descriptor starts a round on a target, a new map re-derives the IC, and
/// so on. Hooks run after the snapshot is installed.
pub trait ApplyHook: Send + Sync {
    fn on_smap(&self, _smap: &Arc<Smap>, _note: &SyncNote) {}
    fn on_rmd(&self, _rmd: &Arc<Rmd>, _note: &SyncNote) {}
    fn on_bmd(&self, _bmd: &Arc<Bmd>, _note: &SyncNote) {}
}

/// Applies metasync batches to this node's metadata stores.
///
/// Every node runs one, the primary included: a former primary keeps
/// accepting deliveries after handover.
pub struct MetaReceiver {
    self_id: NodeId,
    smap: Arc<VersionedStore<Smap>>,
    rmd: Arc<VersionedStore<Rmd>>,
    bmd: Arc<VersionedStore<Bmd>>,
    hooks: Vec<Arc<dyn ApplyHook>>,
}

impl MetaReceiver {
    pub fn new(
        self_id: NodeId,
        smap: Arc<VersionedStore<Smap>>,
        rmd: Arc<VersionedStore<Rmd>>,
        bmd: Arc<VersionedStore<Bmd>>,
    ) -> Self {
        Self {
            self_id,
            smap,
            rmd,
            bmd,
            hooks: Vec::new(),
        }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn ApplyHook>) {
        self.hooks.push(hook);
    }

    /// Applies a batch; returns the kinds actually adopted.
    ///
    /// Stale or redelivered revisions are skipped quietly. A batch from a
    /// foreign cluster is a cluster-integrity error and nothing applies.
    pub async fn apply(&self, batch: &SyncBatch) -> Result<Vec<MetaKind>, SyncError> {
        let local = self.smap.get();
        if local.version > 0 {
            validate_uuid(local.uuid, batch.uuid, &self.self_id, &batch.sender)?;
        }

        let mut adopted = Vec::new();
        for pair in &batch.pairs {
            if self.apply_pair(pair).await? {
                adopted.push(pair.kind);
            }
        }
        Ok(adopted)
    }

    async fn apply_pair(&self, pair: &SyncPair) -> Result<bool, SyncError> {
        match pair.kind {
            MetaKind::Smap => {
                let next: Smap = decode(pair)?;
                match self.smap.install(next).await {
                    Ok(installed) => {
                        info!(
                            node = %self.self_id,
                            version = installed.version,
                            action = %pair.note.action,
                            "smap adopted"
                        );
                        for hook in &self.hooks {
                            hook.on_smap(&installed, &pair.note);
                        }
                        Ok(true)
                    }
                    Err(err) => skip_or_fail(&self.self_id, pair, err),
                }
            }
            MetaKind::Rmd => {
                let next: Rmd = decode(pair)?;
                match self.rmd.install(next).await {
                    Ok(installed) => {
                        info!(
                            node = %self.self_id,
                            reb_id = installed.rebalance_id(),
                            action = %pair.note.action,
                            "rmd adopted"
                        );
                        for hook in &self.hooks {
                            hook.on_rmd(&installed, &pair.note);
                        }
                        Ok(true)
                    }
                    Err(err) => skip_or_fail(&self.self_id, pair, err),
                }
            }
            MetaKind::Bmd => {
                let next: Bmd = decode(pair)?;
                match self.bmd.install(next).await {
                    Ok(installed) => {
                        for hook in &self.hooks {
                            hook.on_bmd(&installed, &pair.note);
                        }
                        Ok(true)
                    }
                    Err(err) => skip_or_fail(&self.self_id, pair, err),
                }
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(pair: &SyncPair) -> Result<T, SyncError> {
    serde_json::from_value(pair.payload.clone()).map_err(|source| SyncError::Decode {
        kind: pair.kind,
        source,
    })
}

fn skip_or_fail(self_id: &NodeId, pair: &SyncPair, err: MetaError) -> Result<bool, SyncError> {
    match err {
        MetaError::NoChange(_) | MetaError::VersionRegression { .. } => {
            debug!(node = %self_id, kind = %pair.kind, version = pair.version, "stale revision skipped");
            Ok(false)
        }
        other => {
            warn!(node = %self_id, kind = %pair.kind, %other, "revision refused");
            Err(other.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use cairn_types::{NetInfo, NodeRole, Snode};
    use uuid::Uuid;

    use super::*;

    fn stores(uuid: Uuid) -> (
        Arc<VersionedStore<Smap>>,
        Arc<VersionedStore<Rmd>>,
        Arc<VersionedStore<Bmd>>,
    ) {
        let smap = Smap::bootstrap(
            uuid,
            Snode::new("p1", NodeRole::Proxy, NetInfo::new("h", 8080)),
        );
        (
            Arc::new(VersionedStore::new(smap)),
            Arc::new(VersionedStore::new(Rmd::new(uuid))),
            Arc::new(VersionedStore::new(Bmd::new(uuid))),
        )
    }

    fn batch(uuid: Uuid, pairs: Vec<SyncPair>) -> SyncBatch {
        SyncBatch {
            uuid,
            sender: NodeId::from("p1"),
            pairs,
        }
    }

    fn rmd_pair(uuid: Uuid, version: u64) -> SyncPair {
        let mut rmd = Rmd::new(uuid);
        rmd.version = version;
        SyncPair::of(&rmd, SyncNote::new("rebalance")).unwrap()
    }

    #[tokio::test]
    async fn test_apply_adopts_newer() {
        let uuid = Uuid::new_v4();
        let (smap, rmd, bmd) = stores(uuid);
        let rx = MetaReceiver::new(NodeId::from("t1"), smap, Arc::clone(&rmd), bmd);

        let adopted = rx.apply(&batch(uuid, vec![rmd_pair(uuid, 4)])).await.unwrap();
        assert_eq!(adopted, vec![MetaKind::Rmd]);
        assert_eq!(rmd.get().version, 4);
    }

    #[tokio::test]
    async fn test_apply_skips_stale_quietly() {
        let uuid = Uuid::new_v4();
        let (smap, rmd, bmd) = stores(uuid);
        let rx = MetaReceiver::new(NodeId::from("t1"), smap, Arc::clone(&rmd), bmd);

        rx.apply(&batch(uuid, vec![rmd_pair(uuid, 4)])).await.unwrap();
        // Redelivery and an older revision both apply nothing, error nothing.
        let adopted = rx
            .apply(&batch(uuid, vec![rmd_pair(uuid, 4), rmd_pair(uuid, 2)]))
            .await
            .unwrap();
        assert!(adopted.is_empty());
        assert_eq!(rmd.get().version, 4);
    }

    #[tokio::test]
    async fn test_apply_rejects_foreign_cluster() {
        let uuid = Uuid::new_v4();
        let (smap, rmd, bmd) = stores(uuid);
        let rx = MetaReceiver::new(NodeId::from("t1"), smap, rmd, bmd);

        let foreign = Uuid::new_v4();
        let err = rx
            .apply(&batch(foreign, vec![rmd_pair(foreign, 9)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Meta(MetaError::UuidMismatch { .. })));
    }

    #[tokio::test]
    async fn test_hooks_fire_on_adoption() {
        struct Seen(Mutex<Vec<u64>>);
        impl ApplyHook for Seen {
            fn on_rmd(&self, rmd: &Arc<Rmd>, _note: &SyncNote) {
                self.0.lock().unwrap().push(rmd.version);
            }
        }

        let uuid = Uuid::new_v4();
        let (smap, rmd, bmd) = stores(uuid);
        let mut rx = MetaReceiver::new(NodeId::from("t1"), smap, rmd, bmd);
        let seen = Arc::new(Seen(Mutex::new(Vec::new())));
        rx.add_hook(Arc::clone(&seen) as Arc<dyn ApplyHook>);

        rx.apply(&batch(uuid, vec![rmd_pair(uuid, 4)])).await.unwrap();
        rx.apply(&batch(uuid, vec![rmd_pair(uuid, 4)])).await.unwrap();
        rx.apply(&batch(uuid, vec![rmd_pair(uuid, 5)])).await.unwrap();

        assert_eq!(*seen.0.lock().unwrap(), vec![4, 5]);
    }
}
