//! Two-phase primary handover.

use std::sync::Arc;

use cairn_meta::{MetaError, Modify, Smap, VersionedStore};
use cairn_metasync::{SyncNote, SyncPair};
use cairn_types::NodeId;
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::error::ClusterError;
use crate::membership::Controller;

/// Adopts a committed primary switch into a local map. Used by every node
/// that receives the commit phase; nodes without a membership controller
/// (targets) call it directly.
pub async fn adopt_primary(
    store: &VersionedStore<Smap>,
    new_id: &NodeId,
) -> Result<(), ClusterError> {
    let mut transition = SetPrimaryTransition {
        new_primary: new_id.clone(),
    };
    match store.modify(&mut transition).await {
        Ok(installed) => {
            info!(new_primary = %new_id, smap_version = installed.version, "handover adopted");
            Ok(())
        }
        Err(err) if err.is_no_change() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Map mutation of both handover phases: rewrite `primary_id`, nothing else.
/// Deliberately does not replicate from `fin`; the commit broadcast (old
/// primary) and the first sync of the new primary carry the revision.
struct SetPrimaryTransition {
    new_primary: NodeId,
}

#[async_trait::async_trait]
impl Modify<Smap> for SetPrimaryTransition {
    fn pre(&mut self, clone: &mut Smap) -> Result<(), MetaError> {
        if clone.primary_id == self.new_primary {
            return Err(MetaError::NoChange(format!(
                "{} is already primary",
                self.new_primary
            )));
        }
        if !clone.proxies.contains_key(&self.new_primary) {
            return Err(MetaError::Rejected(format!(
                "proxy {} left during handover",
                self.new_primary
            )));
        }
        clone.primary_id = self.new_primary.clone();
        clone.validate()
    }
}

impl Controller {
    /// Hands the primary role to `new_id`.
    ///
    /// Phase 1 (prepare) touches no state: every node is asked whether it can
    /// follow the switch, and any refusal aborts the handover. Phase 2
    /// (commit) silences keepalives, installs the new primary in the map,
    /// demotes the local metasyncer, and broadcasts the commit. A commit
    /// failure on the new primary is fatal for this daemon; failures on other
    /// nodes reconcile through later metasync.
    pub async fn set_primary(self: &Arc<Self>, new_id: &NodeId) -> Result<(), ClusterError> {
        let smap = self.smap_store().get();
        let Some(candidate) = smap.proxies.get(new_id) else {
            return Err(ClusterError::NodeNotFound(new_id.clone()));
        };
        if candidate.non_electable() {
            return Err(ClusterError::NonElectable(new_id.clone()));
        }
        if smap.is_primary(new_id) {
            return Ok(());
        }

        info!(new_primary = %new_id, "handover: prepare");
        self.handover_bcast(&smap, new_id, true)
            .await
            .map_err(|(node, reason)| ClusterError::PrepareFailed { node, reason })?;

        info!(new_primary = %new_id, "handover: commit");
        self.set_in_transition(true);
        let result = self.commit(&smap, new_id).await;
        self.set_in_transition(false);
        result
    }

    async fn commit(self: &Arc<Self>, smap: &Arc<Smap>, new_id: &NodeId) -> Result<(), ClusterError> {
        let mut transition = SetPrimaryTransition {
            new_primary: new_id.clone(),
        };
        self.smap_store().modify(&mut transition).await?;

        self.syncer().become_non_primary();

        if let Err((node, reason)) = self.handover_bcast(smap, new_id, false).await {
            if node == *new_id {
                error!(node = %node, reason, "handover: new primary failed in commit");
                return Err(ClusterError::CommitFatal { node, reason });
            }
            // Everyone else catches up from the new primary's metasync.
            warn!(node = %node, reason, "handover: commit not delivered");
        }
        Ok(())
    }

    /// Broadcasts one handover phase; `Err((node, reason))` on first failure.
    async fn handover_bcast(
        self: &Arc<Self>,
        smap: &Arc<Smap>,
        new_id: &NodeId,
        prepare: bool,
    ) -> Result<(), (NodeId, String)> {
        let peers = smap.all_nodes_except(self.self_id());
        let calls = peers.iter().map(|peer| {
            let client = Arc::clone(self.client());
            let new_id = new_id.clone();
            async move {
                client
                    .handover(peer, &new_id, prepare)
                    .await
                    .map_err(|err| (peer.id.clone(), err.to_string()))
            }
        });

        for result in join_all(calls).await {
            result?;
        }
        Ok(())
    }

    /// Commit delivery on the receiving side: adopt the new primary locally.
    ///
    /// The new primary also promotes its metasyncer here; every other node
    /// just rewrites its map. The note travels with the next sync so late
    /// nodes converge regardless.
    pub async fn handover_commit_received(
        self: &Arc<Self>,
        new_id: &NodeId,
    ) -> Result<(), ClusterError> {
        adopt_primary(self.smap_store(), new_id).await?;

        if *new_id == *self.self_id() {
            self.syncer().become_primary();
            // A promoted proxy serves joins from here on.
            self.mark_started().await;
            // Announce the new regime to everyone.
            let smap = self.smap_store().get();
            if let Ok(pair) = SyncPair::of(&*smap, SyncNote::about("set-primary", new_id.clone())) {
                let _join = self.syncer().sync(vec![pair]);
            }
        }
        Ok(())
    }
}
