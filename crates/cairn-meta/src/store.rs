//! Copy-on-write store for versioned metadata.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use cairn_types::NodeId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::MetaError;

/// The replicated metadata kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaKind {
    Smap,
    Rmd,
    Bmd,
}

impl std::fmt::Display for MetaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MetaKind::Smap => "smap",
            MetaKind::Rmd => "rmd",
            MetaKind::Bmd => "bmd",
        };
        write!(f, "{s}")
    }
}

/// Implemented by every replicated metadata document.
pub trait VersionedMeta: Clone + Send + Sync + 'static {
    const KIND: MetaKind;

    fn version(&self) -> u64;
    fn uuid(&self) -> Uuid;
    /// Advances the version by one. Called by the store, never by users.
    fn bump(&mut self);
}

/// A compare-and-swap mutation of one metadata document.
///
/// `pre` runs on the clone and may veto the change; `post` runs under the
/// store lock after installation (chain dependent updates here so they cannot
/// interleave with a competing writer); `fin` runs after the lock is released
/// and is where replication is typically kicked off.
#[async_trait]
pub trait Modify<T: VersionedMeta>: Send {
    fn pre(&mut self, clone: &mut T) -> Result<(), MetaError>;

    async fn post(&mut self, _installed: &Arc<T>) {}

    async fn fin(&mut self, _installed: &Arc<T>) {}
}

/// Adapter turning a plain closure into a [`Modify`] with empty post/fin.
pub struct FnModify<F>(pub F);

#[async_trait]
impl<T, F> Modify<T> for FnModify<F>
where
    T: VersionedMeta,
    F: FnMut(&mut T) -> Result<(), MetaError> + Send,
{
    fn pre(&mut self, clone: &mut T) -> Result<(), MetaError> {
        (self.0)(clone)
    }
}

/// Holder of the current snapshot of one metadata kind.
///
/// Reads are lock-free; the internal mutex is held only across [`modify`].
///
/// [`modify`]: VersionedStore::modify
pub struct VersionedStore<T> {
    cur: ArcSwap<T>,
    write: Mutex<()>,
}

impl<T: VersionedMeta> VersionedStore<T> {
    pub fn new(initial: T) -> Self {
        Self {
            cur: ArcSwap::from_pointee(initial),
            write: Mutex::new(()),
        }
    }

    /// Current immutable snapshot.
    pub fn get(&self) -> Arc<T> {
        self.cur.load_full()
    }

    /// Clone–mutate–install. See [`Modify`] for the phase contract.
    ///
    /// On any `pre` error nothing is installed and the version does not move.
    pub async fn modify(&self, ctx: &mut dyn Modify<T>) -> Result<Arc<T>, MetaError> {
        let guard = self.write.lock().await;

        let cur = self.cur.load_full();
        let mut clone = (*cur).clone();
        ctx.pre(&mut clone)?;
        clone.bump();

        if clone.version() <= cur.version() {
            return Err(MetaError::VersionRegression {
                kind: T::KIND,
                current: cur.version(),
                attempted: clone.version(),
            });
        }
        debug_assert_eq!(clone.uuid(), cur.uuid());

        let installed = Arc::new(clone);
        self.cur.store(Arc::clone(&installed));
        tracing::debug!(kind = %T::KIND, version = installed.version(), "installed");

        ctx.post(&installed).await;
        drop(guard);
        ctx.fin(&installed).await;

        Ok(installed)
    }

    /// Adopts a snapshot authored elsewhere (a metasync delivery).
    ///
    /// The incoming version must be strictly newer; an equal version is a
    /// redelivery and reported as [`MetaError::NoChange`]. A store still at
    /// version 0 has never been attached to a cluster and accepts any UUID.
    pub async fn install(&self, next: T) -> Result<Arc<T>, MetaError> {
        let _guard = self.write.lock().await;

        let cur = self.cur.load_full();
        if next.version() == cur.version() && next.uuid() == cur.uuid() {
            return Err(MetaError::NoChange(format!(
                "{} v{} already installed",
                T::KIND,
                cur.version()
            )));
        }
        if next.version() <= cur.version() {
            return Err(MetaError::VersionRegression {
                kind: T::KIND,
                current: cur.version(),
                attempted: next.version(),
            });
        }
        if cur.version() > 0 && next.uuid() != cur.uuid() {
            return Err(MetaError::Rejected(format!(
                "{} UUID changed from {} to {}",
                T::KIND,
                cur.uuid(),
                next.uuid()
            )));
        }

        let installed = Arc::new(next);
        self.cur.store(Arc::clone(&installed));
        tracing::debug!(kind = %T::KIND, version = installed.version(), "adopted");
        Ok(installed)
    }
}

/// Rejects metadata or join requests advertising a foreign cluster UUID.
pub fn validate_uuid(
    local: Uuid,
    incoming: Uuid,
    local_id: &NodeId,
    peer_id: &NodeId,
) -> Result<(), MetaError> {
    if local == incoming {
        return Ok(());
    }
    Err(MetaError::UuidMismatch {
        local,
        incoming,
        local_id: local_id.clone(),
        peer_id: peer_id.clone(),
    })
}
