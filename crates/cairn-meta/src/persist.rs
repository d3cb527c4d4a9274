//! Persistence seam for metadata snapshots.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::MetaError;
use crate::store::MetaKind;

/// Durable storage for the latest snapshot of each metadata kind.
///
/// The on-disk format and location belong to the node's storage layer; the
/// control plane only needs save/load of opaque bytes.
pub trait MetadataStore: Send + Sync {
    fn save(&self, kind: MetaKind, payload: &[u8]) -> Result<(), MetaError>;
    fn load(&self, kind: MetaKind) -> Result<Option<Vec<u8>>, MetaError>;
}

/// In-memory implementation for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemMetadataStore {
    inner: Mutex<HashMap<MetaKind, Vec<u8>>>,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemMetadataStore {
    fn save(&self, kind: MetaKind, payload: &[u8]) -> Result<(), MetaError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| MetaError::Persist("store mutex poisoned".to_string()))?;
        inner.insert(kind, payload.to_vec());
        Ok(())
    }

    fn load(&self, kind: MetaKind) -> Result<Option<Vec<u8>>, MetaError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| MetaError::Persist("store mutex poisoned".to_string()))?;
        Ok(inner.get(&kind).cloned())
    }
}
