//! File-backed metadata snapshots.
//!
//! The latest revision of each kind is kept as one JSON file under the
//! node's meta directory, so a restarted node rejoins with its cluster
//! identity instead of as a stranger.

use std::path::PathBuf;

use cairn_meta::{MetaError, MetaKind, MetadataStore};
use tracing::debug;

/// One file per kind: `<meta_dir>/<kind>.json`.
pub struct FsMetadataStore {
    dir: PathBuf,
}

impl FsMetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, kind: MetaKind) -> PathBuf {
        self.dir.join(format!("{kind}.json"))
    }
}

impl MetadataStore for FsMetadataStore {
    fn save(&self, kind: MetaKind, payload: &[u8]) -> Result<(), MetaError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|err| MetaError::Persist(format!("mkdir {}: {err}", self.dir.display())))?;
        let path = self.path(kind);
        // Write-then-rename so a crash never leaves a torn snapshot.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)
            .map_err(|err| MetaError::Persist(format!("write {}: {err}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|err| MetaError::Persist(format!("rename {}: {err}", path.display())))?;
        debug!(%kind, path = %path.display(), "snapshot persisted");
        Ok(())
    }

    fn load(&self, kind: MetaKind) -> Result<Option<Vec<u8>>, MetaError> {
        let path = self.path(kind);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(MetaError::Persist(format!("read {}: {err}", path.display()))),
        }
    }
}
