//! Core storage engine: database lifecycle and tree access.
//!
//! The [`StorageEngine`] owns the sled database. On
//! [`open`](StorageEngine::open) it opens the database and pre-creates
//! all required trees; the per-concern stores take owned tree handles
//! from it.

use std::path::Path;

use pigeon_types::{MeshConfig, PigeonError, Result};

use crate::identity::IdentityStore;
use crate::messages::MessageLog;
use crate::uploader::UploaderStore;

/// Tree holding the device identity keys.
const TREE_IDENTITY: &str = "identity";

/// Tree holding the message log snapshot.
const TREE_MESSAGES: &str = "messages";

/// Tree holding uploader state (synced ids, endpoint).
const TREE_UPLOADER: &str = "uploader";

// ---------------------------------------------------------------------------
// StorageEngine
// ---------------------------------------------------------------------------

/// Storage engine backed by sled.
///
/// Values are plain wire-JSON: the mesh trusts the link layer's
/// encryption and carries no application-layer crypto, so there is
/// nothing to protect at rest beyond what the OS sandbox provides.
pub struct StorageEngine {
    db: sled::Db,
}

impl StorageEngine {
    /// Opens (or creates) the storage engine at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PigeonError::StorageError`] if the database cannot be
    /// opened.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| PigeonError::StorageError {
            reason: format!("failed to open sled database: {e}"),
        })?;

        // Pre-create all trees so they exist for later access.
        for name in &[TREE_IDENTITY, TREE_MESSAGES, TREE_UPLOADER] {
            db.open_tree(name).map_err(|e| PigeonError::StorageError {
                reason: format!("failed to open tree '{name}': {e}"),
            })?;
        }

        Ok(Self { db })
    }

    /// Flushes all pending writes to disk.
    ///
    /// # Errors
    ///
    /// Returns [`PigeonError::StorageError`] if the flush fails.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| PigeonError::StorageError {
            reason: format!("failed to flush database: {e}"),
        })?;
        Ok(())
    }

    /// Opens a named sled tree.
    fn open_tree(&self, name: &str) -> Result<sled::Tree> {
        self.db.open_tree(name).map_err(|e| PigeonError::StorageError {
            reason: format!("failed to open tree '{name}': {e}"),
        })
    }

    /// Returns the [`IdentityStore`] for this engine.
    pub fn identity(&self) -> Result<IdentityStore> {
        Ok(IdentityStore::new(self.open_tree(TREE_IDENTITY)?))
    }

    /// Returns the [`MessageLog`] for this engine, loading the persisted
    /// snapshot and rebuilding the dedup set from it.
    pub fn message_log(&self, config: &MeshConfig) -> Result<MessageLog> {
        MessageLog::load(self.open_tree(TREE_MESSAGES)?, config.message_queue_size)
    }

    /// Returns the [`UploaderStore`] for this engine, loading the
    /// persisted synced-id set.
    pub fn uploader(&self) -> Result<UploaderStore> {
        UploaderStore::load(self.open_tree(TREE_UPLOADER)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_all_stores() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::open(dir.path())?;

        let _ = engine.identity()?;
        let _ = engine.message_log(&MeshConfig::default())?;
        let _ = engine.uploader()?;
        engine.flush()?;
        Ok(())
    }
}
