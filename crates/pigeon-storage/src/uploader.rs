//! Uploader-side persistence: the synced-id set and the collector
//! endpoint.
//!
//! An id enters the set when the collector acknowledged an upload
//! containing it, and never leaves except through
//! [`UploaderStore::clear_synced`] (the force-resync path after
//! collector data loss). The set is persisted wholesale on every
//! mutation; a write failure is logged and the in-memory set stays
//! authoritative — after a crash the lost ids are simply re-uploaded,
//! and the collector dedups by id.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use pigeon_types::{MessageId, PigeonError, Result};

/// Key holding the synced-id set (JSON array of hex ids).
const KEY_SYNCED_IDS: &str = "synced_ids";

/// Key holding the collector endpoint URL.
const KEY_ENDPOINT: &str = "endpoint";

// ---------------------------------------------------------------------------
// UploaderStore
// ---------------------------------------------------------------------------

/// Persistent gateway-uploader state.
pub struct UploaderStore {
    tree: sled::Tree,
    synced: Mutex<HashSet<MessageId>>,
}

impl UploaderStore {
    /// Loads the persisted synced-id set. Normally obtained via
    /// [`crate::StorageEngine::uploader`].
    pub fn load(tree: sled::Tree) -> Result<Self> {
        let mut synced = HashSet::new();

        let raw = tree
            .get(KEY_SYNCED_IDS)
            .map_err(|e| PigeonError::StorageError {
                reason: format!("failed to read synced ids: {e}"),
            })?;

        if let Some(bytes) = raw {
            let ids: Vec<String> =
                serde_json::from_slice(&bytes).map_err(|e| PigeonError::StorageError {
                    reason: format!("synced-id set is corrupt: {e}"),
                })?;
            for id in ids {
                match MessageId::from_str(&id) {
                    Ok(id) => {
                        synced.insert(id);
                    }
                    Err(e) => {
                        tracing::warn!(%e, "skipping unparseable synced id");
                    }
                }
            }
        }

        Ok(Self {
            tree,
            synced: Mutex::new(synced),
        })
    }

    /// Whether this message id has already been uploaded.
    pub fn is_synced(&self, id: &MessageId) -> Result<bool> {
        Ok(self.lock()?.contains(id))
    }

    /// Number of ids the collector has acknowledged.
    pub fn synced_count(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Records a batch of ids as uploaded and persists the set.
    ///
    /// Called only after a 2xx collector response, so a partial batch is
    /// never recorded.
    pub fn mark_synced(&self, ids: &[MessageId]) -> Result<()> {
        let mut synced = self.lock()?;
        synced.extend(ids.iter().copied());
        self.persist(&synced);
        Ok(())
    }

    /// Empties the set so every stored message becomes eligible for
    /// upload again.
    pub fn clear_synced(&self) -> Result<()> {
        let mut synced = self.lock()?;
        synced.clear();
        self.persist(&synced);
        Ok(())
    }

    /// Returns the configured collector endpoint, if any.
    pub fn endpoint(&self) -> Result<Option<String>> {
        let value = self
            .tree
            .get(KEY_ENDPOINT)
            .map_err(|e| PigeonError::StorageError {
                reason: format!("failed to read endpoint: {e}"),
            })?;
        Ok(value.map(|ivec| String::from_utf8_lossy(&ivec).into_owned()))
    }

    /// Persists the collector endpoint.
    pub fn set_endpoint(&self, url: &str) -> Result<()> {
        self.tree
            .insert(KEY_ENDPOINT, url.as_bytes())
            .map_err(|e| PigeonError::StorageError {
                reason: format!("failed to write endpoint: {e}"),
            })?;
        self.tree.flush().map_err(|e| PigeonError::StorageError {
            reason: format!("failed to flush endpoint: {e}"),
        })?;
        Ok(())
    }

    // -- Internal ---------------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, HashSet<MessageId>>> {
        self.synced.lock().map_err(|e| PigeonError::StorageError {
            reason: format!("synced-id lock poisoned: {e}"),
        })
    }

    fn persist(&self, synced: &HashSet<MessageId>) {
        let ids: Vec<String> = synced.iter().map(|id| id.to_string()).collect();
        let bytes = match serde_json::to_vec(&ids) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(%e, "failed to serialize synced-id set");
                return;
            }
        };

        if let Err(e) = self.tree.insert(KEY_SYNCED_IDS, bytes) {
            tracing::error!(%e, "failed to persist synced-id set");
            return;
        }
        if let Err(e) = self.tree.flush() {
            tracing::error!(%e, "failed to flush synced-id set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> (tempfile::TempDir, sled::Tree) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let tree = db.open_tree("uploader").unwrap();
        (dir, tree)
    }

    #[test]
    fn mark_and_query() -> Result<()> {
        let (_dir, tree) = tree();
        let store = UploaderStore::load(tree)?;
        let a = MessageId::new([1; 16]);
        let b = MessageId::new([2; 16]);

        store.mark_synced(&[a])?;
        assert!(store.is_synced(&a)?);
        assert!(!store.is_synced(&b)?);
        assert_eq!(store.synced_count()?, 1);
        Ok(())
    }

    #[test]
    fn synced_ids_survive_reload() -> Result<()> {
        let (_dir, tree) = tree();
        let a = MessageId::new([1; 16]);
        {
            let store = UploaderStore::load(tree.clone())?;
            store.mark_synced(&[a])?;
        }

        let reloaded = UploaderStore::load(tree)?;
        assert!(reloaded.is_synced(&a)?);
        Ok(())
    }

    #[test]
    fn clear_forgets_everything() -> Result<()> {
        let (_dir, tree) = tree();
        let store = UploaderStore::load(tree)?;
        store.mark_synced(&[MessageId::new([1; 16]), MessageId::new([2; 16])])?;

        store.clear_synced()?;
        assert_eq!(store.synced_count()?, 0);
        Ok(())
    }

    #[test]
    fn endpoint_roundtrip() -> Result<()> {
        let (_dir, tree) = tree();
        let store = UploaderStore::load(tree)?;

        assert!(store.endpoint()?.is_none());
        store.set_endpoint("https://collector.example.org/api/messages")?;
        assert_eq!(
            store.endpoint()?.as_deref(),
            Some("https://collector.example.org/api/messages")
        );
        Ok(())
    }
}
