//! The bounded message log and its dedup set.
//!
//! The log holds admitted messages newest-first, capped at the
//! configured queue size; evicted messages stay in the in-memory `seen`
//! set so dedup remains correct past eviction. Every mutation rewrites
//! the whole log snapshot under a single key — on restart the snapshot
//! is reloaded and `seen` is rebuilt from it, which forgets ids evicted
//! before the crash. That window is acceptable: delivery is
//! at-least-once anyway and a duplicate arriving after it is unlikely.
//!
//! Persistence failures are logged and do not fail the mutation; the
//! in-memory state stays authoritative for the rest of the process.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use pigeon_protocol::{codec, MeshEnvelope};
use pigeon_types::{MessageId, MessageKind, PigeonError, Result};

/// Single key holding the JSON-array log snapshot.
const KEY_LOG: &str = "log";

// ---------------------------------------------------------------------------
// MessageLog
// ---------------------------------------------------------------------------

struct LogState {
    /// Admitted messages, newest at the front.
    log: VecDeque<MeshEnvelope>,
    /// Every id ever admitted this process, independent of eviction.
    seen: HashSet<MessageId>,
}

/// Bounded, insertion-ordered log of admitted messages with a
/// process-lifetime dedup set.
pub struct MessageLog {
    tree: sled::Tree,
    inner: Mutex<LogState>,
    cap: usize,
}

impl MessageLog {
    /// Loads the persisted snapshot and rebuilds the dedup set from it.
    /// Normally obtained via [`crate::StorageEngine::message_log`].
    ///
    /// Entries that no longer decode (e.g. written by an incompatible
    /// build) are skipped with a warning rather than failing the load.
    pub fn load(tree: sled::Tree, cap: usize) -> Result<Self> {
        let mut log = VecDeque::new();

        let raw = tree.get(KEY_LOG).map_err(|e| PigeonError::StorageError {
            reason: format!("failed to read log snapshot: {e}"),
        })?;

        if let Some(bytes) = raw {
            let values: Vec<serde_json::Value> =
                serde_json::from_slice(&bytes).map_err(|e| PigeonError::StorageError {
                    reason: format!("log snapshot is corrupt: {e}"),
                })?;

            for value in values {
                match codec::envelope_from_value(value) {
                    Ok(envelope) => log.push_back(envelope),
                    Err(e) => {
                        tracing::warn!(%e, "skipping undecodable stored message");
                    }
                }
            }
        }

        log.truncate(cap);
        let seen = log.iter().map(|m| m.id).collect();

        Ok(Self {
            tree,
            inner: Mutex::new(LogState { log, seen }),
            cap,
        })
    }

    /// Admits a message if its id has not been seen before.
    ///
    /// Returns `false` without any state change for a duplicate. On
    /// first sight the id enters `seen`, the message is prepended to
    /// the log, and the tail is evicted past the cap — evicted ids
    /// remain in `seen`.
    pub fn admit(&self, envelope: &MeshEnvelope) -> Result<bool> {
        let mut state = self.lock()?;

        if !state.seen.insert(envelope.id) {
            return Ok(false);
        }

        state.log.push_front(envelope.clone());
        while state.log.len() > self.cap {
            state.log.pop_back();
        }

        self.persist(&state);
        Ok(true)
    }

    /// Whether this id has ever been admitted this process.
    pub fn has_seen(&self, id: &MessageId) -> Result<bool> {
        Ok(self.lock()?.seen.contains(id))
    }

    /// Records an id in the dedup set without storing a message.
    ///
    /// Used for transient probes that are relayed but never logged;
    /// they still must flood at most once. Returns `false` if the id
    /// was already known.
    pub fn mark_seen(&self, id: &MessageId) -> Result<bool> {
        Ok(self.lock()?.seen.insert(*id))
    }

    /// Snapshot of the log, newest first.
    pub fn all(&self) -> Result<Vec<MeshEnvelope>> {
        Ok(self.lock()?.log.iter().cloned().collect())
    }

    /// Snapshot of the log filtered to one message kind, newest first.
    pub fn by_kind(&self, kind: MessageKind) -> Result<Vec<MeshEnvelope>> {
        Ok(self
            .lock()?
            .log
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect())
    }

    /// Number of messages currently retained.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.log.len())
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.log.is_empty())
    }

    /// Empties both the log and the dedup set.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.log.clear();
        state.seen.clear();
        self.persist(&state);
        Ok(())
    }

    // -- Internal ---------------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, LogState>> {
        self.inner.lock().map_err(|e| PigeonError::StorageError {
            reason: format!("message log lock poisoned: {e}"),
        })
    }

    /// Rewrites the snapshot under [`KEY_LOG`]. Failures are logged and
    /// swallowed: the in-memory state stays authoritative and the next
    /// mutation retries the write.
    fn persist(&self, state: &LogState) {
        let values: Vec<serde_json::Value> = state
            .log
            .iter()
            .filter_map(|m| match codec::envelope_to_value(m) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::error!(%e, "failed to encode message for snapshot");
                    None
                }
            })
            .collect();

        let bytes = match serde_json::to_vec(&values) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(%e, "failed to serialize log snapshot");
                return;
            }
        };

        if let Err(e) = self.tree.insert(KEY_LOG, bytes) {
            tracing::error!(%e, "failed to persist log snapshot");
            return;
        }
        if let Err(e) = self.tree.flush() {
            tracing::error!(%e, "failed to flush log snapshot");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pigeon_protocol::{BroadcastNotice, Payload};
    use pigeon_types::DeviceId;

    fn tree() -> (tempfile::TempDir, sled::Tree) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let tree = db.open_tree("messages").unwrap();
        (dir, tree)
    }

    fn broadcast(n: u8) -> MeshEnvelope {
        MeshEnvelope::originate(
            DeviceId::new([n; 16]),
            format!("node-{n}"),
            Payload::Broadcast(BroadcastNotice {
                title: format!("notice {n}"),
                message: "body".into(),
                priority: None,
                latitude: None,
                longitude: None,
            }),
            None,
        )
    }

    #[test]
    fn admit_is_idempotent() -> Result<()> {
        let (_dir, tree) = tree();
        let log = MessageLog::load(tree, 10)?;
        let msg = broadcast(1);

        assert!(log.admit(&msg)?);
        assert!(!log.admit(&msg)?);
        assert_eq!(log.len()?, 1);
        assert!(log.has_seen(&msg.id)?);
        Ok(())
    }

    #[test]
    fn newest_first_order() -> Result<()> {
        let (_dir, tree) = tree();
        let log = MessageLog::load(tree, 10)?;
        let first = broadcast(1);
        let second = broadcast(2);

        log.admit(&first)?;
        log.admit(&second)?;

        let all = log.all()?;
        assert_eq!(all[0].id, second.id);
        assert_eq!(all[1].id, first.id);
        Ok(())
    }

    #[test]
    fn eviction_keeps_dedup() -> Result<()> {
        let (_dir, tree) = tree();
        let log = MessageLog::load(tree, 2)?;
        let oldest = broadcast(1);

        log.admit(&oldest)?;
        log.admit(&broadcast(2))?;
        log.admit(&broadcast(3))?;

        assert_eq!(log.len()?, 2);
        // Evicted from the log but still a duplicate if it comes back.
        assert!(log.has_seen(&oldest.id)?);
        assert!(!log.admit(&oldest)?);
        Ok(())
    }

    #[test]
    fn snapshot_survives_reload() -> Result<()> {
        let (_dir, tree) = tree();
        let msg = broadcast(1);
        {
            let log = MessageLog::load(tree.clone(), 10)?;
            log.admit(&msg)?;
        }

        let reloaded = MessageLog::load(tree, 10)?;
        assert_eq!(reloaded.len()?, 1);
        assert!(reloaded.has_seen(&msg.id)?);
        assert_eq!(reloaded.all()?[0], msg);
        Ok(())
    }

    #[test]
    fn evicted_ids_forgotten_after_reload() -> Result<()> {
        let (_dir, tree) = tree();
        let oldest = broadcast(1);
        {
            let log = MessageLog::load(tree.clone(), 2)?;
            log.admit(&oldest)?;
            log.admit(&broadcast(2))?;
            log.admit(&broadcast(3))?;
            assert!(log.has_seen(&oldest.id)?);
        }

        // The snapshot only holds the retained log; ids evicted before
        // the restart are no longer deduplicated.
        let reloaded = MessageLog::load(tree, 2)?;
        assert!(!reloaded.has_seen(&oldest.id)?);
        Ok(())
    }

    #[test]
    fn by_kind_filters() -> Result<()> {
        let (_dir, tree) = tree();
        let log = MessageLog::load(tree, 10)?;
        log.admit(&broadcast(1))?;

        assert_eq!(log.by_kind(MessageKind::Broadcast)?.len(), 1);
        assert!(log.by_kind(MessageKind::Sos)?.is_empty());
        Ok(())
    }

    #[test]
    fn clear_empties_log_and_seen() -> Result<()> {
        let (_dir, tree) = tree();
        let log = MessageLog::load(tree, 10)?;
        let msg = broadcast(1);
        log.admit(&msg)?;

        log.clear()?;
        assert!(log.is_empty()?);
        assert!(!log.has_seen(&msg.id)?);
        assert!(log.admit(&msg)?);
        Ok(())
    }
}
