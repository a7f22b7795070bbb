//! Device identity persistence.
//!
//! The device id is generated once, on the first access that finds no
//! stored value, and persists until a factory wipe. The display name is
//! cosmetic and editable; it defaults to `Pigeon-` plus the first four
//! hex characters of the id.

use std::str::FromStr;

use pigeon_types::{DeviceId, PigeonError, Result};

/// Key for the stable device id (hex string).
const KEY_DEVICE_ID: &str = "device_id";

/// Key for the human-readable device name.
const KEY_DEVICE_NAME: &str = "device_name";

/// Key for the onboarding-completed flag.
const KEY_ONBOARDING: &str = "onboarding";

// ---------------------------------------------------------------------------
// IdentityStore
// ---------------------------------------------------------------------------

/// Persistent device identity.
pub struct IdentityStore {
    tree: sled::Tree,
}

impl IdentityStore {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Returns the stable device id, generating and persisting a fresh
    /// 128-bit random id on first access.
    ///
    /// # Errors
    ///
    /// Returns [`PigeonError::StorageError`] if the read or the
    /// first-run write fails, or if the stored value is corrupt.
    pub fn device_id(&self) -> Result<DeviceId> {
        if let Some(raw) = self.get(KEY_DEVICE_ID)? {
            return DeviceId::from_str(&raw).map_err(|_| PigeonError::StorageError {
                reason: "stored device id is corrupt".into(),
            });
        }

        let id = DeviceId::generate();
        self.put(KEY_DEVICE_ID, &id.to_string())?;
        Ok(id)
    }

    /// Returns the display name, falling back to the default
    /// `Pigeon-xxxx` derived from the device id.
    pub fn device_name(&self) -> Result<String> {
        match self.get(KEY_DEVICE_NAME)? {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Ok(format!("Pigeon-{}", self.device_id()?.short())),
        }
    }

    /// Persists a new display name.
    pub fn set_device_name(&self, name: &str) -> Result<()> {
        self.put(KEY_DEVICE_NAME, name)
    }

    /// Whether first-run onboarding has been completed.
    pub fn has_completed_onboarding(&self) -> Result<bool> {
        Ok(self.get(KEY_ONBOARDING)?.as_deref() == Some("true"))
    }

    /// Records the onboarding flag.
    pub fn set_onboarding_complete(&self, completed: bool) -> Result<()> {
        self.put(KEY_ONBOARDING, if completed { "true" } else { "false" })
    }

    // -- Internal ---------------------------------------------------------

    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.tree.get(key).map_err(|e| PigeonError::StorageError {
            reason: format!("failed to read '{key}': {e}"),
        })?;
        Ok(value.map(|ivec| String::from_utf8_lossy(&ivec).into_owned()))
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.tree
            .insert(key, value.as_bytes())
            .map_err(|e| PigeonError::StorageError {
                reason: format!("failed to write '{key}': {e}"),
            })?;
        self.tree.flush().map_err(|e| PigeonError::StorageError {
            reason: format!("failed to flush '{key}': {e}"),
        })?;
        Ok(())
    }
}
