//! Mesh configuration with sensible defaults.
//!
//! All operational parameters are centralized here. Every value has a
//! documented default; the defaults are the protocol constants and
//! changing them changes interop behavior, so deployments normally keep
//! them.

use serde::{Deserialize, Serialize};

use crate::{PigeonError, Result};

/// Global mesh configuration.
///
/// Defaults are the protocol constants. `validate()` is called by the
/// node on startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Maximum hop count a message may attain; beyond this it is dropped.
    /// This is the TTL bounding flood amplification.
    pub max_hops: u32,

    /// Maximum number of messages retained in the store, newest first.
    /// Older messages are evicted but stay in the dedup set.
    pub message_queue_size: usize,

    /// Cadence of the auto-connect loop in seconds.
    pub auto_connect_secs: u64,

    /// Cadence of the gateway sync timer in seconds, while online.
    pub gateway_sync_secs: u64,

    /// Cadence of the gateway status broadcast in seconds, while online.
    pub gateway_broadcast_secs: u64,

    /// Age in seconds after which a gateway advertisement is stale.
    pub gateway_stale_secs: u64,

    /// Link connect attempt timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Advisory cap on simultaneous link sessions. The auto-connect loop
    /// stops dialing at this count; inbound sessions are still accepted.
    pub max_peers: usize,

    /// Largest envelope the node will originate or forward, in bytes.
    /// Dominated by base64 photos in missing-person notices.
    pub max_frame_bytes: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_hops: 10,
            message_queue_size: 500,
            auto_connect_secs: 10,
            gateway_sync_secs: 30,
            gateway_broadcast_secs: 30,
            gateway_stale_secs: 120,
            connect_timeout_secs: 30,
            max_peers: 8,
            max_frame_bytes: 32 * 1024,
        }
    }
}

impl MeshConfig {
    /// Validates all configuration values.
    ///
    /// Returns an error if any value is outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.max_hops == 0 {
            return Err(PigeonError::ConfigError {
                reason: "max_hops must be greater than 0".into(),
            });
        }

        if self.message_queue_size == 0 {
            return Err(PigeonError::ConfigError {
                reason: "message_queue_size must be greater than 0".into(),
            });
        }

        if self.auto_connect_secs == 0
            || self.gateway_sync_secs == 0
            || self.gateway_broadcast_secs == 0
        {
            return Err(PigeonError::ConfigError {
                reason: "timer periods must be greater than 0".into(),
            });
        }

        if self.gateway_stale_secs == 0 {
            return Err(PigeonError::ConfigError {
                reason: "gateway_stale_secs must be greater than 0".into(),
            });
        }

        if self.max_peers == 0 {
            return Err(PigeonError::ConfigError {
                reason: "max_peers must be greater than 0".into(),
            });
        }

        if self.max_frame_bytes == 0 {
            return Err(PigeonError::ConfigError {
                reason: "max_frame_bytes must be greater than 0".into(),
            });
        }

        Ok(())
    }
}
