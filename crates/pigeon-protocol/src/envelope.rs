//! The mesh message envelope.
//!
//! An envelope is immutable after decode except for the hop path, which
//! the router advances via [`MeshEnvelope::add_hop`] before each
//! outbound relay.

use pigeon_types::{DeviceId, MessageId, MessageKind, PigeonError, Result, Timestamp};

use crate::payload::Payload;

// ---------------------------------------------------------------------------
// MeshEnvelope
// ---------------------------------------------------------------------------

/// A mesh message: routing metadata plus a typed payload.
///
/// Invariants, enforced on decode and preserved by [`add_hop`](Self::add_hop):
///
/// - `hops[0] == sender_id` — the path starts at the originator.
/// - `hop_count == hops.len() - 1`.
///
/// `sender_id`/`sender_name` are the original author and are never
/// rewritten on relay.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshEnvelope {
    /// Unique id assigned by the originator.
    pub id: MessageId,
    /// Original author.
    pub sender_id: DeviceId,
    /// Author's display name at send time.
    pub sender_name: String,
    /// Author's wall clock at creation.
    pub timestamp: Timestamp,
    /// Ordered path of devices the message has traversed.
    pub hops: Vec<DeviceId>,
    /// Number of relays so far; `hops.len() - 1`.
    pub hop_count: u32,
    /// Addressee for `direct` and `deliveryReceipt` messages.
    pub target_device_id: Option<DeviceId>,
    /// Typed payload; its kind is the envelope's wire `type`.
    pub payload: Payload,
    /// Unknown payload fields from the wire, preserved so relays do not
    /// silently drop data emitted by newer peers.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MeshEnvelope {
    /// Builds a freshly originated envelope: new id, zero hops, path
    /// seeded with the author.
    pub fn originate(
        sender_id: DeviceId,
        sender_name: impl Into<String>,
        payload: Payload,
        target_device_id: Option<DeviceId>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender_id,
            sender_name: sender_name.into(),
            timestamp: Timestamp::now(),
            hops: vec![sender_id],
            hop_count: 0,
            target_device_id,
            payload,
            extra: serde_json::Map::new(),
        }
    }

    /// Returns the message kind (the wire `type`).
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Appends a relaying device to the path and bumps the hop count.
    ///
    /// Callers re-encode after this so peers observe the updated path.
    pub fn add_hop(&mut self, device_id: DeviceId) {
        self.hops.push(device_id);
        self.hop_count += 1;
    }

    /// Hop-distance from the receiving node to the originator: the
    /// number of links the message crossed to get here.
    pub fn hop_distance(&self) -> u32 {
        self.hop_count + 1
    }

    /// Checks the path invariants. Decode calls this; violating
    /// messages are dropped at warn level.
    pub fn check_invariants(&self) -> Result<()> {
        if self.hops.is_empty() {
            return Err(PigeonError::InvalidMessage {
                reason: "hops must not be empty".into(),
            });
        }
        if self.hops[0] != self.sender_id {
            return Err(PigeonError::InvalidMessage {
                reason: format!(
                    "hops[0] ({}) does not match senderId ({})",
                    self.hops[0], self.sender_id,
                ),
            });
        }
        if self.hop_count as usize != self.hops.len() - 1 {
            return Err(PigeonError::InvalidMessage {
                reason: format!(
                    "hopCount {} does not match hops length {}",
                    self.hop_count,
                    self.hops.len(),
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{BroadcastNotice, Payload};

    fn broadcast() -> Payload {
        Payload::Broadcast(BroadcastNotice {
            title: "water point".into(),
            message: "north entrance".into(),
            priority: None,
            latitude: None,
            longitude: None,
        })
    }

    #[test]
    fn originate_seeds_path_with_sender() {
        let sender = DeviceId::new([7; 16]);
        let env = MeshEnvelope::originate(sender, "Pigeon-0707", broadcast(), None);

        assert_eq!(env.hops, vec![sender]);
        assert_eq!(env.hop_count, 0);
        assert_eq!(env.sender_id, sender);
        assert!(env.check_invariants().is_ok());
    }

    #[test]
    fn add_hop_keeps_invariants() {
        let sender = DeviceId::new([1; 16]);
        let relay = DeviceId::new([2; 16]);
        let mut env = MeshEnvelope::originate(sender, "a", broadcast(), None);

        env.add_hop(relay);

        assert_eq!(env.hops, vec![sender, relay]);
        assert_eq!(env.hop_count, 1);
        assert_eq!(env.hop_distance(), 2);
        assert!(env.check_invariants().is_ok());
    }

    #[test]
    fn mismatched_hop_count_rejected() {
        let sender = DeviceId::new([1; 16]);
        let mut env = MeshEnvelope::originate(sender, "a", broadcast(), None);
        env.hop_count = 3;

        assert!(env.check_invariants().is_err());
    }

    #[test]
    fn foreign_path_head_rejected() {
        let sender = DeviceId::new([1; 16]);
        let mut env = MeshEnvelope::originate(sender, "a", broadcast(), None);
        env.hops[0] = DeviceId::new([9; 16]);

        assert!(env.check_invariants().is_err());
    }
}
