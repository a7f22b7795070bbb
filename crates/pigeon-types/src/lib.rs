//! Core shared types for the Pigeon emergency mesh runtime.
//!
//! This crate defines all fundamental types used across the workspace.
//! No other crate should define shared types — everything lives here.

pub mod config;

pub use config::MeshConfig;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ---------------------------------------------------------------------------
// DeviceId
// ---------------------------------------------------------------------------

/// Stable 128-bit device identifier.
///
/// Generated once on first run from a secure random source and persisted
/// for the lifetime of the install. This is the routing identifier: it
/// appears in `hops`, in `targetDeviceId`, and in link discovery info.
/// On the wire it is a 32-character lowercase hex string; UUID-style
/// dashes are tolerated on parse.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    /// The fixed byte length of a device id.
    pub const LEN: usize = 16;

    /// Creates a `DeviceId` from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random device id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the first four hex characters, used in the default
    /// device name (`Pigeon-xxxx`).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..2])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for DeviceId {
    type Err = PigeonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Peers generated by other stacks may send UUID-form ids.
        let compact: String = s.chars().filter(|c| *c != '-').collect();
        let bytes = hex::decode(&compact).map_err(|_| PigeonError::InvalidMessage {
            reason: "invalid hex encoding for device id".into(),
        })?;
        if bytes.len() != Self::LEN {
            return Err(PigeonError::InvalidMessage {
                reason: format!("expected {} bytes for device id, got {}", Self::LEN, bytes.len()),
            });
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Unique 128-bit message identifier, assigned by the originator.
///
/// Globally unique with overwhelming probability; a second appearance of
/// the same id anywhere in the mesh is treated as the same message. Hex
/// string on the wire, same format rules as [`DeviceId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// The fixed byte length of a message id.
    pub const LEN: usize = 16;

    /// Creates a `MessageId` from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random message id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for MessageId {
    type Err = PigeonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != '-').collect();
        let bytes = hex::decode(&compact).map_err(|_| PigeonError::InvalidMessage {
            reason: "invalid hex encoding for message id".into(),
        })?;
        if bytes.len() != Self::LEN {
            return Err(PigeonError::InvalidMessage {
                reason: format!("expected {} bytes for message id, got {}", Self::LEN, bytes.len()),
            });
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// UTC timestamp, ISO 8601 on the wire.
///
/// All timestamps are UTC. Time-dependent operations (gateway staleness,
/// receipt ages) take a `Timestamp` parameter instead of reading the
/// clock, so tests can inject values.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a `Timestamp` for the current UTC time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a `Timestamp` from a `DateTime<Utc>`.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Returns the timestamp as an ISO 8601 string.
    pub fn as_str(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Whole seconds elapsed from `self` to `later`. Saturates at zero
    /// if `later` is earlier.
    pub fn seconds_until(&self, later: &Timestamp) -> u64 {
        let delta = later.0.signed_duration_since(self.0).num_seconds();
        delta.max(0) as u64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = PigeonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|e| PigeonError::InvalidMessage {
                reason: format!("invalid ISO 8601 timestamp: {e}"),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Discriminant of a mesh message, the `type` field of the envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Emergency distress call.
    Sos,
    /// Medical triage report for a patient.
    Triage,
    /// Shelter capacity and status update.
    Shelter,
    /// Missing-person notice.
    MissingPerson,
    /// General broadcast announcement.
    Broadcast,
    /// Direct message addressed to a single device.
    Direct,
    /// Liveness probe.
    Ping,
    /// Reply to a liveness probe.
    Pong,
    /// Topology discovery request.
    Discovery,
    /// Reply to a discovery request with the local neighbor list.
    DiscoveryReply,
    /// Confirmation that a direct message reached its target.
    DeliveryReceipt,
    /// Gateway availability advertisement.
    GatewayStatus,
}

impl MessageKind {
    /// Whether messages of this kind enter the persistent log.
    ///
    /// Probes and gateway advertisements recur with fresh ids and
    /// would crowd the bounded log; they are relayed (and deduplicated)
    /// but never stored. Everything else is admitted and becomes
    /// eligible for gateway upload.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Ping | Self::Discovery | Self::GatewayStatus)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sos => "sos",
            Self::Triage => "triage",
            Self::Shelter => "shelter",
            Self::MissingPerson => "missingPerson",
            Self::Broadcast => "broadcast",
            Self::Direct => "direct",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Discovery => "discovery",
            Self::DiscoveryReply => "discoveryReply",
            Self::DeliveryReceipt => "deliveryReceipt",
            Self::GatewayStatus => "gatewayStatus",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// UploadStatus
// ---------------------------------------------------------------------------

/// State of the gateway uploader, surfaced to the hosting application.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UploadStatus {
    /// Nothing to upload, or uploader inactive.
    Idle,
    /// An upload is in flight.
    Syncing,
    /// The last upload succeeded; carries the number of messages sent.
    Success(usize),
    /// The last upload failed; carries a human-readable reason.
    Failed(String),
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Success(n) => write!(f, "success({n})"),
            Self::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

// ---------------------------------------------------------------------------
// MeshEvent
// ---------------------------------------------------------------------------

/// Events emitted by the mesh core to the hosting application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MeshEvent {
    /// A message was admitted to the local store for the first time.
    MessageAdmitted {
        /// The admitted message identifier.
        message_id: MessageId,
        /// Message kind.
        kind: MessageKind,
        /// Original author of the message.
        sender_id: DeviceId,
    },
    /// A link session to a peer was established.
    PeerConnected {
        /// The peer's device id.
        device_id: DeviceId,
    },
    /// A link session to a peer ended.
    PeerDisconnected {
        /// The peer's device id.
        device_id: DeviceId,
    },
    /// The hop-distance estimate for a remote device changed.
    TopologyUpdated {
        /// The remote device.
        device_id: DeviceId,
        /// New best-known hop distance.
        hops: u32,
    },
    /// A gateway appeared, refreshed, or went away.
    GatewayChanged {
        /// The gateway's device id.
        device_id: DeviceId,
        /// Whether the gateway is currently advertised as reachable.
        reachable: bool,
    },
    /// The gateway uploader's status changed.
    UploadStatusChanged {
        /// New status.
        status: UploadStatus,
    },
    /// A delivery receipt arrived for a direct message we originated.
    ReceiptConfirmed {
        /// Id of the original direct message.
        message_id: MessageId,
    },
}

// ---------------------------------------------------------------------------
// PigeonError
// ---------------------------------------------------------------------------

/// Central error type for the Pigeon runtime.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum, ensuring a unified error handling surface. Nothing here is
/// fatal at the core level; every error degrades to "try again later".
#[derive(Debug, Error)]
pub enum PigeonError {
    /// A frame could not be decoded as a message envelope.
    #[error("codec error: {reason}")]
    CodecError {
        /// Human-readable description of the decode failure.
        reason: String,
    },

    /// A message violates a protocol invariant or is missing required fields.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Human-readable description of the validation failure.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// A link-layer operation failed (advertise, connect, send).
    #[error("link error: {reason}")]
    LinkError {
        /// Human-readable description of the link failure.
        reason: String,
    },

    /// A collector upload failed (HTTP error, timeout, reachability loss).
    #[error("upload error: {reason}")]
    UploadError {
        /// Human-readable description of the upload failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`PigeonError`].
pub type Result<T> = std::result::Result<T, PigeonError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_roundtrip_hex() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let id = DeviceId::new([0xAB; 16]);
        let parsed: DeviceId = id.to_string().parse()?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn device_id_accepts_uuid_dashes() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let parsed: DeviceId = "01234567-89ab-cdef-0123-456789abcdef".parse()?;
        assert_eq!(parsed.to_string(), "0123456789abcdef0123456789abcdef");
        Ok(())
    }

    #[test]
    fn device_id_invalid_length() {
        let result: std::result::Result<DeviceId, _> = "abcd".parse();
        assert!(result.is_err());
    }

    #[test]
    fn device_id_invalid_hex() {
        let result: std::result::Result<DeviceId, _> = "zz".repeat(16).parse();
        assert!(result.is_err());
    }

    #[test]
    fn device_id_short_is_four_chars() {
        let id = DeviceId::new([0xA1, 0xB2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(id.short(), "a1b2");
    }

    #[test]
    fn device_id_serde_is_hex_string() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let id = DeviceId::new([0x11; 16]);
        let json = serde_json::to_string(&id)?;
        assert_eq!(json, format!("\"{id}\""));
        let parsed: DeviceId = serde_json::from_str(&json)?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn message_id_roundtrip_hex() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let id = MessageId::new([0x42; 16]);
        let parsed: MessageId = id.to_string().parse()?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }

    #[test]
    fn timestamp_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let ts = Timestamp::now();
        let parsed: Timestamp = ts.as_str().parse()?;
        assert_eq!(ts.as_datetime(), parsed.as_datetime());
        Ok(())
    }

    #[test]
    fn timestamp_display_iso8601() {
        let ts = Timestamp::now();
        assert!(ts.to_string().contains('T'), "ISO 8601 must contain 'T' separator");
    }

    #[test]
    fn timestamp_seconds_until_saturates() {
        let earlier = Timestamp::from_datetime(
            chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        let later = Timestamp::from_datetime(
            chrono::DateTime::parse_from_rfc3339("2026-01-01T00:02:01Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        assert_eq!(earlier.seconds_until(&later), 121);
        assert_eq!(later.seconds_until(&earlier), 0);
    }

    #[test]
    fn message_kind_wire_names() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&MessageKind::MissingPerson)?;
        assert_eq!(json, "\"missingPerson\"");
        let json = serde_json::to_string(&MessageKind::DeliveryReceipt)?;
        assert_eq!(json, "\"deliveryReceipt\"");
        let parsed: MessageKind = serde_json::from_str("\"gatewayStatus\"")?;
        assert_eq!(parsed, MessageKind::GatewayStatus);
        Ok(())
    }

    #[test]
    fn message_kind_display_matches_wire() -> std::result::Result<(), Box<dyn std::error::Error>> {
        for kind in [
            MessageKind::Sos,
            MessageKind::MissingPerson,
            MessageKind::DiscoveryReply,
            MessageKind::GatewayStatus,
        ] {
            let json = serde_json::to_string(&kind)?;
            assert_eq!(json, format!("\"{kind}\""));
        }
        Ok(())
    }

    #[test]
    fn transient_kinds_are_not_persistent() {
        assert!(!MessageKind::Ping.is_persistent());
        assert!(!MessageKind::Discovery.is_persistent());
        assert!(!MessageKind::GatewayStatus.is_persistent());
        assert!(MessageKind::Pong.is_persistent());
        assert!(MessageKind::Sos.is_persistent());
        assert!(MessageKind::DeliveryReceipt.is_persistent());
    }

    #[test]
    fn upload_status_display() {
        assert_eq!(UploadStatus::Idle.to_string(), "idle");
        assert_eq!(UploadStatus::Success(5).to_string(), "success(5)");
        assert_eq!(
            UploadStatus::Failed("HTTP 500".into()).to_string(),
            "failed(HTTP 500)"
        );
    }

    #[test]
    fn error_display() {
        let err = PigeonError::CodecError {
            reason: "truncated frame".into(),
        };
        assert!(err.to_string().contains("truncated frame"));
    }
}
