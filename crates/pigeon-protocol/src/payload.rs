//! Typed message payloads.
//!
//! The wire format carries a flat `data` object with every field
//! optional; internally each message kind has its own struct so the
//! rest of the runtime never pattern-matches on loose options. The
//! [`crate::codec`] module converts between the two.

use std::fmt;

use pigeon_types::{DeviceId, MessageId, MessageKind, Timestamp};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Field enums
// ---------------------------------------------------------------------------

/// Urgency of an SOS alert.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Patient condition in a triage report.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageCondition {
    Stable,
    Serious,
    Critical,
    Unknown,
}

impl fmt::Display for TriageCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Serious => write!(f, "serious"),
            Self::Critical => write!(f, "critical"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Priority of a broadcast announcement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl fmt::Display for BroadcastPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kind payload structs
// ---------------------------------------------------------------------------

/// Emergency distress call.
#[derive(Clone, Debug, PartialEq)]
pub struct SosReport {
    /// What happened.
    pub description: String,
    /// How urgent it is.
    pub urgency: Urgency,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Free-text location when coordinates are unavailable.
    pub location: Option<String>,
    /// Battery percentage at send time; `-1` when the sensor is unavailable.
    pub battery_level: Option<i32>,
}

/// Medical triage report for one patient.
#[derive(Clone, Debug, PartialEq)]
pub struct TriageReport {
    pub patient_name: String,
    pub condition: TriageCondition,
    pub age: Option<u32>,
    pub injuries: Option<String>,
    pub conscious: Option<bool>,
    pub breathing: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Shelter capacity and status update.
#[derive(Clone, Debug, PartialEq)]
pub struct ShelterStatus {
    pub shelter_name: String,
    pub capacity: u32,
    pub current_occupancy: u32,
    pub accepting_more: bool,
    /// Supplies available at the shelter, if reported.
    pub supplies: Option<Vec<String>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Missing-person notice.
#[derive(Clone, Debug, PartialEq)]
pub struct MissingPersonNotice {
    pub person_name: String,
    pub physical_description: String,
    pub last_seen_location: Option<String>,
    pub last_seen_time: Option<String>,
    pub contact_info: Option<String>,
    /// Optional photo; this is what pushes envelopes toward the frame cap.
    pub photo_base64: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// General broadcast announcement.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastNotice {
    pub title: String,
    pub message: String,
    pub priority: Option<BroadcastPriority>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Direct message to a single device. The target lives on the envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectMessage {
    pub content: String,
}

/// Liveness probe. The origin fields are set by the author on emit so
/// repliers can echo them back.
#[derive(Clone, Debug, PartialEq)]
pub struct PingProbe {
    pub original_sender_id: Option<DeviceId>,
    pub original_timestamp: Option<Timestamp>,
}

/// Reply to a liveness probe, echoing the probe's origin fields.
#[derive(Clone, Debug, PartialEq)]
pub struct PongReply {
    pub original_sender_id: DeviceId,
    pub original_timestamp: Timestamp,
}

/// Topology discovery request carrying the sender's neighbor list.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryRequest {
    pub request_id: MessageId,
    /// The sender's currently connected peers. Empty when not reported.
    pub connected_peers: Vec<DeviceId>,
}

/// Reply to a discovery request.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryReply {
    /// Echoed from the request.
    pub request_id: MessageId,
    pub connected_peers: Vec<DeviceId>,
}

/// Confirmation that a direct message reached its target. Addressed
/// back to the original sender via the envelope target.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryReceipt {
    pub original_message_id: MessageId,
    pub delivered_at: Timestamp,
}

/// Gateway availability advertisement.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayStatus {
    pub is_gateway: bool,
    pub gateway_device_id: DeviceId,
    pub gateway_device_name: String,
    /// How many messages the gateway has uploaded so far.
    pub synced_count: Option<u64>,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Type-discriminated message payload.
///
/// The discriminant mirrors the envelope `type` field; [`Payload::kind`]
/// is the single source of truth for that mapping.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Sos(SosReport),
    Triage(TriageReport),
    Shelter(ShelterStatus),
    MissingPerson(MissingPersonNotice),
    Broadcast(BroadcastNotice),
    Direct(DirectMessage),
    Ping(PingProbe),
    Pong(PongReply),
    Discovery(DiscoveryRequest),
    DiscoveryReply(DiscoveryReply),
    DeliveryReceipt(DeliveryReceipt),
    GatewayStatus(GatewayStatus),
}

impl Payload {
    /// Returns the message kind this payload belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Sos(_) => MessageKind::Sos,
            Self::Triage(_) => MessageKind::Triage,
            Self::Shelter(_) => MessageKind::Shelter,
            Self::MissingPerson(_) => MessageKind::MissingPerson,
            Self::Broadcast(_) => MessageKind::Broadcast,
            Self::Direct(_) => MessageKind::Direct,
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
            Self::Discovery(_) => MessageKind::Discovery,
            Self::DiscoveryReply(_) => MessageKind::DiscoveryReply,
            Self::DeliveryReceipt(_) => MessageKind::DeliveryReceipt,
            Self::GatewayStatus(_) => MessageKind::GatewayStatus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_is_consistent() {
        let payload = Payload::Sos(SosReport {
            description: "trapped".into(),
            urgency: Urgency::High,
            latitude: None,
            longitude: None,
            location: None,
            battery_level: None,
        });
        assert_eq!(payload.kind(), MessageKind::Sos);

        let payload = Payload::GatewayStatus(GatewayStatus {
            is_gateway: true,
            gateway_device_id: DeviceId::new([1; 16]),
            gateway_device_name: "Pigeon-0101".into(),
            synced_count: Some(3),
        });
        assert_eq!(payload.kind(), MessageKind::GatewayStatus);
    }

    #[test]
    fn enums_serialize_lowercase() -> std::result::Result<(), Box<dyn std::error::Error>> {
        assert_eq!(serde_json::to_string(&Urgency::Critical)?, "\"critical\"");
        assert_eq!(serde_json::to_string(&TriageCondition::Serious)?, "\"serious\"");
        assert_eq!(serde_json::to_string(&BroadcastPriority::Urgent)?, "\"urgent\"");
        Ok(())
    }

    #[test]
    fn out_of_domain_enum_rejected() {
        let parsed: std::result::Result<Urgency, _> = serde_json::from_str("\"catastrophic\"");
        assert!(parsed.is_err());
    }
}
