//! Wire codec: canonical-JSON frames ↔ typed envelopes.
//!
//! One frame is one JSON-encoded envelope; framing is the link's job.
//! The wire `data` member is a flat object in which every field is
//! optional — a schema-tolerance convenience, not the internal model.
//! Decoding checks the per-kind required fields and the path
//! invariants; unknown `data` fields are captured and re-emitted
//! verbatim on encode so relays never silently lose data from newer
//! peers. Unknown envelope-level fields are ignored.

use pigeon_types::{DeviceId, MessageId, MessageKind, PigeonError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::MeshEnvelope;
use crate::payload::{
    BroadcastNotice, BroadcastPriority, DeliveryReceipt, DirectMessage, DiscoveryReply,
    DiscoveryRequest, GatewayStatus, MissingPersonNotice, Payload, PingProbe, PongReply,
    ShelterStatus, SosReport, TriageCondition, TriageReport, Urgency,
};

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

/// On-wire envelope. Serde enforces the required envelope fields;
/// `data` defaults to empty for kinds that carry none.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    id: MessageId,
    #[serde(rename = "type")]
    kind: MessageKind,
    sender_id: DeviceId,
    sender_name: String,
    timestamp: Timestamp,
    hops: Vec<DeviceId>,
    hop_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_device_id: Option<DeviceId>,
    #[serde(default)]
    data: Option<WireData>,
}

/// On-wire payload: the union of every kind's fields, all optional.
/// Unmatched keys land in `extra` via the flatten.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireData {
    // sos
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    urgency: Option<Urgency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery_level: Option<i32>,

    // triage
    #[serde(skip_serializing_if = "Option::is_none")]
    patient_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<TriageCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    injuries: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conscious: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    breathing: Option<bool>,

    // shelter
    #[serde(skip_serializing_if = "Option::is_none")]
    shelter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_occupancy: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    accepting_more: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    supplies: Option<Vec<String>>,

    // missing person
    #[serde(skip_serializing_if = "Option::is_none")]
    person_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    physical_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contact_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo_base64: Option<String>,

    // broadcast
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<BroadcastPriority>,

    // direct
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,

    // ping / pong
    #[serde(skip_serializing_if = "Option::is_none")]
    original_sender_id: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_timestamp: Option<Timestamp>,

    // discovery / discoveryReply
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connected_peers: Option<Vec<DeviceId>>,

    // deliveryReceipt
    #[serde(skip_serializing_if = "Option::is_none")]
    original_message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivered_at: Option<Timestamp>,

    // gatewayStatus
    #[serde(skip_serializing_if = "Option::is_none")]
    is_gateway: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway_device_id: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway_device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    synced_count: Option<u64>,

    // shared coordinates
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,

    // forward compatibility
    #[serde(flatten)]
    extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decodes one frame into a [`MeshEnvelope`].
///
/// # Errors
///
/// - [`PigeonError::CodecError`] if the frame is not a well-formed
///   envelope (malformed JSON, missing required envelope fields,
///   out-of-domain enum values).
/// - [`PigeonError::InvalidMessage`] if the envelope parses but
///   violates an invariant: `hopCount != hops.len() - 1`,
///   `hops[0] != senderId`, a per-kind required payload field is
///   missing, or a directed kind lacks `targetDeviceId`.
pub fn decode_frame(bytes: &[u8]) -> Result<MeshEnvelope> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| PigeonError::CodecError {
            reason: format!("malformed frame: {e}"),
        })?;
    from_wire(wire)
}

/// Decodes an envelope from an already-parsed JSON value. Used by the
/// store snapshot, which persists a JSON array of envelopes.
pub fn envelope_from_value(value: Value) -> Result<MeshEnvelope> {
    let wire: WireEnvelope =
        serde_json::from_value(value).map_err(|e| PigeonError::CodecError {
            reason: format!("malformed stored envelope: {e}"),
        })?;
    from_wire(wire)
}

fn from_wire(wire: WireEnvelope) -> Result<MeshEnvelope> {
    let kind = wire.kind;
    let data = wire.data.unwrap_or_default();
    let (payload, extra) = decode_payload(kind, data)?;

    let envelope = MeshEnvelope {
        id: wire.id,
        sender_id: wire.sender_id,
        sender_name: wire.sender_name,
        timestamp: wire.timestamp,
        hops: wire.hops,
        hop_count: wire.hop_count,
        target_device_id: wire.target_device_id,
        payload,
        extra,
    };

    envelope.check_invariants()?;

    if matches!(kind, MessageKind::Direct | MessageKind::DeliveryReceipt)
        && envelope.target_device_id.is_none()
    {
        return Err(PigeonError::InvalidMessage {
            reason: format!("{kind} message missing targetDeviceId"),
        });
    }

    Ok(envelope)
}

/// Extracts the one required field of a kind, or fails with the field name.
fn require<T>(field: Option<T>, name: &str, kind: MessageKind) -> Result<T> {
    field.ok_or_else(|| PigeonError::InvalidMessage {
        reason: format!("{kind} message missing required field '{name}'"),
    })
}

fn decode_payload(kind: MessageKind, data: WireData) -> Result<(Payload, Map<String, Value>)> {
    let extra = data.extra;

    let payload = match kind {
        MessageKind::Sos => {
            if let Some(level) = data.battery_level {
                if !(-1..=100).contains(&level) {
                    return Err(PigeonError::InvalidMessage {
                        reason: format!("batteryLevel {level} outside [-1, 100]"),
                    });
                }
            }
            Payload::Sos(SosReport {
                description: require(data.description, "description", kind)?,
                urgency: require(data.urgency, "urgency", kind)?,
                latitude: data.latitude,
                longitude: data.longitude,
                location: data.location,
                battery_level: data.battery_level,
            })
        }
        MessageKind::Triage => Payload::Triage(TriageReport {
            patient_name: require(data.patient_name, "patientName", kind)?,
            condition: require(data.condition, "condition", kind)?,
            age: data.age,
            injuries: data.injuries,
            conscious: data.conscious,
            breathing: data.breathing,
            latitude: data.latitude,
            longitude: data.longitude,
        }),
        MessageKind::Shelter => Payload::Shelter(ShelterStatus {
            shelter_name: require(data.shelter_name, "shelterName", kind)?,
            capacity: require(data.capacity, "capacity", kind)?,
            current_occupancy: require(data.current_occupancy, "currentOccupancy", kind)?,
            accepting_more: require(data.accepting_more, "acceptingMore", kind)?,
            supplies: data.supplies,
            latitude: data.latitude,
            longitude: data.longitude,
        }),
        MessageKind::MissingPerson => Payload::MissingPerson(MissingPersonNotice {
            person_name: require(data.person_name, "personName", kind)?,
            physical_description: require(data.physical_description, "physicalDescription", kind)?,
            last_seen_location: data.last_seen_location,
            last_seen_time: data.last_seen_time,
            contact_info: data.contact_info,
            photo_base64: data.photo_base64,
            latitude: data.latitude,
            longitude: data.longitude,
        }),
        MessageKind::Broadcast => Payload::Broadcast(BroadcastNotice {
            title: require(data.title, "title", kind)?,
            message: require(data.message, "message", kind)?,
            priority: data.priority,
            latitude: data.latitude,
            longitude: data.longitude,
        }),
        MessageKind::Direct => Payload::Direct(DirectMessage {
            content: require(data.content, "content", kind)?,
        }),
        MessageKind::Ping => Payload::Ping(PingProbe {
            original_sender_id: data.original_sender_id,
            original_timestamp: data.original_timestamp,
        }),
        MessageKind::Pong => Payload::Pong(PongReply {
            original_sender_id: require(data.original_sender_id, "originalSenderId", kind)?,
            original_timestamp: require(data.original_timestamp, "originalTimestamp", kind)?,
        }),
        MessageKind::Discovery => Payload::Discovery(DiscoveryRequest {
            request_id: require(data.request_id, "requestId", kind)?,
            connected_peers: data.connected_peers.unwrap_or_default(),
        }),
        MessageKind::DiscoveryReply => Payload::DiscoveryReply(DiscoveryReply {
            request_id: require(data.request_id, "requestId", kind)?,
            connected_peers: require(data.connected_peers, "connectedPeers", kind)?,
        }),
        MessageKind::DeliveryReceipt => Payload::DeliveryReceipt(DeliveryReceipt {
            original_message_id: require(data.original_message_id, "originalMessageId", kind)?,
            delivered_at: require(data.delivered_at, "deliveredAt", kind)?,
        }),
        MessageKind::GatewayStatus => Payload::GatewayStatus(GatewayStatus {
            is_gateway: require(data.is_gateway, "isGateway", kind)?,
            gateway_device_id: require(data.gateway_device_id, "gatewayDeviceId", kind)?,
            gateway_device_name: require(data.gateway_device_name, "gatewayDeviceName", kind)?,
            synced_count: data.synced_count,
        }),
    };

    Ok((payload, extra))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encodes an envelope into one wire frame.
///
/// # Errors
///
/// Returns [`PigeonError::CodecError`] if serialization fails.
pub fn encode_frame(envelope: &MeshEnvelope) -> Result<Vec<u8>> {
    serde_json::to_vec(&to_wire(envelope)).map_err(|e| PigeonError::CodecError {
        reason: format!("failed to encode envelope: {e}"),
    })
}

/// Encodes an envelope as a JSON value, for embedding in a larger
/// document (store snapshot, collector upload body).
pub fn envelope_to_value(envelope: &MeshEnvelope) -> Result<Value> {
    serde_json::to_value(to_wire(envelope)).map_err(|e| PigeonError::CodecError {
        reason: format!("failed to encode envelope: {e}"),
    })
}

fn to_wire(envelope: &MeshEnvelope) -> WireEnvelope {
    WireEnvelope {
        id: envelope.id,
        kind: envelope.kind(),
        sender_id: envelope.sender_id,
        sender_name: envelope.sender_name.clone(),
        timestamp: envelope.timestamp.clone(),
        hops: envelope.hops.clone(),
        hop_count: envelope.hop_count,
        target_device_id: envelope.target_device_id,
        data: Some(encode_payload(&envelope.payload, &envelope.extra)),
    }
}

fn encode_payload(payload: &Payload, extra: &Map<String, Value>) -> WireData {
    let mut data = WireData {
        extra: extra.clone(),
        ..WireData::default()
    };

    match payload {
        Payload::Sos(p) => {
            data.description = Some(p.description.clone());
            data.urgency = Some(p.urgency);
            data.latitude = p.latitude;
            data.longitude = p.longitude;
            data.location = p.location.clone();
            data.battery_level = p.battery_level;
        }
        Payload::Triage(p) => {
            data.patient_name = Some(p.patient_name.clone());
            data.condition = Some(p.condition);
            data.age = p.age;
            data.injuries = p.injuries.clone();
            data.conscious = p.conscious;
            data.breathing = p.breathing;
            data.latitude = p.latitude;
            data.longitude = p.longitude;
        }
        Payload::Shelter(p) => {
            data.shelter_name = Some(p.shelter_name.clone());
            data.capacity = Some(p.capacity);
            data.current_occupancy = Some(p.current_occupancy);
            data.accepting_more = Some(p.accepting_more);
            data.supplies = p.supplies.clone();
            data.latitude = p.latitude;
            data.longitude = p.longitude;
        }
        Payload::MissingPerson(p) => {
            data.person_name = Some(p.person_name.clone());
            data.physical_description = Some(p.physical_description.clone());
            data.last_seen_location = p.last_seen_location.clone();
            data.last_seen_time = p.last_seen_time.clone();
            data.contact_info = p.contact_info.clone();
            data.photo_base64 = p.photo_base64.clone();
            data.latitude = p.latitude;
            data.longitude = p.longitude;
        }
        Payload::Broadcast(p) => {
            data.title = Some(p.title.clone());
            data.message = Some(p.message.clone());
            data.priority = p.priority;
            data.latitude = p.latitude;
            data.longitude = p.longitude;
        }
        Payload::Direct(p) => {
            data.content = Some(p.content.clone());
        }
        Payload::Ping(p) => {
            data.original_sender_id = p.original_sender_id;
            data.original_timestamp = p.original_timestamp.clone();
        }
        Payload::Pong(p) => {
            data.original_sender_id = Some(p.original_sender_id);
            data.original_timestamp = Some(p.original_timestamp.clone());
        }
        Payload::Discovery(p) => {
            data.request_id = Some(p.request_id);
            data.connected_peers = Some(p.connected_peers.clone());
        }
        Payload::DiscoveryReply(p) => {
            data.request_id = Some(p.request_id);
            data.connected_peers = Some(p.connected_peers.clone());
        }
        Payload::DeliveryReceipt(p) => {
            data.original_message_id = Some(p.original_message_id);
            data.delivered_at = Some(p.delivered_at.clone());
        }
        Payload::GatewayStatus(p) => {
            data.is_gateway = Some(p.is_gateway);
            data.gateway_device_id = Some(p.gateway_device_id);
            data.gateway_device_name = Some(p.gateway_device_name.clone());
            data.synced_count = p.synced_count;
        }
    }

    data
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn device(b: u8) -> DeviceId {
        DeviceId::new([b; 16])
    }

    fn sos_envelope() -> MeshEnvelope {
        MeshEnvelope::originate(
            device(1),
            "Pigeon-0101",
            Payload::Sos(SosReport {
                description: "trapped under rubble".into(),
                urgency: Urgency::Critical,
                latitude: Some(37.7749),
                longitude: Some(-122.4194),
                location: None,
                battery_level: Some(23),
            }),
            None,
        )
    }

    #[test]
    fn roundtrip_preserves_envelope() -> Result<()> {
        let env = sos_envelope();
        let bytes = encode_frame(&env)?;
        let decoded = decode_frame(&bytes)?;
        assert_eq!(env, decoded);
        Ok(())
    }

    #[test]
    fn roundtrip_after_relay() -> Result<()> {
        let mut env = sos_envelope();
        env.add_hop(device(2));
        env.add_hop(device(3));

        let decoded = decode_frame(&encode_frame(&env)?)?;
        assert_eq!(decoded.hop_count, 2);
        assert_eq!(decoded.hops, vec![device(1), device(2), device(3)]);
        Ok(())
    }

    #[test]
    fn wire_field_names_are_camel_case() -> Result<()> {
        let bytes = encode_frame(&sos_envelope())?;
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "sos");
        assert!(value.get("senderId").is_some());
        assert!(value.get("senderName").is_some());
        assert!(value.get("hopCount").is_some());
        assert_eq!(value["data"]["urgency"], "critical");
        Ok(())
    }

    #[test]
    fn missing_envelope_field_is_codec_error() {
        // No hops / hopCount.
        let frame = br#"{"id":"00000000000000000000000000000001","type":"ping",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z"}"#;
        match decode_frame(frame) {
            Err(PigeonError::CodecError { .. }) => {}
            other => panic!("expected codec error, got {other:?}"),
        }
    }

    #[test]
    fn hop_count_mismatch_rejected() {
        let frame = br#"{"id":"00000000000000000000000000000001","type":"ping",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z",
            "hops":["00000000000000000000000000000002"],"hopCount":4,"data":{}}"#;
        match decode_frame(frame) {
            Err(PigeonError::InvalidMessage { reason }) => {
                assert!(reason.contains("hopCount"));
            }
            other => panic!("expected invalid message, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_payload_field_rejected() {
        // sos without urgency.
        let frame = br#"{"id":"00000000000000000000000000000001","type":"sos",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z",
            "hops":["00000000000000000000000000000002"],"hopCount":0,
            "data":{"description":"help"}}"#;
        match decode_frame(frame) {
            Err(PigeonError::InvalidMessage { reason }) => {
                assert!(reason.contains("urgency"));
            }
            other => panic!("expected invalid message, got {other:?}"),
        }
    }

    #[test]
    fn direct_without_target_rejected() {
        let frame = br#"{"id":"00000000000000000000000000000001","type":"direct",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z",
            "hops":["00000000000000000000000000000002"],"hopCount":0,
            "data":{"content":"hello"}}"#;
        assert!(decode_frame(frame).is_err());
    }

    #[test]
    fn battery_level_out_of_range_rejected() {
        let frame = br#"{"id":"00000000000000000000000000000001","type":"sos",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z",
            "hops":["00000000000000000000000000000002"],"hopCount":0,
            "data":{"description":"help","urgency":"high","batteryLevel":250}}"#;
        assert!(decode_frame(frame).is_err());
    }

    #[test]
    fn unknown_payload_fields_survive_relay() -> Result<()> {
        let frame = br#"{"id":"00000000000000000000000000000001","type":"broadcast",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z",
            "hops":["00000000000000000000000000000002"],"hopCount":0,
            "data":{"title":"water","message":"north gate","futureField":{"a":1}}}"#;

        let mut env = decode_frame(frame)?;
        assert_eq!(env.extra["futureField"]["a"], 1);

        env.add_hop(DeviceId::new([3; 16]));
        let reencoded = encode_frame(&env)?;
        let value: Value = serde_json::from_slice(&reencoded).unwrap();
        assert_eq!(value["data"]["futureField"]["a"], 1);
        Ok(())
    }

    #[test]
    fn unknown_enum_value_is_decode_error() {
        let frame = br#"{"id":"00000000000000000000000000000001","type":"sos",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z",
            "hops":["00000000000000000000000000000002"],"hopCount":0,
            "data":{"description":"help","urgency":"catastrophic"}}"#;
        match decode_frame(frame) {
            Err(PigeonError::CodecError { .. }) => {}
            other => panic!("expected codec error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_frame_is_codec_error() {
        match decode_frame(b"\x00\x01not json") {
            Err(PigeonError::CodecError { .. }) => {}
            other => panic!("expected codec error, got {other:?}"),
        }
    }

    #[test]
    fn absent_data_decodes_for_ping() -> Result<()> {
        let frame = br#"{"id":"00000000000000000000000000000001","type":"ping",
            "senderId":"00000000000000000000000000000002","senderName":"x",
            "timestamp":"2026-03-01T10:00:00Z",
            "hops":["00000000000000000000000000000002"],"hopCount":0}"#;
        let env = decode_frame(frame)?;
        assert!(matches!(env.payload, Payload::Ping(_)));
        Ok(())
    }

    #[test]
    fn gateway_status_roundtrip() -> Result<()> {
        let env = MeshEnvelope::originate(
            device(9),
            "Pigeon-0909",
            Payload::GatewayStatus(GatewayStatus {
                is_gateway: true,
                gateway_device_id: device(9),
                gateway_device_name: "Pigeon-0909".into(),
                synced_count: Some(12),
            }),
            None,
        );
        let decoded = decode_frame(&encode_frame(&env)?)?;
        assert_eq!(env, decoded);

        let value: Value = serde_json::from_slice(&encode_frame(&env)?).unwrap();
        assert_eq!(value["data"]["isGateway"], true);
        assert_eq!(value["data"]["syncedCount"], 12);
        Ok(())
    }
}
