//! Message model and wire codec for the Pigeon mesh.
//!
//! A [`MeshEnvelope`] is the unit of exchange between peers: routing
//! metadata (id, sender, hop path) plus a typed [`Payload`]. On the wire
//! an envelope is one canonical-JSON object with a flat, all-optional
//! `data` member; the [`codec`] module bridges that permissive schema to
//! the internal tagged union, validating invariants on the way in and
//! preserving unknown payload fields for verbatim forwarding.

pub mod codec;
pub mod envelope;
pub mod payload;

pub use codec::{decode_frame, encode_frame, envelope_from_value, envelope_to_value};
pub use envelope::MeshEnvelope;
pub use payload::{
    BroadcastNotice, BroadcastPriority, DeliveryReceipt, DirectMessage, DiscoveryReply,
    DiscoveryRequest, GatewayStatus, MissingPersonNotice, Payload, PingProbe, PongReply,
    ShelterStatus, SosReport, TriageCondition, TriageReport, Urgency,
};
