//! The mesh router: dedup, TTL, per-kind dispatch, forwarding.
//!
//! [`MeshRouter`] is deliberately synchronous. Every entry point
//! returns a [`Dispatch`] — the frames to put on the link and the
//! events to surface — instead of doing I/O itself. The event loop
//! executes the dispatch, so a message is admitted to the dedup set
//! and its forward decided in one uninterrupted step: a second copy
//! arriving from another peer can never produce a second forward.
//!
//! # Hop convention
//!
//! `hops` starts as `[senderId]` with `hopCount = 0`; each relay
//! appends itself before the outbound send. On arrival,
//! `hopCount + 1` is the hop-distance to the originator: a message
//! from a direct neighbor arrives with `hopCount = 0`, distance 1.

use std::collections::HashSet;
use std::sync::Arc;

use pigeon_link::PeerInfo;
use pigeon_protocol::{
    codec, DeliveryReceipt, DiscoveryReply, DiscoveryRequest, MeshEnvelope, Payload, PingProbe,
    PongReply,
};
use pigeon_storage::MessageLog;
use pigeon_types::{
    DeviceId, MeshConfig, MeshEvent, MessageId, MessageKind, PigeonError, Result, Timestamp,
};

use crate::receipts::ReceiptTable;
use crate::topology::TopologyTracker;

// ---------------------------------------------------------------------------
// Outbound / Dispatch
// ---------------------------------------------------------------------------

/// One frame to put on the link: send to every connected peer except
/// `except` (the peer the message came from, for relays).
#[derive(Debug)]
pub struct Outbound {
    /// The envelope as it will appear on the wire (hop already
    /// appended for relays).
    pub envelope: MeshEnvelope,
    /// The encoded frame.
    pub bytes: Vec<u8>,
    /// Excluded recipient, if any.
    pub except: Option<DeviceId>,
}

/// Result of one router entry point: frames to send and events to
/// surface, in order.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub outbound: Vec<Outbound>,
    pub events: Vec<MeshEvent>,
}

impl Dispatch {
    fn merge(&mut self, other: Dispatch) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }
}

// ---------------------------------------------------------------------------
// MeshRouter
// ---------------------------------------------------------------------------

/// Per-node routing state and the admission pipeline.
pub struct MeshRouter {
    device_id: DeviceId,
    device_name: String,
    config: MeshConfig,
    log: Arc<MessageLog>,
    topology: TopologyTracker,
    receipts: ReceiptTable,
    /// Peers currently advertising nearby.
    discovered: HashSet<DeviceId>,
    /// Peers with an established session.
    connected: HashSet<DeviceId>,
}

impl MeshRouter {
    /// Creates a router over the given message log.
    pub fn new(
        device_id: DeviceId,
        device_name: impl Into<String>,
        config: MeshConfig,
        log: Arc<MessageLog>,
    ) -> Self {
        let topology = TopologyTracker::new(device_id, config.gateway_stale_secs);
        Self {
            device_id,
            device_name: device_name.into(),
            config,
            log,
            topology,
            receipts: ReceiptTable::new(),
            discovered: HashSet::new(),
            connected: HashSet::new(),
        }
    }

    /// The local device id.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// The local display name used on originated messages.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Applies a display-name change; future originations carry it.
    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.device_name = name.into();
    }

    /// Read access to the topology tables.
    pub fn topology(&self) -> &TopologyTracker {
        &self.topology
    }

    /// Read access to the pending-receipt table.
    pub fn receipts(&self) -> &ReceiptTable {
        &self.receipts
    }

    /// Currently connected peers, sorted for determinism.
    pub fn neighbors(&self) -> Vec<DeviceId> {
        let mut peers: Vec<DeviceId> = self.connected.iter().copied().collect();
        peers.sort();
        peers
    }

    /// Peers advertising nearby but not yet connected.
    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    // -----------------------------------------------------------------
    // Admission pipeline
    // -----------------------------------------------------------------

    /// Processes one frame delivered by the link from peer `from`.
    ///
    /// Never fails outward: malformed or invalid frames are logged per
    /// policy and dropped, TTL-expired and duplicate frames are dropped
    /// silently.
    pub fn handle_frame(&mut self, bytes: &[u8], from: DeviceId, now: &Timestamp) -> Dispatch {
        let mut dispatch = Dispatch::default();

        let envelope = match codec::decode_frame(bytes) {
            Ok(envelope) => envelope,
            Err(PigeonError::InvalidMessage { reason }) => {
                tracing::warn!(%from, %reason, "dropping message violating invariants");
                return dispatch;
            }
            Err(e) => {
                tracing::debug!(%from, %e, "dropping undecodable frame");
                return dispatch;
            }
        };

        // TTL bound: expected and frequent, dropped without logging.
        if envelope.hop_count >= self.config.max_hops {
            return dispatch;
        }

        // Dedup cut: duplicates are dropped and never re-forwarded, so
        // flooding loops end here.
        match self.log.has_seen(&envelope.id) {
            Ok(false) => {}
            Ok(true) => return dispatch,
            Err(e) => {
                tracing::error!(%e, "dedup lookup failed — dropping frame");
                return dispatch;
            }
        }

        let oversized = bytes.len() > self.config.max_frame_bytes;

        self.dispatch_message(&envelope, now, &mut dispatch);

        if oversized {
            tracing::debug!(
                id = %envelope.id,
                size = bytes.len(),
                "declining to forward oversized envelope"
            );
        } else {
            self.forward(envelope, from, &mut dispatch);
        }

        dispatch
    }

    /// Per-kind handling. Every branch leaves the message id in the
    /// dedup set before [`handle_frame`](Self::handle_frame) decides
    /// the forward.
    fn dispatch_message(&mut self, envelope: &MeshEnvelope, now: &Timestamp, dispatch: &mut Dispatch) {
        match &envelope.payload {
            Payload::Direct(_) => {
                if envelope.target_device_id == Some(self.device_id) {
                    self.admit(envelope, dispatch);
                    let receipt = Payload::DeliveryReceipt(DeliveryReceipt {
                        original_message_id: envelope.id,
                        delivered_at: now.clone(),
                    });
                    self.reply(receipt, Some(envelope.sender_id), now, dispatch);
                } else {
                    // Not ours: relay without storing someone else's
                    // conversation.
                    self.mark_seen(&envelope.id);
                }
            }

            Payload::Ping(ping) => {
                // Transient probe: relayed once, never logged.
                self.mark_seen(&envelope.id);
                let pong = Payload::Pong(PongReply {
                    original_sender_id: ping.original_sender_id.unwrap_or(envelope.sender_id),
                    original_timestamp: ping
                        .original_timestamp
                        .clone()
                        .unwrap_or_else(|| envelope.timestamp.clone()),
                });
                self.reply(pong, None, now, dispatch);
            }

            Payload::Pong(pong) => {
                self.admit(envelope, dispatch);
                self.observe(pong.original_sender_id, envelope.hop_distance(), dispatch);
            }

            Payload::Discovery(request) => {
                self.mark_seen(&envelope.id);
                let reply = Payload::DiscoveryReply(DiscoveryReply {
                    request_id: request.request_id,
                    connected_peers: self.neighbors(),
                });
                self.reply(reply, None, now, dispatch);
            }

            Payload::DiscoveryReply(reply) => {
                self.admit(envelope, dispatch);
                let distance = envelope.hop_distance();
                self.observe(envelope.sender_id, distance, dispatch);
                // The replier's neighbors sit one link beyond it.
                for peer in reply.connected_peers.clone() {
                    self.observe(peer, distance + 1, dispatch);
                }
            }

            Payload::DeliveryReceipt(receipt) => {
                self.admit(envelope, dispatch);
                if self.receipts.resolve(&receipt.original_message_id) {
                    dispatch.events.push(MeshEvent::ReceiptConfirmed {
                        message_id: receipt.original_message_id,
                    });
                }
            }

            Payload::GatewayStatus(status) => {
                // Advertisements recur every 30 s with fresh ids; they
                // feed the gateway table, not the log.
                self.mark_seen(&envelope.id);
                let changed =
                    self.topology
                        .observe_gateway(status, envelope.hop_distance(), now);
                for (device_id, reachable) in changed {
                    dispatch
                        .events
                        .push(MeshEvent::GatewayChanged { device_id, reachable });
                }
            }

            Payload::Sos(_)
            | Payload::Triage(_)
            | Payload::Shelter(_)
            | Payload::MissingPerson(_)
            | Payload::Broadcast(_) => {
                self.admit(envelope, dispatch);
            }
        }
    }

    /// Relay step: append ourselves to the path and queue the frame
    /// for every connected peer except the one it came from.
    fn forward(&self, mut envelope: MeshEnvelope, from: DeviceId, dispatch: &mut Dispatch) {
        envelope.add_hop(self.device_id);
        if envelope.hop_count > self.config.max_hops {
            return;
        }

        match codec::encode_frame(&envelope) {
            Ok(bytes) => dispatch.outbound.push(Outbound {
                envelope,
                bytes,
                except: Some(from),
            }),
            Err(e) => {
                tracing::warn!(%e, "failed to re-encode envelope for forwarding");
            }
        }
    }

    // -----------------------------------------------------------------
    // Origination
    // -----------------------------------------------------------------

    /// Originates a message: fresh id, our identity, path seeded with
    /// us, admitted locally before the send so it appears in our own
    /// log and is eligible for gateway upload.
    ///
    /// # Errors
    ///
    /// - [`PigeonError::InvalidMessage`] if the encoded envelope
    ///   exceeds the frame cap.
    /// - [`PigeonError::CodecError`] if encoding fails.
    pub fn originate(
        &mut self,
        payload: Payload,
        target_device_id: Option<DeviceId>,
        now: &Timestamp,
    ) -> Result<(MessageId, Dispatch)> {
        let kind = payload.kind();
        let mut envelope =
            MeshEnvelope::originate(self.device_id, self.device_name.clone(), payload, target_device_id);
        envelope.timestamp = now.clone();

        let bytes = codec::encode_frame(&envelope)?;
        if bytes.len() > self.config.max_frame_bytes {
            return Err(PigeonError::InvalidMessage {
                reason: format!(
                    "envelope size {} exceeds frame cap {}",
                    bytes.len(),
                    self.config.max_frame_bytes,
                ),
            });
        }

        let mut dispatch = Dispatch::default();
        if kind.is_persistent() {
            self.admit(&envelope, &mut dispatch);
        } else {
            self.mark_seen(&envelope.id);
        }

        if kind == MessageKind::Direct {
            self.receipts.register(envelope.id, now.clone());
        }

        let id = envelope.id;
        dispatch.outbound.push(Outbound {
            envelope,
            bytes,
            except: None,
        });
        Ok((id, dispatch))
    }

    /// Broadcasts a liveness probe.
    pub fn send_ping(&mut self, now: &Timestamp) -> Result<(MessageId, Dispatch)> {
        self.originate(
            Payload::Ping(PingProbe {
                original_sender_id: Some(self.device_id),
                original_timestamp: Some(now.clone()),
            }),
            None,
            now,
        )
    }

    /// Broadcasts a topology discovery request carrying our neighbor
    /// list.
    pub fn discover_network(&mut self, now: &Timestamp) -> Result<(MessageId, Dispatch)> {
        let request = Payload::Discovery(DiscoveryRequest {
            request_id: MessageId::generate(),
            connected_peers: self.neighbors(),
        });
        self.originate(request, None, now)
    }

    /// Origination for router-generated replies (pong, discovery
    /// reply, delivery receipt). Failures only cost us the reply, so
    /// they are logged rather than propagated.
    fn reply(
        &mut self,
        payload: Payload,
        target_device_id: Option<DeviceId>,
        now: &Timestamp,
        dispatch: &mut Dispatch,
    ) {
        match self.originate(payload, target_device_id, now) {
            Ok((_, reply_dispatch)) => dispatch.merge(reply_dispatch),
            Err(e) => tracing::warn!(%e, "failed to originate reply"),
        }
    }

    // -----------------------------------------------------------------
    // Peer lifecycle
    // -----------------------------------------------------------------

    /// Records a discovered peer (not yet connected).
    pub fn peer_discovered(&mut self, info: &PeerInfo) {
        self.discovered.insert(info.device_id);
    }

    /// Removes a peer that stopped advertising.
    pub fn peer_lost(&mut self, device_id: &DeviceId) {
        self.discovered.remove(device_id);
    }

    /// Records an established session. Direct neighbors are one hop
    /// away by definition.
    pub fn peer_connected(&mut self, info: &PeerInfo) -> Dispatch {
        let mut dispatch = Dispatch::default();
        if self.connected.insert(info.device_id) {
            self.observe(info.device_id, 1, &mut dispatch);
            dispatch.events.push(MeshEvent::PeerConnected {
                device_id: info.device_id,
            });
        }
        dispatch
    }

    /// Records a closed session.
    pub fn peer_disconnected(&mut self, device_id: &DeviceId) -> Dispatch {
        let mut dispatch = Dispatch::default();
        if self.connected.remove(device_id) {
            dispatch.events.push(MeshEvent::PeerDisconnected {
                device_id: *device_id,
            });
        }
        dispatch
    }

    /// Discovered-but-unconnected peers to dial this auto-connect
    /// round, respecting the advisory session cap.
    pub fn auto_connect_candidates(&self) -> Vec<DeviceId> {
        if self.connected.len() >= self.config.max_peers {
            return Vec::new();
        }
        let budget = self.config.max_peers - self.connected.len();
        let mut candidates: Vec<DeviceId> = self
            .discovered
            .iter()
            .filter(|id| !self.connected.contains(id))
            .copied()
            .collect();
        candidates.sort();
        candidates.truncate(budget);
        candidates
    }

    /// Runs the gateway staleness sweep.
    pub fn sweep_topology(&mut self, now: &Timestamp) -> Dispatch {
        let mut dispatch = Dispatch::default();
        for device_id in self.topology.sweep(now) {
            dispatch.events.push(MeshEvent::GatewayChanged {
                device_id,
                reachable: false,
            });
        }
        dispatch
    }

    // -----------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------

    fn admit(&mut self, envelope: &MeshEnvelope, dispatch: &mut Dispatch) {
        match self.log.admit(envelope) {
            Ok(true) => dispatch.events.push(MeshEvent::MessageAdmitted {
                message_id: envelope.id,
                kind: envelope.kind(),
                sender_id: envelope.sender_id,
            }),
            Ok(false) => {}
            Err(e) => tracing::error!(%e, "failed to admit message"),
        }
    }

    fn mark_seen(&self, id: &MessageId) {
        if let Err(e) = self.log.mark_seen(id) {
            tracing::error!(%e, "failed to record message id");
        }
    }

    fn observe(&mut self, device_id: DeviceId, hops: u32, dispatch: &mut Dispatch) {
        if self.topology.observe(device_id, hops) {
            if let Some(best) = self.topology.known_devices().get(&device_id) {
                dispatch.events.push(MeshEvent::TopologyUpdated {
                    device_id,
                    hops: *best,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
