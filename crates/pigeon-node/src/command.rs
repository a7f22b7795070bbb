//! Commands accepted by the node event loop, and the status snapshot.
//!
//! The hosting application talks to a running node exclusively through
//! [`NodeCommand`]s; commands that produce a value carry a oneshot
//! reply sender.

use std::collections::HashMap;

use pigeon_protocol::{MeshEnvelope, Payload};
use pigeon_types::{
    DeviceId, MessageId, MessageKind, Result, Timestamp, UploadStatus,
};
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// NodeCommand
// ---------------------------------------------------------------------------

/// Commands from the hosting application (UI, CLI, tests).
#[derive(Debug)]
pub enum NodeCommand {
    /// Originates a message into the mesh. `target_device_id` is
    /// required for direct messages and ignored otherwise.
    SendMessage {
        payload: Payload,
        target_device_id: Option<DeviceId>,
        reply: oneshot::Sender<Result<MessageId>>,
    },

    /// Broadcasts a liveness probe.
    SendPing {
        reply: oneshot::Sender<Result<MessageId>>,
    },

    /// Broadcasts a topology discovery request.
    DiscoverNetwork {
        reply: oneshot::Sender<Result<MessageId>>,
    },

    /// Returns a status snapshot.
    GetStatus {
        reply: oneshot::Sender<NodeStatus>,
    },

    /// Returns stored messages, optionally filtered by kind,
    /// newest first.
    GetMessages {
        kind: Option<MessageKind>,
        reply: oneshot::Sender<Vec<MeshEnvelope>>,
    },

    /// Changes the persisted display name used on future messages.
    SetDeviceName {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },

    /// Injects a reachability reading (the OS monitor or the daemon's
    /// probe feeds this).
    SetReachable { online: bool },

    /// Clears the synced-id set and uploads everything again.
    ForceSyncAll {
        reply: oneshot::Sender<Result<()>>,
    },

    /// Stops the event loop gracefully.
    Shutdown,
}

// ---------------------------------------------------------------------------
// NodeStatus
// ---------------------------------------------------------------------------

/// One advertised gateway, as seen from this node.
#[derive(Clone, Debug)]
pub struct GatewaySummary {
    pub device_id: DeviceId,
    pub device_name: String,
    pub hops: u32,
    pub synced_count: u64,
}

/// Snapshot of a running node.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    /// Local device id.
    pub device_id: DeviceId,
    /// Local display name.
    pub device_name: String,
    /// Currently connected peers.
    pub connected_peers: Vec<DeviceId>,
    /// Peers advertising nearby (connected or not).
    pub discovered_peers: usize,
    /// Messages currently retained in the log.
    pub stored_messages: usize,
    /// Best-known hop distance per remote device.
    pub known_devices: HashMap<DeviceId, u32>,
    /// Advertised gateways, nearest first.
    pub known_gateways: Vec<GatewaySummary>,
    /// Whether a non-stale gateway is reachable through the mesh.
    pub has_reachable_gateway: bool,
    /// Whether this node is itself acting as a gateway.
    pub is_gateway: bool,
    /// Gateway uploader status.
    pub upload_status: UploadStatus,
    /// Ids acknowledged by the collector.
    pub synced_count: u64,
    /// When the last successful upload completed.
    pub last_sync: Option<Timestamp>,
}
