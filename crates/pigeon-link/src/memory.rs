//! In-process link for deterministic multi-node tests.
//!
//! A [`MemoryMesh`] hub owns the topology: which nodes can discover
//! each other and which sessions exist. Tests register nodes, shape
//! the graph with [`MemoryMesh::join`]/[`MemoryMesh::part`], and run
//! real nodes over the resulting links. Event delivery is an unbounded
//! channel per node, so per-peer frame order matches send order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use pigeon_types::{DeviceId, PigeonError, Result};
use tokio::sync::mpsc;

use crate::{Link, LinkEvent, PeerInfo};

// ---------------------------------------------------------------------------
// Hub state
// ---------------------------------------------------------------------------

struct NodeSlot {
    info: PeerInfo,
    events: mpsc::UnboundedSender<LinkEvent>,
    started: bool,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<DeviceId, NodeSlot>,
    /// Directed visibility edges; `join` inserts both directions.
    visible: HashSet<(DeviceId, DeviceId)>,
    /// Established sessions, stored with both orderings.
    sessions: HashSet<(DeviceId, DeviceId)>,
}

impl HubState {
    fn emit(&self, to: &DeviceId, event: LinkEvent) {
        if let Some(slot) = self.nodes.get(to) {
            // Receiver dropped means the node is gone; nothing to do.
            let _ = slot.events.send(event);
        }
    }

    fn open_session(&mut self, a: DeviceId, b: DeviceId) {
        if self.sessions.contains(&(a, b)) {
            return;
        }
        self.sessions.insert((a, b));
        self.sessions.insert((b, a));

        let info_a = self.nodes.get(&a).map(|s| s.info.clone());
        let info_b = self.nodes.get(&b).map(|s| s.info.clone());
        if let Some(info) = info_b {
            self.emit(&a, LinkEvent::Connected(info));
        }
        if let Some(info) = info_a {
            self.emit(&b, LinkEvent::Connected(info));
        }
    }

    fn close_session(&mut self, a: DeviceId, b: DeviceId) {
        if !self.sessions.remove(&(a, b)) {
            return;
        }
        self.sessions.remove(&(b, a));
        self.emit(&a, LinkEvent::Disconnected(b));
        self.emit(&b, LinkEvent::Disconnected(a));
    }
}

// ---------------------------------------------------------------------------
// MemoryMesh
// ---------------------------------------------------------------------------

/// Shared hub connecting [`MemoryLink`]s in one process.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryMesh {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and returns its link plus the event receiver.
    pub fn register(
        &self,
        device_id: DeviceId,
        device_name: impl Into<String>,
    ) -> (MemoryLink, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = PeerInfo {
            device_id,
            device_name: device_name.into(),
        };

        self.lock().nodes.insert(
            device_id,
            NodeSlot {
                info,
                events: tx,
                started: false,
            },
        );

        (
            MemoryLink {
                device_id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Makes two nodes mutually discoverable. If both are already
    /// advertising, each sees the other immediately.
    pub fn join(&self, a: DeviceId, b: DeviceId) {
        let mut state = self.lock();
        state.visible.insert((a, b));
        state.visible.insert((b, a));

        let a_started = state.nodes.get(&a).is_some_and(|s| s.started);
        let b_started = state.nodes.get(&b).is_some_and(|s| s.started);
        if a_started && b_started {
            let info_a = state.nodes[&a].info.clone();
            let info_b = state.nodes[&b].info.clone();
            state.emit(&a, LinkEvent::PeerDiscovered(info_b));
            state.emit(&b, LinkEvent::PeerDiscovered(info_a));
        }
    }

    /// Removes discoverability between two nodes and tears down any
    /// session between them.
    pub fn part(&self, a: DeviceId, b: DeviceId) {
        let mut state = self.lock();
        state.visible.remove(&(a, b));
        state.visible.remove(&(b, a));
        state.close_session(a, b);
        state.emit(&a, LinkEvent::PeerLost(b));
        state.emit(&b, LinkEvent::PeerLost(a));
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // The hub lock cannot poison: no panics occur while held.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// MemoryLink
// ---------------------------------------------------------------------------

/// One node's handle onto a [`MemoryMesh`].
pub struct MemoryLink {
    device_id: DeviceId,
    hub: MemoryMesh,
}

#[async_trait]
impl Link for MemoryLink {
    fn local_device_id(&self) -> DeviceId {
        self.device_id
    }

    async fn start(&mut self) -> Result<()> {
        let mut state = self.hub.lock();
        if let Some(slot) = state.nodes.get_mut(&self.device_id) {
            slot.started = true;
        }

        // Surface every already-advertising visible peer, both ways.
        let me = self.device_id;
        let my_info = state.nodes[&me].info.clone();
        let peers: Vec<PeerInfo> = state
            .nodes
            .values()
            .filter(|slot| {
                slot.started
                    && slot.info.device_id != me
                    && state.visible.contains(&(me, slot.info.device_id))
            })
            .map(|slot| slot.info.clone())
            .collect();

        for peer in peers {
            state.emit(&peer.device_id, LinkEvent::PeerDiscovered(my_info.clone()));
            state.emit(&me, LinkEvent::PeerDiscovered(peer));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        let mut state = self.hub.lock();
        let me = self.device_id;
        if let Some(slot) = state.nodes.get_mut(&me) {
            slot.started = false;
        }

        let peers: Vec<DeviceId> = state
            .sessions
            .iter()
            .filter(|(a, _)| *a == me)
            .map(|(_, b)| *b)
            .collect();
        for peer in peers {
            state.close_session(me, peer);
        }
    }

    async fn connect(&mut self, peer: &DeviceId) -> Result<()> {
        let mut state = self.hub.lock();
        let me = self.device_id;

        if !state.visible.contains(&(me, *peer)) {
            return Err(PigeonError::LinkError {
                reason: format!("peer {peer} is not discoverable"),
            });
        }
        let peer_started = state.nodes.get(peer).is_some_and(|s| s.started);
        if !peer_started {
            return Err(PigeonError::LinkError {
                reason: format!("peer {peer} is not advertising"),
            });
        }

        // Invitations are auto-accepted: connecting opens both sides.
        state.open_session(me, *peer);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8], to: &[DeviceId]) -> Result<()> {
        let state = self.hub.lock();
        let me = self.device_id;
        let mut missing = Vec::new();

        for peer in to {
            if state.sessions.contains(&(me, *peer)) {
                state.emit(
                    peer,
                    LinkEvent::Frame {
                        from: me,
                        bytes: frame.to_vec(),
                    },
                );
            } else {
                missing.push(*peer);
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PigeonError::LinkError {
                reason: format!("no session to {} peer(s)", missing.len()),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
