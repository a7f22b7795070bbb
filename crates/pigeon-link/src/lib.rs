//! Proximity link abstraction for the Pigeon mesh.
//!
//! The mesh core treats the transport as a black box behind the
//! [`Link`] trait: advertise and browse, connect to discovered peers,
//! send opaque frames, and surface [`LinkEvent`]s over a channel. Two
//! implementations ship here:
//!
//! - [`memory::MemoryLink`] — an in-process hub for deterministic
//!   multi-node tests.
//! - [`lan::LanLink`] — UDP broadcast beacons for discovery plus
//!   length-framed TCP sessions, for running real nodes on one network
//!   segment.
//!
//! Contract, regardless of implementation:
//!
//! - Discovery info carries the peer's device id.
//! - Inbound sessions are auto-accepted (open mesh).
//! - Frames are opaque byte sequences, delivered whole and in order
//!   per peer. Any framing (e.g. length prefixes on TCP) is internal
//!   to the link; the mesh layer never sees it.

pub mod lan;
pub mod memory;

use async_trait::async_trait;
use pigeon_types::{DeviceId, Result};

// ---------------------------------------------------------------------------
// PeerInfo / LinkEvent
// ---------------------------------------------------------------------------

/// Identity of a peer as carried in link discovery info.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerInfo {
    /// The peer's stable device id.
    pub device_id: DeviceId,
    /// The peer's display name at advertisement time.
    pub device_name: String,
}

/// Events surfaced by a link to the mesh core.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// A nearby peer is advertising and can be connected to.
    PeerDiscovered(PeerInfo),
    /// A previously discovered peer stopped advertising.
    PeerLost(DeviceId),
    /// A session to a peer was established (dialed or accepted).
    Connected(PeerInfo),
    /// A session to a peer ended.
    Disconnected(DeviceId),
    /// A whole frame arrived from a connected peer.
    Frame {
        /// The session peer that delivered the frame (not necessarily
        /// the message originator).
        from: DeviceId,
        /// Opaque frame bytes.
        bytes: Vec<u8>,
    },
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// The proximity transport as seen by the mesh core.
///
/// Constructors are implementation-specific and return the link
/// together with its event receiver.
#[async_trait]
pub trait Link: Send {
    /// The local device id this link advertises.
    fn local_device_id(&self) -> DeviceId;

    /// Begins advertising presence and browsing for peers.
    async fn start(&mut self) -> Result<()>;

    /// Releases link resources and closes all sessions.
    async fn stop(&mut self);

    /// Attempts a session with a discovered peer. Failures are
    /// non-fatal; the auto-connect loop retries.
    async fn connect(&mut self, peer: &DeviceId) -> Result<()>;

    /// Sends one frame to each listed peer. Delivery is reliable and
    /// ordered within a session; a peer without a session is an error
    /// (the frame still goes to the others).
    async fn send(&mut self, frame: &[u8], to: &[DeviceId]) -> Result<()>;
}
