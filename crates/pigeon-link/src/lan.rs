//! LAN link: UDP broadcast discovery plus TCP sessions.
//!
//! Two background tasks handle discovery:
//!
//! 1. **Beacon broadcaster** — periodically sends a JSON beacon
//!    (`{deviceId, deviceName, tcpPort}`) as a UDP broadcast so peers
//!    on the same segment can find us.
//! 2. **Beacon listener** — receives beacons from other peers,
//!    maintains the discovered-peer map, and expires peers that stop
//!    re-announcing.
//!
//! Sessions are plain TCP with length-delimited frames; the length
//! prefix is internal to this link, the mesh layer sees whole opaque
//! frames. The dialer sends one hello beacon as its first frame so the
//! acceptor learns who connected; inbound sessions are auto-accepted.
//!
//! All tasks respect a [`CancellationToken`] for clean shutdown.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use pigeon_types::{DeviceId, PigeonError, Result};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::{Link, LinkEvent, PeerInfo};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default UDP port for discovery beacons.
pub const DEFAULT_DISCOVERY_PORT: u16 = 47_100;

/// Seconds between beacon broadcasts.
const BEACON_INTERVAL_SECS: u64 = 5;

/// Seconds without a beacon before a discovered peer is dropped.
const PEER_EXPIRY_SECS: u64 = 15;

/// Hard cap on a single TCP frame. Covers the 32 KiB envelope ceiling
/// with headroom for peers that run a larger cap.
const MAX_TCP_FRAME: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Beacon
// ---------------------------------------------------------------------------

/// Discovery beacon, also used as the session hello.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Beacon {
    device_id: DeviceId,
    device_name: String,
    tcp_port: u16,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// LAN link tunables.
#[derive(Clone, Debug)]
pub struct LanConfig {
    /// UDP port beacons are broadcast on.
    pub discovery_port: u16,
    /// Seconds between beacons.
    pub beacon_secs: u64,
    /// Seconds without a beacon before a peer is considered gone.
    pub peer_expiry_secs: u64,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            beacon_secs: BEACON_INTERVAL_SECS,
            peer_expiry_secs: PEER_EXPIRY_SECS,
            connect_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct DiscoveredPeer {
    info: PeerInfo,
    addr: SocketAddr,
    last_seen: Instant,
}

#[derive(Default)]
struct LanState {
    discovered: HashMap<DeviceId, DiscoveredPeer>,
    /// Outbound frame queue per established session.
    sessions: HashMap<DeviceId, mpsc::UnboundedSender<Vec<u8>>>,
}

type Shared = Arc<Mutex<LanState>>;

fn lock(state: &Shared) -> MutexGuard<'_, LanState> {
    // No panics occur while the lock is held.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// LanLink
// ---------------------------------------------------------------------------

/// LAN implementation of [`Link`].
pub struct LanLink {
    local: PeerInfo,
    config: LanConfig,
    state: Shared,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: Option<CancellationToken>,
    tcp_port: u16,
}

impl LanLink {
    /// Creates the link; sockets are bound by [`Link::start`].
    pub fn new(local: PeerInfo, config: LanConfig) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                config,
                state: Arc::default(),
                events: tx,
                cancel: None,
                tcp_port: 0,
            },
            rx,
        )
    }

    /// The TCP port sessions are accepted on; 0 before `start`.
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Binds the beacon receive socket with address reuse, so several
    /// nodes on one host can share the discovery port.
    fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            PigeonError::LinkError {
                reason: format!("failed to create discovery socket: {e}"),
            }
        })?;
        socket
            .set_reuse_address(true)
            .and_then(|_| socket.set_nonblocking(true))
            .and_then(|_| {
                socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            })
            .map_err(|e| PigeonError::LinkError {
                reason: format!("failed to bind discovery socket: {e}"),
            })?;

        UdpSocket::from_std(socket.into()).map_err(|e| PigeonError::LinkError {
            reason: format!("failed to register discovery socket: {e}"),
        })
    }

    #[cfg(test)]
    fn inject_discovered(&self, info: PeerInfo, addr: SocketAddr) {
        lock(&self.state).discovered.insert(
            info.device_id,
            DiscoveredPeer {
                info,
                addr,
                last_seen: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl Link for LanLink {
    fn local_device_id(&self) -> DeviceId {
        self.local.device_id
    }

    async fn start(&mut self) -> Result<()> {
        if self.cancel.is_some() {
            return Ok(());
        }

        // Accept socket on an ephemeral port; the beacon advertises it.
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| PigeonError::LinkError {
                reason: format!("failed to bind session listener: {e}"),
            })?;
        self.tcp_port = listener
            .local_addr()
            .map_err(|e| PigeonError::LinkError {
                reason: format!("failed to read listener address: {e}"),
            })?
            .port();

        let recv_socket = Self::bind_discovery_socket(self.config.discovery_port)?;

        // Separate ephemeral socket for sending, so we never contend
        // with the listener bound to the discovery port.
        let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| PigeonError::LinkError {
                reason: format!("failed to bind beacon socket: {e}"),
            })?;
        send_socket
            .set_broadcast(true)
            .map_err(|e| PigeonError::LinkError {
                reason: format!("failed to enable broadcast: {e}"),
            })?;

        let beacon = Beacon {
            device_id: self.local.device_id,
            device_name: self.local.device_name.clone(),
            tcp_port: self.tcp_port,
        };

        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tokio::spawn(run_beacon_broadcaster(
            send_socket,
            beacon.clone(),
            self.config.discovery_port,
            self.config.beacon_secs,
            cancel.clone(),
        ));
        tokio::spawn(run_beacon_listener(
            recv_socket,
            self.local.device_id,
            self.config.peer_expiry_secs,
            self.state.clone(),
            self.events.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_accept_loop(
            listener,
            self.state.clone(),
            self.events.clone(),
            cancel,
        ));

        tracing::info!(tcp_port = self.tcp_port, "LAN link started");
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        let mut state = lock(&self.state);
        // Dropping the queues ends the session tasks; each one emits
        // its own Disconnected on the way out.
        state.sessions.clear();
        state.discovered.clear();
    }

    async fn connect(&mut self, peer: &DeviceId) -> Result<()> {
        let (info, addr) = {
            let state = lock(&self.state);
            if state.sessions.contains_key(peer) {
                return Ok(());
            }
            let discovered = state.discovered.get(peer).ok_or_else(|| {
                PigeonError::LinkError {
                    reason: format!("peer {peer} is not discovered"),
                }
            })?;
            (discovered.info.clone(), discovered.addr)
        };

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PigeonError::LinkError {
                reason: format!("connect to {peer} timed out"),
            })?
            .map_err(|e| PigeonError::LinkError {
                reason: format!("connect to {peer} failed: {e}"),
            })?;

        let mut framed = Framed::new(stream, frame_codec());

        // Hello: identify ourselves so the acceptor can register us.
        let hello = Beacon {
            device_id: self.local.device_id,
            device_name: self.local.device_name.clone(),
            tcp_port: self.tcp_port,
        };
        let hello_bytes = serde_json::to_vec(&hello).map_err(|e| PigeonError::LinkError {
            reason: format!("failed to encode hello: {e}"),
        })?;
        framed
            .send(Bytes::from(hello_bytes))
            .await
            .map_err(|e| PigeonError::LinkError {
                reason: format!("failed to send hello to {peer}: {e}"),
            })?;

        spawn_session(framed, info, self.state.clone(), self.events.clone());
        Ok(())
    }

    async fn send(&mut self, frame: &[u8], to: &[DeviceId]) -> Result<()> {
        let mut missing = Vec::new();
        {
            let state = lock(&self.state);
            for peer in to {
                match state.sessions.get(peer) {
                    Some(queue) => {
                        // A closed queue means the session is tearing
                        // down; treat it like a missing session.
                        if queue.send(frame.to_vec()).is_err() {
                            missing.push(*peer);
                        }
                    }
                    None => missing.push(*peer),
                }
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

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_TCP_FRAME)
        .new_codec()
}

// ---------------------------------------------------------------------------
// Discovery tasks
// ---------------------------------------------------------------------------

/// Periodically broadcasts our beacon on the LAN.
async fn run_beacon_broadcaster(
    socket: UdpSocket,
    beacon: Beacon,
    discovery_port: u16,
    beacon_secs: u64,
    cancel: CancellationToken,
) {
    let payload = match serde_json::to_vec(&beacon) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(%e, "failed to encode beacon — discovery disabled");
            return;
        }
    };
    let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, discovery_port);
    let mut tick = tokio::time::interval(Duration::from_secs(beacon_secs));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = socket.send_to(&payload, target).await {
                    tracing::debug!(%e, "beacon broadcast failed");
                }
            }
        }
    }
}

/// Receives beacons, maintains the discovered-peer map, and expires
/// peers that stop announcing.
async fn run_beacon_listener(
    socket: UdpSocket,
    local_id: DeviceId,
    peer_expiry_secs: u64,
    state: Shared,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 2048];
    let expiry = Duration::from_secs(peer_expiry_secs);
    let mut sweep = tokio::time::interval(Duration::from_secs(peer_expiry_secs.max(1)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!(%e, "beacon receive failed");
                        continue;
                    }
                };
                let beacon: Beacon = match serde_json::from_slice(&buf[..len]) {
                    Ok(beacon) => beacon,
                    Err(e) => {
                        tracing::debug!(%e, "ignoring malformed beacon");
                        continue;
                    }
                };
                if beacon.device_id == local_id {
                    continue; // our own broadcast
                }

                let addr = SocketAddr::new(src.ip(), beacon.tcp_port);
                let info = PeerInfo {
                    device_id: beacon.device_id,
                    device_name: beacon.device_name,
                };

                let newly_discovered = {
                    let mut state = lock(&state);
                    state
                        .discovered
                        .insert(
                            beacon.device_id,
                            DiscoveredPeer {
                                info: info.clone(),
                                addr,
                                last_seen: Instant::now(),
                            },
                        )
                        .is_none()
                };
                if newly_discovered {
                    tracing::debug!(peer = %info.device_id, %addr, "peer discovered");
                    let _ = events.send(LinkEvent::PeerDiscovered(info));
                }
            }

            _ = sweep.tick() => {
                let expired: Vec<DeviceId> = {
                    let mut state = lock(&state);
                    let gone: Vec<DeviceId> = state
                        .discovered
                        .iter()
                        .filter(|(_, peer)| peer.last_seen.elapsed() > expiry)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in &gone {
                        state.discovered.remove(id);
                    }
                    gone
                };
                for id in expired {
                    tracing::debug!(peer = %id, "peer expired");
                    let _ = events.send(LinkEvent::PeerLost(id));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session handling
// ---------------------------------------------------------------------------

/// Accepts inbound sessions; every invitation is accepted (open mesh).
async fn run_accept_loop(
    listener: TcpListener,
    state: Shared,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => {
                let (stream, src) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!(%e, "accept failed");
                        continue;
                    }
                };
                let state = state.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, frame_codec());

                    // First frame must be the dialer's hello.
                    let hello = match framed.next().await {
                        Some(Ok(bytes)) => bytes,
                        _ => {
                            tracing::debug!(%src, "session closed before hello");
                            return;
                        }
                    };
                    let beacon: Beacon = match serde_json::from_slice(&hello) {
                        Ok(beacon) => beacon,
                        Err(e) => {
                            tracing::debug!(%src, %e, "malformed hello — dropping session");
                            return;
                        }
                    };

                    let info = PeerInfo {
                        device_id: beacon.device_id,
                        device_name: beacon.device_name,
                    };
                    spawn_session(framed, info, state, events);
                });
            }
        }
    }
}

/// Registers a session and spawns its drive task.
///
/// If a session to the peer already exists (simultaneous dial from
/// both sides), the new stream is dropped and the existing session
/// wins.
fn spawn_session(
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer: PeerInfo,
    state: Shared,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let peer_id = peer.device_id;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    {
        let mut guard = lock(&state);
        if guard.sessions.contains_key(&peer_id) {
            tracing::debug!(peer = %peer_id, "duplicate session dropped");
            return;
        }
        guard.sessions.insert(peer_id, out_tx);
    }

    let _ = events.send(LinkEvent::Connected(peer));

    tokio::spawn(async move {
        let (mut sink, mut source) = framed.split();

        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Err(e) = sink.send(Bytes::from(frame)).await {
                                tracing::info!(peer = %peer_id, %e, "session send failed");
                                break;
                            }
                        }
                        // Queue dropped: the link was stopped.
                        None => break,
                    }
                }

                inbound = source.next() => {
                    match inbound {
                        Some(Ok(bytes)) => {
                            let _ = events.send(LinkEvent::Frame {
                                from: peer_id,
                                bytes: bytes.to_vec(),
                            });
                        }
                        Some(Err(e)) => {
                            tracing::info!(peer = %peer_id, %e, "session receive failed");
                            break;
                        }
                        None => break, // peer closed
                    }
                }
            }
        }

        // Only announce the disconnect if we were still registered;
        // stop() clears the map wholesale and drops the event receiver.
        let was_registered = lock(&state).sessions.remove(&peer_id).is_some();
        if was_registered {
            let _ = events.send(LinkEvent::Disconnected(peer_id));
        }
    });
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

    fn peer(b: u8, name: &str) -> PeerInfo {
        PeerInfo {
            device_id: device(b),
            device_name: name.into(),
        }
    }

    #[test]
    fn beacon_roundtrip() {
        let beacon = Beacon {
            device_id: device(1),
            device_name: "Pigeon-0101".into(),
            tcp_port: 4567,
        };
        let bytes = serde_json::to_vec(&beacon).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        // The discovery info key the mesh layer depends on.
        assert!(value.get("deviceId").is_some());

        let parsed: Beacon = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.device_id, device(1));
        assert_eq!(parsed.tcp_port, 4567);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dial_hello_and_frame_exchange() -> Result<()> {
        // Two links on loopback; discovery is injected so the test does
        // not depend on UDP broadcast reaching the sandbox.
        let (mut a, mut rx_a) = LanLink::new(peer(1, "a"), LanConfig::default());
        let (mut b, mut rx_b) = LanLink::new(peer(2, "b"), LanConfig::default());
        a.start().await?;
        b.start().await?;

        b_addr_into(&a, &b);
        a.connect(&device(2)).await?;

        // Both sides report the session. Discovery events may arrive
        // first if beacons reach the loopback, so filter for Connected.
        match wait_for(&mut rx_a, |e| matches!(e, LinkEvent::Connected(_))).await {
            LinkEvent::Connected(info) => assert_eq!(info.device_id, device(2)),
            other => panic!("unexpected event: {other:?}"),
        }
        match wait_for(&mut rx_b, |e| matches!(e, LinkEvent::Connected(_))).await {
            LinkEvent::Connected(info) => assert_eq!(info.device_id, device(1)),
            other => panic!("unexpected event: {other:?}"),
        }

        a.send(b"hello mesh", &[device(2)]).await?;
        match wait_for(&mut rx_b, |e| matches!(e, LinkEvent::Frame { .. })).await {
            LinkEvent::Frame { from, bytes } => {
                assert_eq!(from, device(1));
                assert_eq!(bytes, b"hello mesh");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // And in the other direction over the same session.
        b.send(b"ack", &[device(1)]).await?;
        match wait_for(&mut rx_a, |e| matches!(e, LinkEvent::Frame { .. })).await {
            LinkEvent::Frame { from, bytes } => {
                assert_eq!(from, device(2));
                assert_eq!(bytes, b"ack");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        a.stop().await;
        b.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_to_unknown_peer_fails() -> Result<()> {
        let (mut a, _rx_a) = LanLink::new(peer(1, "a"), LanConfig::default());
        a.start().await?;
        assert!(a.connect(&device(9)).await.is_err());
        a.stop().await;
        Ok(())
    }

    fn b_addr_into(a: &LanLink, b: &LanLink) {
        a.inject_discovered(
            peer(2, "b"),
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), b.tcp_port()),
        );
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<LinkEvent>,
        matches: impl Fn(&LinkEvent) -> bool,
    ) -> LinkEvent {
        let deadline = Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout(deadline, rx.recv())
                .await
                .expect("timed out waiting for link event")
                .expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    }
}
