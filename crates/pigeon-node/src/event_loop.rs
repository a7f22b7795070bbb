//! Main event loop driving all node subsystems.
//!
//! [`run_event_loop`] is spawned as a tokio task by [`Node::start`].
//! It multiplexes with `tokio::select!`:
//!
//! 1. **Link events** — discovery, sessions, inbound frames.
//! 2. **Commands** — originations, queries, shutdown from the host.
//! 3. **AutoConnect tick** (10 s) — dial discovered peers.
//! 4. **GatewaySync tick** (30 s) — upload to the collector while
//!    online.
//! 5. **GatewayBroadcast tick** (30 s) — advertise gateway state
//!    while online.
//! 6. **StalenessSweep tick** (30 s) — expire stale gateway entries.
//! 7. **Shutdown signal** — graceful exit via the watch channel.
//!
//! All mutable state lives on this one task. The router decides,
//! synchronously, what to send and what to surface; this loop does the
//! awaiting. A message is therefore in the dedup set before any send
//! for it is attempted, and no lock is held across a suspension point.
//!
//! [`Node::start`]: crate::node::Node::start

use std::time::Duration;

use pigeon_link::{Link, LinkEvent};
use pigeon_types::{DeviceId, Timestamp};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::command::{GatewaySummary, NodeCommand, NodeStatus};
use crate::gateway::ReachabilityEdge;
use crate::node::NodeRuntime;
use crate::router::Dispatch;

/// Cadence of the periodic gateway staleness sweep.
const STALENESS_SWEEP_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Event loop entry point
// ---------------------------------------------------------------------------

/// Runs the node event loop until shutdown is signalled.
pub(crate) async fn run_event_loop<L: Link>(mut rt: NodeRuntime<L>) {
    tracing::info!(device = %rt.router.device_id(), "mesh event loop starting");

    if let Err(e) = rt.link.start().await {
        tracing::error!(%e, "failed to start link — continuing without transport");
    }

    let mut auto_connect = timer(rt.config.auto_connect_secs);
    let mut gateway_sync = timer(rt.config.gateway_sync_secs);
    let mut gateway_broadcast = timer(rt.config.gateway_broadcast_secs);
    let mut staleness_sweep = timer(STALENESS_SWEEP_SECS);

    loop {
        tokio::select! {
            Some(event) = rt.link_rx.recv() => {
                handle_link_event(&mut rt, event).await;
            }

            Some(command) = rt.command_rx.recv() => {
                let shutdown = handle_command(&mut rt, command, &mut gateway_sync).await;
                if shutdown {
                    tracing::info!("shutdown command received — exiting event loop");
                    break;
                }
            }

            _ = auto_connect.tick() => {
                handle_auto_connect(&mut rt).await;
            }

            _ = gateway_sync.tick() => {
                if rt.uploader.is_active() {
                    run_sync(&mut rt).await;
                }
            }

            _ = gateway_broadcast.tick() => {
                if rt.uploader.is_active() {
                    broadcast_gateway_status(&mut rt).await;
                }
            }

            _ = staleness_sweep.tick() => {
                let dispatch = rt.router.sweep_topology(&Timestamp::now());
                execute(&mut rt, dispatch).await;
            }

            _ = rt.shutdown_rx.changed() => {
                if *rt.shutdown_rx.borrow() {
                    tracing::info!("shutdown signal received — exiting event loop");
                    break;
                }
            }
        }
    }

    rt.link.stop().await;
    tracing::info!("mesh event loop exited");
}

fn timer(secs: u64) -> Interval {
    let mut timer = interval(Duration::from_secs(secs));
    // A delayed loop should not fire a burst of catch-up ticks.
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

// ---------------------------------------------------------------------------
// Dispatch execution
// ---------------------------------------------------------------------------

/// Puts a router dispatch on the wire and surfaces its events.
async fn execute<L: Link>(rt: &mut NodeRuntime<L>, dispatch: Dispatch) {
    for outbound in dispatch.outbound {
        let targets: Vec<DeviceId> = rt
            .router
            .neighbors()
            .into_iter()
            .filter(|peer| outbound.except != Some(*peer))
            .collect();
        if targets.is_empty() {
            continue;
        }
        if let Err(e) = rt.link.send(&outbound.bytes, &targets).await {
            // The link already retried within the session; another
            // neighbor's copy will cover the gap.
            tracing::info!(%e, "link send failed");
        }
    }

    for event in dispatch.events {
        if rt.event_tx.send(event).await.is_err() {
            tracing::warn!("mesh event channel closed — consumer dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Link events
// ---------------------------------------------------------------------------

async fn handle_link_event<L: Link>(rt: &mut NodeRuntime<L>, event: LinkEvent) {
    match event {
        LinkEvent::PeerDiscovered(info) => {
            rt.router.peer_discovered(&info);
        }
        LinkEvent::PeerLost(device_id) => {
            rt.router.peer_lost(&device_id);
        }
        LinkEvent::Connected(info) => {
            tracing::info!(peer = %info.device_id, "peer connected");
            let dispatch = rt.router.peer_connected(&info);
            execute(rt, dispatch).await;
        }
        LinkEvent::Disconnected(device_id) => {
            tracing::info!(peer = %device_id, "peer disconnected");
            let dispatch = rt.router.peer_disconnected(&device_id);
            execute(rt, dispatch).await;
        }
        LinkEvent::Frame { from, bytes } => {
            let dispatch = rt.router.handle_frame(&bytes, from, &Timestamp::now());
            execute(rt, dispatch).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Dials every discovered-but-unconnected peer, up to the session cap.
async fn handle_auto_connect<L: Link>(rt: &mut NodeRuntime<L>) {
    for peer in rt.router.auto_connect_candidates() {
        if let Err(e) = rt.link.connect(&peer).await {
            tracing::debug!(%peer, %e, "connect attempt failed — will retry");
        }
    }
}

/// Runs one uploader sync and surfaces its status transitions.
async fn run_sync<L: Link>(rt: &mut NodeRuntime<L>) {
    let events = rt.uploader.sync(&Timestamp::now()).await;
    for event in events {
        if rt.event_tx.send(event).await.is_err() {
            tracing::warn!("mesh event channel closed — consumer dropped");
        }
    }
}

/// Originates a `gatewayStatus` advertisement into the mesh.
async fn broadcast_gateway_status<L: Link>(rt: &mut NodeRuntime<L>) {
    let payload = rt.uploader.advertisement();
    match rt.router.originate(payload, None, &Timestamp::now()) {
        Ok((_, dispatch)) => execute(rt, dispatch).await,
        Err(e) => tracing::warn!(%e, "failed to originate gateway status"),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Processes one command. Returns `true` when the loop should exit.
async fn handle_command<L: Link>(
    rt: &mut NodeRuntime<L>,
    command: NodeCommand,
    gateway_sync: &mut Interval,
) -> bool {
    match command {
        NodeCommand::SendMessage {
            payload,
            target_device_id,
            reply,
        } => {
            match rt.router.originate(payload, target_device_id, &Timestamp::now()) {
                Ok((message_id, dispatch)) => {
                    execute(rt, dispatch).await;
                    let _ = reply.send(Ok(message_id));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            false
        }

        NodeCommand::SendPing { reply } => {
            match rt.router.send_ping(&Timestamp::now()) {
                Ok((message_id, dispatch)) => {
                    execute(rt, dispatch).await;
                    let _ = reply.send(Ok(message_id));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            false
        }

        NodeCommand::DiscoverNetwork { reply } => {
            match rt.router.discover_network(&Timestamp::now()) {
                Ok((message_id, dispatch)) => {
                    execute(rt, dispatch).await;
                    let _ = reply.send(Ok(message_id));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            false
        }

        NodeCommand::GetStatus { reply } => {
            let _ = reply.send(build_status(rt));
            false
        }

        NodeCommand::GetMessages { kind, reply } => {
            let messages = match kind {
                Some(kind) => rt.log.by_kind(kind),
                None => rt.log.all(),
            };
            let _ = reply.send(messages.unwrap_or_default());
            false
        }

        NodeCommand::SetDeviceName { name, reply } => {
            let result = rt.identity.set_device_name(&name);
            if result.is_ok() {
                rt.router.set_device_name(name.clone());
                rt.uploader.set_device_name(name);
            }
            let _ = reply.send(result);
            false
        }

        NodeCommand::SetReachable { online } => {
            if let Some(edge) = rt.uploader.set_online(online) {
                // Every transition is advertised into the mesh.
                broadcast_gateway_status(rt).await;
                if edge == ReachabilityEdge::Rising {
                    gateway_sync.reset();
                    run_sync(rt).await;
                }
            }
            false
        }

        NodeCommand::ForceSyncAll { reply } => {
            let result = rt.uploader.force_sync_all();
            let ok = result.is_ok();
            let _ = reply.send(result);
            if ok {
                run_sync(rt).await;
            }
            false
        }

        NodeCommand::Shutdown => true,
    }
}

/// Builds a status snapshot of the node.
fn build_status<L: Link>(rt: &NodeRuntime<L>) -> NodeStatus {
    let now = Timestamp::now();
    let topology = rt.router.topology();

    let mut known_gateways: Vec<GatewaySummary> = topology
        .known_gateways()
        .iter()
        .map(|(device_id, entry)| GatewaySummary {
            device_id: *device_id,
            device_name: entry.device_name.clone(),
            hops: entry.hops,
            synced_count: entry.synced_count,
        })
        .collect();
    known_gateways.sort_by_key(|g| g.hops);

    NodeStatus {
        device_id: rt.router.device_id(),
        device_name: rt.router.device_name().to_string(),
        connected_peers: rt.router.neighbors(),
        discovered_peers: rt.router.discovered_count(),
        stored_messages: rt.log.len().unwrap_or(0),
        known_devices: topology.known_devices().clone(),
        known_gateways,
        has_reachable_gateway: topology.has_reachable_gateway(&now),
        is_gateway: rt.uploader.is_active(),
        upload_status: rt.uploader.status().clone(),
        synced_count: rt.uploader.synced_count(),
        last_sync: rt.uploader.last_sync().cloned(),
    }
}
