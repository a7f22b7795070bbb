//! Pigeon mesh node: router, topology tracking, gateway uploader, and
//! the runtime that ties them together.
//!
//! # Architecture
//!
//! - [`router::MeshRouter`] — the admission pipeline: dedup, TTL,
//!   per-kind dispatch, forwarding. Synchronous; returns
//!   [`router::Dispatch`] actions instead of doing I/O.
//! - [`topology::TopologyTracker`] — hop-distance and gateway tables.
//! - [`gateway::GatewayUploader`] — opportunistic collector sync,
//!   driven by reachability edges.
//! - [`node::Node`] + the event loop — one tokio task owning all
//!   mutable state, fed by link events, commands, and timers.
//!
//! The hosting application constructs a [`node::Node`] over a storage
//! engine and a link, starts it, and talks to it through
//! [`command::NodeCommand`]s and [`pigeon_types::MeshEvent`]s.

pub mod command;
mod event_loop;
pub mod gateway;
pub mod node;
pub mod receipts;
pub mod router;
pub mod topology;

pub use command::{GatewaySummary, NodeCommand, NodeStatus};
pub use gateway::{GatewayUploader, ReachabilityEdge};
pub use node::{Node, NodeState};
pub use router::{Dispatch, MeshRouter, Outbound};
pub use topology::{GatewayEntry, TopologyTracker};
