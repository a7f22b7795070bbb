//! Node lifecycle and wiring.
//!
//! The [`Node`] is the public entry point for the Pigeon runtime. It
//! owns all subsystems and exposes a channel-based API for external
//! consumers (daemon, UI bridge, tests).
//!
//! # State machine
//!
//! ```text
//! Initializing ──start()──▶ Running ──shutdown()──▶ ShuttingDown ──▶ (dropped)
//! ```
//!
//! Double-start and shutdown-from-initializing are rejected with
//! `PigeonError::ConfigError`.

use std::fmt;
use std::sync::Arc;

use pigeon_link::{Link, LinkEvent};
use pigeon_storage::{IdentityStore, StorageEngine, UploaderStore};
use pigeon_types::{MeshConfig, MeshEvent, PigeonError, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::command::NodeCommand;
use crate::event_loop;
use crate::gateway::GatewayUploader;
use crate::router::MeshRouter;

// ---------------------------------------------------------------------------
// Channel buffer sizes
// ---------------------------------------------------------------------------

/// Bounded command channel capacity. Small buffer — callers await
/// backpressure if the event loop is overloaded.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Bounded mesh event channel capacity. Larger, to absorb bursts of
/// incoming messages without blocking the event loop.
const EVENT_CHANNEL_SIZE: usize = 1024;

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Lifecycle state of the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Components created, event loop not started.
    Initializing,
    /// Event loop is active.
    Running,
    /// Graceful shutdown in progress.
    ShuttingDown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeRuntime (internal)
// ---------------------------------------------------------------------------

/// Owned runtime state moved into the event loop task.
pub(crate) struct NodeRuntime<L: Link> {
    pub router: MeshRouter,
    pub uploader: GatewayUploader,
    pub identity: IdentityStore,
    pub log: Arc<pigeon_storage::MessageLog>,
    pub link: L,
    pub link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    pub config: MeshConfig,
    pub event_tx: mpsc::Sender<MeshEvent>,
    pub command_rx: mpsc::Receiver<NodeCommand>,
    pub shutdown_rx: watch::Receiver<bool>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Pigeon mesh node — owns all subsystems and drives the event loop.
///
/// After construction via [`Node::new`], call [`Node::start`] to spawn
/// the event loop, then interact through the channels:
///
/// - Send [`NodeCommand`]s via [`Node::command_sender`].
/// - Receive [`MeshEvent`]s via [`Node::take_event_receiver`].
/// - Shut down via [`NodeCommand::Shutdown`] or [`Node::shutdown`].
pub struct Node<L: Link> {
    state: NodeState,
    /// Components to be moved into the event loop; `None` after
    /// `start()`.
    runtime: Option<NodeRuntime<L>>,
    command_tx: mpsc::Sender<NodeCommand>,
    /// `None` after taken by the consumer.
    event_rx: Option<mpsc::Receiver<MeshEvent>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<L: Link + 'static> Node<L> {
    /// Creates a new node over an opened storage engine and a link.
    ///
    /// `collector_endpoint`, when given, overrides and persists the
    /// stored endpoint; otherwise the previously persisted value is
    /// used.
    ///
    /// # Errors
    ///
    /// - [`PigeonError::ConfigError`] if the config fails validation.
    /// - [`PigeonError::StorageError`] if any store cannot be loaded.
    /// - [`PigeonError::UploadError`] if the HTTP client cannot be
    ///   built.
    pub fn new(
        engine: &StorageEngine,
        link: L,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        config: MeshConfig,
        collector_endpoint: Option<String>,
    ) -> Result<Self> {
        config.validate()?;

        let identity = engine.identity()?;
        let device_id = identity.device_id()?;
        let device_name = identity.device_name()?;

        let log = Arc::new(engine.message_log(&config)?);
        let uploader_store: Arc<UploaderStore> = Arc::new(engine.uploader()?);

        let endpoint = match collector_endpoint {
            Some(url) => {
                uploader_store.set_endpoint(&url)?;
                Some(url)
            }
            None => uploader_store.endpoint()?,
        };

        let router = MeshRouter::new(device_id, device_name.clone(), config.clone(), log.clone());
        let uploader = GatewayUploader::new(
            device_id,
            device_name,
            endpoint,
            log.clone(),
            uploader_store,
        )?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runtime = NodeRuntime {
            router,
            uploader,
            identity,
            log,
            link,
            link_rx,
            config,
            event_tx,
            command_rx,
            shutdown_rx,
        };

        Ok(Self {
            state: NodeState::Initializing,
            runtime: Some(runtime),
            command_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
        })
    }

    /// Starts the event loop in a new tokio task.
    ///
    /// Transitions `Initializing → Running` and returns the task
    /// handle, which resolves when the loop exits after shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`PigeonError::ConfigError`] if the node is not in
    /// `Initializing` state (prevents double-start).
    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        if self.state != NodeState::Initializing {
            return Err(PigeonError::ConfigError {
                reason: format!(
                    "cannot start node in state '{}'; expected 'initializing'",
                    self.state,
                ),
            });
        }

        let runtime = self.runtime.take().ok_or_else(|| PigeonError::ConfigError {
            reason: "runtime already consumed (double start?)".into(),
        })?;

        let handle = tokio::spawn(async move {
            event_loop::run_event_loop(runtime).await;
        });

        self.state = NodeState::Running;
        Ok(handle)
    }

    /// Initiates graceful shutdown. Await the handle returned by
    /// [`start`](Self::start) to wait for completion.
    ///
    /// # Errors
    ///
    /// Returns [`PigeonError::ConfigError`] if the node was never
    /// started. Repeated shutdown is idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == NodeState::Initializing {
            return Err(PigeonError::ConfigError {
                reason: "cannot shutdown a node that has not been started".into(),
            });
        }
        if self.state == NodeState::ShuttingDown {
            return Ok(());
        }

        self.state = NodeState::ShuttingDown;
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    /// Returns a cloneable sender for submitting commands.
    pub fn command_sender(&self) -> mpsc::Sender<NodeCommand> {
        self.command_tx.clone()
    }

    /// Takes the event receiver; returns `None` if already taken.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<MeshEvent>> {
        self.event_rx.take()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }
}
