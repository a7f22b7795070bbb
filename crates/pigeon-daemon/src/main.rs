//! Pigeon daemon — headless mesh node for LAN deployments.
//!
//! Runs a full mesh node over the LAN link: sled storage in the data
//! directory, UDP-beacon discovery plus TCP sessions to nearby peers,
//! and — when a collector endpoint is configured — a periodic
//! reachability probe that activates the gateway uploader whenever the
//! collector is reachable.
//!
//! The daemon runs until interrupted with Ctrl+C.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use pigeon_link::lan::{LanConfig, LanLink};
use pigeon_link::PeerInfo;
use pigeon_node::{Node, NodeCommand};
use pigeon_storage::StorageEngine;
use pigeon_types::{PigeonError, Result};
use tokio::sync::mpsc;

mod config;

use config::DaemonConfig;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Headless Pigeon mesh node.
#[derive(Debug, Parser)]
#[command(name = "pigeon-daemon", version, about)]
pub struct Cli {
    /// Data directory for storage (default: ./pigeon-data).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Display name for this device.
    #[arg(long)]
    pub device_name: Option<String>,

    /// Collector endpoint URL, e.g. https://collector.example.org/api/messages.
    #[arg(long)]
    pub collector: Option<String>,

    /// UDP port for LAN discovery beacons.
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// Cadence of the collector reachability probe, in seconds.
    #[arg(long)]
    pub probe_secs: Option<u64>,

    /// Load configuration from a JSON file (CLI flags override it).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let daemon_config = match &cli.config {
        Some(path) => match DaemonConfig::load(path) {
            Ok(config) => config.merge_cli(&cli),
            Err(e) => {
                tracing::error!(%e, "failed to load config file");
                std::process::exit(1);
            }
        },
        None => DaemonConfig::default().merge_cli(&cli),
    };

    if let Err(e) = run_daemon(daemon_config).await {
        tracing::error!(%e, "daemon error");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Daemon main logic
// ---------------------------------------------------------------------------

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    config.mesh.validate()?;

    let engine = StorageEngine::open(&config.data_dir)?;
    let identity = engine.identity()?;
    if let Some(name) = &config.device_name {
        identity.set_device_name(name)?;
    }
    let device_id = identity.device_id()?;
    let device_name = identity.device_name()?;

    tracing::info!(%device_id, %device_name, "pigeon daemon starting");

    let lan_config = LanConfig {
        discovery_port: config.discovery_port,
        connect_timeout_secs: config.mesh.connect_timeout_secs,
        ..LanConfig::default()
    };
    let (link, link_rx) = LanLink::new(
        PeerInfo {
            device_id,
            device_name: device_name.clone(),
        },
        lan_config,
    );

    let mut node = Node::new(
        &engine,
        link,
        link_rx,
        config.mesh.clone(),
        config.collector_endpoint.clone(),
    )?;
    let commands = node.command_sender();
    let mut events = node
        .take_event_receiver()
        .ok_or_else(|| PigeonError::ConfigError {
            reason: "event receiver already taken".into(),
        })?;
    let handle = node.start()?;

    // Drain mesh events into the log so operators can follow along.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(?event, "mesh event");
        }
    });

    // Reachability probe: the collector answering at all means we have
    // Internet connectivity and should act as a gateway.
    if let Some(endpoint) = config.collector_endpoint.clone() {
        let probe_commands = commands.clone();
        tokio::spawn(run_reachability_probe(
            endpoint,
            config.probe_secs,
            probe_commands,
        ));
    } else {
        tracing::info!("no collector endpoint configured — gateway uploads disabled");
    }

    tokio::signal::ctrl_c().await.map_err(|e| PigeonError::ConfigError {
        reason: format!("failed to install signal handler: {e}"),
    })?;
    tracing::info!("interrupt received — shutting down");

    node.shutdown()?;
    let _ = handle.await;
    engine.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reachability probe
// ---------------------------------------------------------------------------

/// Periodically probes the collector and feeds the result into the
/// node. Any HTTP response counts as reachable; only transport errors
/// mean offline.
async fn run_reachability_probe(
    endpoint: String,
    probe_secs: u64,
    commands: mpsc::Sender<NodeCommand>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(%e, "failed to build probe client — gateway uploads disabled");
            return;
        }
    };

    let mut tick = tokio::time::interval(Duration::from_secs(probe_secs.max(1)));

    loop {
        tick.tick().await;
        let online = client.head(&endpoint).send().await.is_ok();
        if commands
            .send(NodeCommand::SetReachable { online })
            .await
            .is_err()
        {
            // Node is gone; stop probing.
            return;
        }
    }
}
