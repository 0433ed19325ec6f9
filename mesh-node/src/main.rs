//! circle-mesh-node binary entry point.
//!
//! Usage:
//! ```bash
//! circle-mesh-node --config mesh.toml
//! ```
//!
//! Runs one mesh node over TCP until Ctrl-C. When `node.state_dir` is set,
//! circle snapshots are loaded on start and written on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use mesh_engine::{MeshEvent, MeshNode, NodeConfig, TcpMeshListener, TcpTransport};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let path = get_config_path();
    let config = NodeConfig::from_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    init_logging(config.node.debug);

    let node = MeshNode::from_config(&config, Arc::new(TcpTransport::new()))
        .context("invalid configuration")?;
    tracing::info!(
        "circle-mesh-node v{} starting as {}",
        env!("CARGO_PKG_VERSION"),
        node.local().node_id()
    );

    if let Some(dir) = &config.node.state_dir {
        let restored = node
            .load_state(dir)
            .await
            .with_context(|| format!("loading state from {}", dir.display()))?;
        tracing::info!("restored {} circle snapshot(s)", restored);
    }

    let mut listener = TcpMeshListener::bind(&config.node.listen)
        .await
        .with_context(|| format!("binding {}", config.node.listen))?;
    if let Some(host) = &config.node.advertise_host {
        listener = listener.with_advertised_host(host);
    }
    tracing::info!("listening on {}", config.node.listen);
    node.serve(Arc::new(listener)).await;
    node.start();

    let event_log = tokio::spawn(log_events(node.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");

    event_log.abort();
    node.shutdown().await;
    if let Some(dir) = &config.node.state_dir {
        node.save_state(dir)
            .await
            .with_context(|| format!("saving state to {}", dir.display()))?;
    }
    Ok(())
}

/// Log mesh events until the node goes away. Returns how many were logged.
async fn log_events(mut events: broadcast::Receiver<MeshEvent>) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                log_event(event);
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("event log fell behind, skipped {} event(s)", skipped);
            }
            Err(RecvError::Closed) => return logged,
        }
    }
}

fn log_event(event: MeshEvent) {
    match event {
        MeshEvent::MessageReceived { circle_id, message } => {
            tracing::debug!("message {} received in {}", message.msg_id, circle_id);
        }
        MeshEvent::AnchorChanged { circle_id, anchor } => {
            tracing::info!("anchor for {} is now {:?}", circle_id, anchor);
        }
        MeshEvent::PeerDiscovered { .. } | MeshEvent::CallSignal { .. } => {}
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` when the config asks for it.
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mesh.toml"))
}
