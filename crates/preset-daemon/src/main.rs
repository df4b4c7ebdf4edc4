mod controller;
mod core;
mod error;
mod http;
mod logging;
mod media;
mod mpv;
mod network;
mod presenter;
mod signals;
mod socket;
mod store;

use std::time::Duration;

use preset_proto::config::Config;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::core::{DaemonCore, DaemonEvent};

/// Fan-out from the core (and the log layer) to every attached client.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// A new snapshot is in the `StateManager`.
    StateUpdated,
    Toast { message: String, long: bool },
    Log(String),
    Error(String),
}

const MIN_NETWORK_POLL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Created before logging so WARN/ERROR records can reach clients.
    let (clients_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let log_path = logging::init(&preset_proto::platform::data_dir(), clients_tx.clone())?;
    info!("preset-daemon {} logging to {:?}", env!("CARGO_PKG_VERSION"), log_path);

    let config = Config::load()?;
    info!(
        "config {:?}: socket port {}, http {}",
        Config::config_path(),
        config.socket.port,
        if config.http.enabled { "on" } else { "off" }
    );

    let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(256);
    let core = DaemonCore::new(config.clone(), clients_tx.clone(), event_tx.clone()).await?;
    let snapshots = core.state_manager();

    socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        snapshots.clone(),
        event_tx.clone(),
        clients_tx,
    );
    if config.http.enabled {
        http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            snapshots,
            event_tx.clone(),
        );
    }
    network::spawn_watcher(
        network::SystemNetworkMonitor::new(),
        Duration::from_millis(config.network.poll_interval_ms).max(MIN_NETWORK_POLL),
        event_tx.clone(),
    );

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, shutting down");
                let _ = event_tx.send(DaemonEvent::Shutdown).await;
            }
            Err(e) => warn!("cannot listen for ctrl-c: {}", e),
        }
    });

    core.run(event_rx).await?;
    info!("preset-daemon exiting");
    Ok(())
}
