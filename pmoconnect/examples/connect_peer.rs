//! Connexion au serveur de médias désigné dans la configuration
//!
//! ```bash
//! RUST_LOG=pmoconnect=debug cargo run -p pmoconnect --example connect_peer -- uuid:...
//! ```
//!
//! Sans argument, la cible est lue dans la section `peer` de la configuration.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pmoconfig::get_config;
use pmoconnect::{
    PeerConfigExt, PeerConnection, PeerConnectionObserver, PeerWatcher, Session,
    SsdpNetworkTracker, WatcherEvent,
};
use pmoupnp::PeerIdentifier;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct LogObserver;

impl PeerConnectionObserver for LogObserver {
    fn on_connected(&self, session: &Arc<dyn Session>) {
        let description = session.description();
        info!(
            "Connected to {} ({}) with {} services",
            description.friendly_name,
            description.udn,
            description.services.len()
        );
    }

    fn on_disconnected(&self, session: &Arc<dyn Session>) {
        info!("Disconnected from {}", session.peer_id());
    }
}

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = get_config();
    let tracker = Arc::new(SsdpNetworkTracker::from_config(&config));

    let watcher = PeerWatcher::new(tracker.clone(), &config.get_device_type());
    let events = watcher.subscribe();
    watcher.start()?;

    let connection = PeerConnection::from_config(tracker.clone(), config.clone());
    if let Some(udn) = std::env::args().nth(1) {
        connection.set_target_identifier(Some(PeerIdentifier::new(&udn)));
    }
    if connection.target_identifier().is_none() {
        match config.get_last_peer_udn() {
            Some(last) => warn!(
                "No target peer; last connected was {} ({})",
                config.get_last_peer_name().unwrap_or_default(),
                last
            ),
            None => warn!("No target peer: set peer.target_udn or pass a UDN"),
        }
    }
    connection.add_observer(Arc::new(LogObserver));
    connection.start()?;

    loop {
        if let Ok(WatcherEvent::AvailablePeersChanged { peers }) =
            events.recv_timeout(Duration::from_secs(10))
        {
            info!("{} peer(s) available", peers.len());
            for peer in &peers {
                info!("  - {}", peer);
            }
        }

        if let Some(directory) = connection.content_directory() {
            match directory.browse_children("0", 0, 10) {
                Ok(result) => info!(
                    "Root container: {} of {} entries (update {})",
                    result.number_returned, result.total_matches, result.update_id
                ),
                Err(e) => warn!("Browse failed: {}", e),
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
}
