//! # pmoconnect
//!
//! Connexion d'un point de contrôle UPnP à un pair désigné.
//!
//! - [`SsdpNetworkTracker`] écoute SSDP sur les interfaces autorisées et
//!   télécharge les descriptions des devices racine annoncés.
//! - [`PeerConnection`] se connecte au pair cible dès qu'il est annoncé et
//!   lie ses services requis en proxies ([`ContentDirectoryProxy`],
//!   [`ConnectionManagerProxy`]).
//! - [`PeerWatcher`] publie la liste des pairs disponibles.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmoconnect::{PeerConnection, PeerSettings, SsdpNetworkTracker, TrackerSettings};
//!
//! let tracker = Arc::new(SsdpNetworkTracker::new(TrackerSettings::default()));
//! let connection = PeerConnection::new(tracker, PeerSettings::default());
//! connection.start()?;
//! # Ok::<(), pmoconnect::PeerConnectionError>(())
//! ```

mod events;

pub mod config_ext;
pub mod discovery;
pub mod errors;
pub mod peer_connection;
pub mod proxy;
pub mod watcher;

pub use config_ext::{PeerConfigExt, PeerSettings};
pub use discovery::{
    DeviceDescription, DeviceLocation, DiscoveredDevice, DiscoveryFacility, DiscoveryListener,
    ListenerId, ServiceDescription, Session, SsdpNetworkTracker, TrackerSettings,
};
pub use errors::{DiscoveryError, PeerConnectionError, ProxyError};
pub use events::{WatcherEvent, WatcherEventBus};
pub use peer_connection::{
    PeerConnection, PeerConnectionObserver, PeerConnectionState, ServiceBindings,
};
pub use proxy::{
    BrowseFlag, BrowseResult, ConnectionInfo, ConnectionManagerProxy, ContentDirectoryProxy,
    ProtocolInfo, ServiceProxy,
};
pub use watcher::PeerWatcher;
