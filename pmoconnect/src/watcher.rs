//! Liste des pairs disponibles
//!
//! Le [`PeerWatcher`] suit les devices racine d'un type donné et publie
//! [`WatcherEvent::AvailablePeersChanged`] sur son bus à chaque changement
//! de l'ensemble, par exemple pour proposer une liste de serveurs à choisir
//! avant de fixer la cible d'une [`PeerConnection`](crate::PeerConnection).

use std::sync::{Arc, Weak};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use pmoupnp::PeerIdentifier;
use pmoupnp::identifiers::parse_type_version_urn;
use tracing::{debug, info, trace};

use crate::discovery::{DiscoveredDevice, DiscoveryFacility, DiscoveryListener, ListenerId};
use crate::errors::DiscoveryError;
use crate::events::{WatcherEvent, WatcherEventBus};

/// Pairs suivis ; `running` est faux hors de `start`..`stop`
#[derive(Default)]
struct Peers {
    running: bool,
    devices: Vec<DiscoveredDevice>,
}

impl Peers {
    fn ids(&self) -> Vec<PeerIdentifier> {
        self.devices.iter().map(|p| p.udn.clone()).collect()
    }
}

struct WatcherInner {
    facility: Arc<dyn DiscoveryFacility>,
    device_type: String,
    peers: Mutex<Peers>,
    listener: Mutex<Option<ListenerId>>,
    bus: WatcherEventBus,
}

struct WatcherListener(Weak<WatcherInner>);

impl DiscoveryListener for WatcherListener {
    fn on_root_device_added(&self, device: &DiscoveredDevice) {
        if let Some(inner) = self.0.upgrade() {
            inner.device_added(device);
        }
    }

    fn on_device_removed(&self, udn: &PeerIdentifier) {
        if let Some(inner) = self.0.upgrade() {
            inner.device_removed(udn);
        }
    }
}

pub struct PeerWatcher {
    inner: Arc<WatcherInner>,
}

impl PeerWatcher {
    /// `device_type` sans version (`schemas-upnp-org:device:MediaServer`) ;
    /// vide pour suivre tous les devices racine.
    pub fn new(facility: Arc<dyn DiscoveryFacility>, device_type: &str) -> Self {
        let device_type = device_type.strip_prefix("urn:").unwrap_or(device_type);
        Self {
            inner: Arc::new(WatcherInner {
                facility,
                device_type: device_type.to_string(),
                peers: Mutex::new(Peers::default()),
                listener: Mutex::new(None),
                bus: WatcherEventBus::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> Receiver<WatcherEvent> {
        self.inner.bus.subscribe()
    }

    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return Ok(());
        }
        self.inner.peers.lock().running = true;
        let adapter: Arc<dyn DiscoveryListener> =
            Arc::new(WatcherListener(Arc::downgrade(&self.inner)));
        match self.inner.facility.register_listener(adapter) {
            Ok(id) => *listener = Some(id),
            Err(e) => {
                self.inner.peers.lock().running = false;
                return Err(e);
            }
        }
        drop(listener);

        for device in self.inner.facility.known_devices() {
            self.inner.device_added(&device);
        }
        info!(device_type = %self.inner.device_type, "Peer watcher started");
        Ok(())
    }

    pub fn stop(&self) {
        let Some(id) = self.inner.listener.lock().take() else {
            return;
        };

        // Une annonce en vol après ce point ne modifie plus rien
        {
            let mut peers = self.inner.peers.lock();
            peers.running = false;
            if !peers.devices.is_empty() {
                peers.devices.clear();
                self.inner
                    .bus
                    .broadcast(WatcherEvent::AvailablePeersChanged { peers: Vec::new() });
            }
        }
        self.inner.facility.unregister_listener(id);
    }

    /// Pairs disponibles, dans l'ordre de découverte
    pub fn available_peers(&self) -> Vec<DiscoveredDevice> {
        self.inner.peers.lock().devices.clone()
    }
}

impl Drop for PeerWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WatcherInner {
    fn matches(&self, device: &DiscoveredDevice) -> bool {
        if self.device_type.is_empty() {
            return true;
        }
        parse_type_version_urn(&device.device_type)
            .map(|(kind, _)| kind.eq_ignore_ascii_case(&self.device_type))
            .unwrap_or(false)
    }

    // Les événements sont publiés sous le verrou des pairs pour rester
    // ordonnés avec ceux de `stop`.
    fn device_added(&self, device: &DiscoveredDevice) {
        if !self.matches(device) {
            return;
        }
        let mut peers = self.peers.lock();
        if !peers.running {
            trace!(udn = %device.udn, "Watcher stopped, announcement ignored");
            return;
        }
        match peers.devices.iter_mut().find(|p| p.udn == device.udn) {
            Some(known) => {
                *known = device.clone();
                return;
            }
            None => peers.devices.push(device.clone()),
        }
        debug!(udn = %device.udn, name = %device.friendly_name, "Peer available");
        self.bus
            .broadcast(WatcherEvent::AvailablePeersChanged { peers: peers.ids() });
    }

    fn device_removed(&self, udn: &PeerIdentifier) {
        let mut peers = self.peers.lock();
        let before = peers.devices.len();
        peers.devices.retain(|p| &p.udn != udn);
        if peers.devices.len() == before {
            return;
        }
        debug!(udn = %udn, "Peer gone");
        self.bus
            .broadcast(WatcherEvent::AvailablePeersChanged { peers: peers.ids() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DeviceDescription, Session};
    use std::time::Duration;

    #[derive(Default)]
    struct ManualFacility {
        listeners: Mutex<Vec<Arc<dyn DiscoveryListener>>>,
        known: Vec<DiscoveredDevice>,
    }

    impl ManualFacility {
        fn announce(&self, device: &DiscoveredDevice) {
            for listener in self.listeners.lock().clone() {
                listener.on_root_device_added(device);
            }
        }

        fn remove(&self, udn: &PeerIdentifier) {
            for listener in self.listeners.lock().clone() {
                listener.on_device_removed(udn);
            }
        }
    }

    impl DiscoveryFacility for ManualFacility {
        fn register_listener(
            &self,
            listener: Arc<dyn DiscoveryListener>,
        ) -> Result<ListenerId, DiscoveryError> {
            let mut listeners = self.listeners.lock();
            listeners.push(listener);
            Ok(ListenerId(listeners.len() as u64))
        }

        fn unregister_listener(&self, _id: ListenerId) {
            self.listeners.lock().clear();
        }

        fn known_devices(&self) -> Vec<DiscoveredDevice> {
            self.known.clone()
        }

        fn resolve_description(
            &self,
            device: &DiscoveredDevice,
            _timeout: Duration,
        ) -> Result<DeviceDescription, DiscoveryError> {
            Err(DiscoveryError::NoLocation(device.udn.to_string()))
        }

        fn open_session(
            &self,
            device: &DiscoveredDevice,
            _description: DeviceDescription,
        ) -> Result<Arc<dyn Session>, DiscoveryError> {
            Err(DiscoveryError::NoLocation(device.udn.to_string()))
        }
    }

    fn device(udn: &str, device_type: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            udn: PeerIdentifier::new(udn),
            device_type: device_type.to_string(),
            friendly_name: udn.to_string(),
            service_ids: Vec::new(),
            locations: Vec::new(),
            server_header: String::new(),
        }
    }

    #[test]
    fn test_tracks_matching_devices() {
        let server = device("uuid:server", "urn:schemas-upnp-org:device:MediaServer:1");
        let facility = Arc::new(ManualFacility {
            known: vec![server.clone()],
            ..Default::default()
        });
        let watcher = PeerWatcher::new(facility.clone(), "schemas-upnp-org:device:MediaServer");
        let events = watcher.subscribe();
        watcher.start().unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            WatcherEvent::AvailablePeersChanged {
                peers: vec![server.udn.clone()]
            }
        );

        // Un renderer n'est pas un pair ; une réannonce ne change rien
        facility.announce(&device("uuid:renderer", "urn:schemas-upnp-org:device:MediaRenderer:1"));
        facility.announce(&server);
        assert!(events.try_recv().is_err());

        let other = device("uuid:other", "urn:schemas-upnp-org:device:MediaServer:4");
        facility.announce(&other);
        assert_eq!(
            events.try_recv().unwrap(),
            WatcherEvent::AvailablePeersChanged {
                peers: vec![server.udn.clone(), other.udn.clone()]
            }
        );

        facility.remove(&server.udn);
        assert_eq!(
            events.try_recv().unwrap(),
            WatcherEvent::AvailablePeersChanged {
                peers: vec![other.udn.clone()]
            }
        );
        assert_eq!(watcher.available_peers(), vec![other]);

        watcher.stop();
        assert_eq!(
            events.try_recv().unwrap(),
            WatcherEvent::AvailablePeersChanged { peers: Vec::new() }
        );
        assert!(facility.listeners.lock().is_empty());
    }

    #[test]
    fn test_announcement_after_stop_is_ignored() {
        let facility = Arc::new(ManualFacility::default());
        let watcher = PeerWatcher::new(facility.clone(), "schemas-upnp-org:device:MediaServer");
        let events = watcher.subscribe();
        watcher.start().unwrap();

        // Écouteur encore entre les mains de la couche de découverte
        let late = facility.listeners.lock()[0].clone();
        facility.announce(&device("uuid:first", "urn:schemas-upnp-org:device:MediaServer:1"));
        assert!(events.try_recv().is_ok());

        watcher.stop();
        assert_eq!(
            events.try_recv().unwrap(),
            WatcherEvent::AvailablePeersChanged { peers: Vec::new() }
        );

        late.on_root_device_added(&device("uuid:late", "urn:schemas-upnp-org:device:MediaServer:1"));
        assert!(watcher.available_peers().is_empty());
        assert!(events.try_recv().is_err());

        // Un redémarrage suit de nouveau les annonces
        watcher.start().unwrap();
        facility.announce(&device("uuid:again", "urn:schemas-upnp-org:device:MediaServer:1"));
        assert_eq!(watcher.available_peers().len(), 1);
    }
}
