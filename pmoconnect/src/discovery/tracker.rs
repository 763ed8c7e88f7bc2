//! Tracker SSDP : la couche de découverte réseau
//!
//! Le tracker lie un socket de découverte par adresse locale active, envoie
//! les M-SEARCH configurés, et transforme les annonces reçues en
//! notifications pour les [`DiscoveryListener`] inscrits.
//!
//! Deux sortes de threads tournent tant que le tracker est démarré :
//!
//! - un thread de réception par socket, qui parse les datagrammes ;
//! - un thread de traitement, qui récupère les descriptions et notifie les
//!   écouteurs.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use pmoconfig::Config;
use pmoupnp::identifiers::{parse_protocol_version_from_agent_string, parse_usn};
use pmoupnp::ssdp::{
    DEFAULT_MX, MulticastBinding, MulticastChannel, SSDP_PORT, SsdpEvent, UdpGroupSocket,
    bind_multicast, build_msearch, multicast_address_for_interface, parse_message,
};
use pmoupnp::{PeerIdentifier, USER_AGENT, UpnpNetworkConfigExt, VersionPolicy};
use pmoutils::{AddressCandidate, AddressFamily, endpoint_to_string, select_for_family};
use tracing::{debug, info, trace, warn};

use super::{
    DeviceDescription, DeviceLocation, DisconnectHandler, DiscoveredDevice, DiscoveryFacility,
    DiscoveryListener, ListenerId, Session, fetch_description,
};
use crate::config_ext::PeerConfigExt;
use crate::errors::DiscoveryError;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);
const DATAGRAM_SIZE: usize = 8192;
/// Sur unix chaque socket est lié à l'adresse non spécifiée : un même
/// datagramme arrive une fois par socket, à quelques microsecondes d'écart.
const DUPLICATE_WINDOW: Duration = Duration::from_millis(250);

/// Réglages du tracker
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub allowed_addresses: Vec<String>,
    pub families: Vec<AddressFamily>,
    pub site_local_operation: bool,
    pub version_policy: VersionPolicy,
    pub search_targets: Vec<String>,
    pub mx: u32,
    pub description_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            allowed_addresses: Vec::new(),
            families: vec![AddressFamily::Ipv4, AddressFamily::Ipv6],
            site_local_operation: false,
            version_policy: VersionPolicy::Lax,
            search_targets: vec!["upnp:rootdevice".to_string()],
            mx: DEFAULT_MX,
            description_timeout: Duration::from_secs(10),
        }
    }
}

impl TrackerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allowed_addresses: config.get_allowed_addresses(),
            families: config.enabled_families(),
            site_local_operation: config.get_site_local_operation(),
            version_policy: config.get_version_policy(),
            search_targets: config.get_search_targets(),
            mx: DEFAULT_MX,
            description_timeout: config.get_handshake_timeout(),
        }
    }

    /// Adresses locales actives pour les familles autorisées
    fn local_addresses(&self) -> Vec<AddressCandidate> {
        pmoutils::upnp_enabled_addresses(&self.allowed_addresses)
            .into_iter()
            .filter(|candidate| self.families.contains(&candidate.family))
            .collect()
    }
}

struct KnownDevice {
    device: DiscoveredDevice,
    last_fetch: Instant,
    max_age: u32,
}

impl KnownDevice {
    /// La description est relue passée la moitié de sa durée de validité.
    fn needs_refresh(&self) -> bool {
        self.last_fetch.elapsed() > Duration::from_secs(u64::from(self.max_age) / 2)
    }
}

struct Runtime {
    stop: Arc<AtomicBool>,
    bindings: Vec<MulticastBinding<UdpGroupSocket>>,
    receivers: Vec<JoinHandle<()>>,
}

struct TrackerInner {
    settings: TrackerSettings,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn DiscoveryListener>)>>,
    next_listener: AtomicU64,
    devices: Mutex<HashMap<PeerIdentifier, KnownDevice>>,
    sessions: Mutex<Vec<Weak<SsdpSession>>>,
    runtime: Mutex<Option<Runtime>>,
}

/// Couche de découverte fondée sur SSDP.
///
/// Les sockets sont liés au premier [`register_listener`](DiscoveryFacility::register_listener)
/// ou par un appel explicite à [`start`](Self::start).
pub struct SsdpNetworkTracker {
    inner: Arc<TrackerInner>,
}

impl SsdpNetworkTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                settings,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                devices: Mutex::new(HashMap::new()),
                sessions: Mutex::new(Vec::new()),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(TrackerSettings::from_config(config))
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.inner.settings
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.lock().is_some()
    }

    /// Lie les sockets de découverte et lance la recherche.
    ///
    /// Échoue seulement si aucun socket n'a pu être lié.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut runtime = self.inner.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        let candidates = self.inner.settings.local_addresses();
        if candidates.is_empty() {
            return Err(DiscoveryError::NoLocalAddress);
        }

        let mut bindings = Vec::new();
        let mut last_error = None;
        for candidate in &candidates {
            match bind_multicast(candidate, MulticastChannel::Discovery) {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    warn!(local = %candidate.address, "Cannot bind SSDP socket: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if bindings.is_empty() {
            return Err(last_error.map_or(DiscoveryError::NoLocalAddress, DiscoveryError::from));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded::<Datagram>();
        let receivers = match spawn_receivers(&bindings, &tx, &stop) {
            Ok(receivers) => receivers,
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        drop(tx);

        // Le thread de traitement s'arrête quand tous les récepteurs sont partis
        let weak = Arc::downgrade(&self.inner);
        let worker = thread::Builder::new()
            .name("pmoconnect-ssdp-worker".into())
            .spawn(move || {
                let mut duplicates = DuplicateFilter::new(DUPLICATE_WINDOW);
                for datagram in rx.iter() {
                    if duplicates.is_duplicate(&datagram, Instant::now()) {
                        trace!(from = %datagram.from, "Duplicate datagram dropped");
                        continue;
                    }
                    let Some(event) = parse_message(&datagram.payload, datagram.from) else {
                        continue;
                    };
                    match weak.upgrade() {
                        Some(inner) => inner.handle_event(event),
                        None => break,
                    }
                }
                debug!("SSDP worker stopped");
            });
        if let Err(e) = worker {
            stop.store(true, Ordering::SeqCst);
            return Err(e.into());
        }

        for binding in &bindings {
            self.inner.send_search(binding);
        }

        info!(sockets = bindings.len(), "✅ SSDP tracker started");
        *runtime = Some(Runtime {
            stop,
            bindings,
            receivers,
        });
        Ok(())
    }

    /// Relance les M-SEARCH configurés sur tous les sockets.
    pub fn search(&self) {
        if let Some(runtime) = self.inner.runtime.lock().as_ref() {
            for binding in &runtime.bindings {
                self.inner.send_search(binding);
            }
        }
    }

    /// Arrête les threads, quitte les groupes, perd les sessions et oublie
    /// les devices connus.
    pub fn stop(&self) {
        let Some(runtime) = self.inner.runtime.lock().take() else {
            return;
        };

        runtime.stop.store(true, Ordering::SeqCst);
        for handle in runtime.receivers {
            if handle.join().is_err() {
                warn!("SSDP receiver thread panicked");
            }
        }
        drop(runtime.bindings);

        self.inner.lose_sessions(None);
        let removed: Vec<PeerIdentifier> = self.inner.devices.lock().drain().map(|(id, _)| id).collect();
        for udn in &removed {
            self.inner.dispatch_removed(udn);
        }
        info!("SSDP tracker stopped");
    }
}

impl Drop for SsdpNetworkTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DiscoveryFacility for SsdpNetworkTracker {
    fn register_listener(
        &self,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<ListenerId, DiscoveryError> {
        self.start()?;
        Ok(self.inner.add_listener(listener))
    }

    fn unregister_listener(&self, id: ListenerId) {
        self.inner.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn known_devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.known_devices()
    }

    fn resolve_description(
        &self,
        device: &DiscoveredDevice,
        timeout: Duration,
    ) -> Result<DeviceDescription, DiscoveryError> {
        self.inner.resolve_description(device, timeout)
    }

    fn open_session(
        &self,
        device: &DiscoveredDevice,
        description: DeviceDescription,
    ) -> Result<Arc<dyn Session>, DiscoveryError> {
        let session: Arc<dyn Session> = self.inner.open_session(device, description)?;
        Ok(session)
    }
}

impl TrackerInner {
    fn add_listener(&self, listener: Arc<dyn DiscoveryListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    fn known_devices(&self) -> Vec<DiscoveredDevice> {
        self.devices
            .lock()
            .values()
            .map(|known| known.device.clone())
            .collect()
    }

    fn listeners(&self) -> Vec<Arc<dyn DiscoveryListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn dispatch_added(&self, device: &DiscoveredDevice) {
        for listener in self.listeners() {
            listener.on_root_device_added(device);
        }
    }

    fn dispatch_removed(&self, udn: &PeerIdentifier) {
        for listener in self.listeners() {
            listener.on_device_removed(udn);
        }
    }

    fn send_search(&self, binding: &MulticastBinding<UdpGroupSocket>) {
        let Some(socket) = binding.socket() else {
            return;
        };
        let local = binding.local();
        let group = multicast_address_for_interface(
            &local.address,
            MulticastChannel::Discovery,
            self.settings.site_local_operation,
        );
        let target = match group {
            IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, SSDP_PORT, 0, local.scope_id)),
            v4 => SocketAddr::new(v4, SSDP_PORT),
        };
        let host = endpoint_to_string(&group, SSDP_PORT);

        for st in &self.settings.search_targets {
            let message = build_msearch(&host, st, self.settings.mx, USER_AGENT);
            match socket.send_to(message.as_bytes(), target) {
                Ok(_) => debug!(local = %local.address, dest = %target, st = %st, "M-SEARCH sent"),
                Err(e) => warn!(local = %local.address, dest = %target, "Cannot send M-SEARCH: {}", e),
            }
        }
    }

    fn handle_event(&self, event: SsdpEvent) {
        match event {
            SsdpEvent::ByeBye { usn, .. } => match parse_usn(&usn) {
                Ok(parsed) => self.device_gone(&PeerIdentifier::new(parsed.device_id)),
                Err(e) => trace!("Ignoring byebye: {}", e),
            },
            SsdpEvent::Alive {
                usn,
                nt,
                location,
                server,
                max_age,
                from,
            } => self.device_alive(&usn, &nt, &location, &server, max_age, from),
            SsdpEvent::SearchResponse {
                usn,
                st,
                location,
                server,
                max_age,
                from,
            } => self.device_alive(&usn, &st, &location, &server, max_age, from),
        }
    }

    fn device_alive(
        &self,
        usn: &str,
        notification_type: &str,
        location: &str,
        server: &str,
        max_age: u32,
        from: SocketAddr,
    ) {
        if !is_device_announcement(notification_type) {
            trace!(usn = %usn, nt = %notification_type, "Not a device announcement, ignored");
            return;
        }
        let udn = match parse_usn(usn) {
            Ok(parsed) => PeerIdentifier::new(parsed.device_id),
            Err(e) => {
                debug!("Ignoring announcement from {}: {}", from, e);
                return;
            }
        };
        let device_location = DeviceLocation::new(from.ip(), location);

        let fresh = {
            let mut devices = self.devices.lock();
            match devices.get_mut(&udn) {
                Some(known) if !known.needs_refresh() => {
                    known.device.add_location(device_location.clone());
                    known.max_age = max_age;
                    Some(known.device.clone())
                }
                _ => None,
            }
        };
        if let Some(device) = fresh {
            self.dispatch_added(&device);
            return;
        }

        let description = match fetch_description(location, self.settings.description_timeout) {
            Ok(description) => description,
            Err(e) => {
                warn!(udn = %udn, "Cannot fetch description at {}: {}", location, e);
                return;
            }
        };
        if description.udn != udn {
            debug!(udn = %udn, root = %description.udn, "Announcement of an embedded device, ignored");
            return;
        }

        let mut device = DiscoveredDevice::from_description(&description, device_location, server);
        let is_new = {
            let mut devices = self.devices.lock();
            let previous = devices.remove(&udn);
            if let Some(previous) = &previous {
                for known_location in &previous.device.locations {
                    device.add_location(known_location.clone());
                }
            }
            devices.insert(
                udn.clone(),
                KnownDevice {
                    device: device.clone(),
                    last_fetch: Instant::now(),
                    max_age,
                },
            );
            previous.is_none()
        };

        if is_new {
            info!(
                udn = %udn,
                friendly_name = %device.friendly_name,
                device_type = %device.device_type,
                "Root device discovered"
            );
        }
        self.dispatch_added(&device);
    }

    fn device_gone(&self, udn: &PeerIdentifier) {
        let removed = self.devices.lock().remove(udn).is_some();
        self.lose_sessions(Some(udn));
        if removed {
            info!(udn = %udn, "Root device left");
            self.dispatch_removed(udn);
        }
    }

    /// Signale la perte des sessions ouvertes (toutes, ou celles d'un pair).
    fn lose_sessions(&self, udn: Option<&PeerIdentifier>) {
        let lost: Vec<Arc<SsdpSession>> = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|session| udn.is_none_or(|udn| session.peer_id() == udn))
                .collect()
        };
        for session in lost {
            session.fire_disconnect();
        }
    }

    fn resolve_description(
        &self,
        device: &DiscoveredDevice,
        timeout: Duration,
    ) -> Result<DeviceDescription, DiscoveryError> {
        let mut locations: Vec<&DeviceLocation> = Vec::with_capacity(device.locations.len());
        locations.extend(device.preferred_location());
        locations.extend(
            device
                .locations
                .iter()
                .filter(|l| Some(*l) != device.preferred_location()),
        );

        let mut last_error = DiscoveryError::NoLocation(device.udn.to_string());
        for location in locations {
            match fetch_description(&location.description_url, timeout) {
                Ok(description) if description.udn == device.udn => return Ok(description),
                Ok(description) => {
                    warn!(
                        udn = %device.udn,
                        found = %description.udn,
                        "Description at {} describes another device", location.description_url
                    );
                }
                Err(e) => {
                    debug!(udn = %device.udn, "Description at {} unavailable: {}", location.description_url, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn open_session(
        &self,
        device: &DiscoveredDevice,
        description: DeviceDescription,
    ) -> Result<Arc<SsdpSession>, DiscoveryError> {
        let minor = parse_protocol_version_from_agent_string(
            &device.server_header,
            self.settings.version_policy,
        )?;

        let eventing = if minor >= 1 {
            self.bind_eventing(device)
        } else {
            None
        };

        let session = Arc::new(SsdpSession::new(description, eventing));
        self.sessions.lock().push(Arc::downgrade(&session));
        info!(
            udn = %session.peer_id(),
            upnp_minor = minor,
            eventing = session.has_eventing(),
            "Session opened"
        );
        Ok(session)
    }

    /// Écoute multicast des événements (UPnP 1.1) sur l'adresse locale la
    /// plus proche dans la famille du pair ; un échec n'empêche pas la session.
    fn bind_eventing(&self, device: &DiscoveredDevice) -> Option<EventingListener> {
        let family = device.preferred_location()?.family;
        let candidates = select_for_family(family, self.settings.local_addresses());
        let local = candidates
            .iter()
            .find(|candidate| !candidate.is_loopback())
            .or_else(|| candidates.first())?;

        match bind_multicast(local, MulticastChannel::Eventing) {
            Ok(binding) => match EventingListener::spawn(binding) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!(udn = %device.udn, "Cannot start multicast event listener: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!(udn = %device.udn, "Cannot bind multicast event socket: {}", e);
                None
            }
        }
    }
}

fn is_device_announcement(notification_type: &str) -> bool {
    notification_type.eq_ignore_ascii_case("upnp:rootdevice")
        || notification_type.to_ascii_lowercase().contains(":device:")
}

/// Datagramme brut reçu sur un des sockets SSDP
struct Datagram {
    from: SocketAddr,
    payload: String,
}

/// Écarte les copies d'un datagramme reçues sur plusieurs sockets
struct DuplicateFilter {
    window: Duration,
    seen: HashMap<(SocketAddr, String), Instant>,
}

impl DuplicateFilter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    fn is_duplicate(&mut self, datagram: &Datagram, now: Instant) -> bool {
        let window = self.window;
        self.seen
            .retain(|_, received| now.saturating_duration_since(*received) < window);
        let key = (datagram.from, datagram.payload.clone());
        if self.seen.contains_key(&key) {
            return true;
        }
        self.seen.insert(key, now);
        false
    }
}

fn spawn_receivers(
    bindings: &[MulticastBinding<UdpGroupSocket>],
    tx: &Sender<Datagram>,
    stop: &Arc<AtomicBool>,
) -> io::Result<Vec<JoinHandle<()>>> {
    let mut receivers = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let Some(socket) = binding.socket() else {
            continue;
        };
        let socket = socket.try_clone_udp()?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        let tx = tx.clone();
        let stop = stop.clone();
        let handle = thread::Builder::new()
            .name("pmoconnect-ssdp-rx".into())
            .spawn(move || run_receiver(socket, tx, stop))?;
        receivers.push(handle);
    }
    Ok(receivers)
}

fn run_receiver(socket: UdpSocket, tx: Sender<Datagram>, stop: Arc<AtomicBool>) {
    let mut buf = vec![0u8; DATAGRAM_SIZE];
    while !stop.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let payload = String::from_utf8_lossy(&buf[..len]).into_owned();
                if tx.send(Datagram { from, payload }).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!("SSDP receive error: {}", e);
                thread::sleep(RECEIVE_TIMEOUT);
            }
        }
    }
    debug!("SSDP receiver stopped");
}

/// Écoute des événements multicast d'une session.
struct EventingListener {
    stop: Arc<AtomicBool>,
    _binding: MulticastBinding<UdpGroupSocket>,
}

impl EventingListener {
    fn spawn(binding: MulticastBinding<UdpGroupSocket>) -> io::Result<Self> {
        let socket = binding
            .socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket released"))?
            .try_clone_udp()?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        thread::Builder::new()
            .name("pmoconnect-gena-rx".into())
            .spawn(move || {
                let mut buf = vec![0u8; DATAGRAM_SIZE];
                while !thread_stop.load(Ordering::SeqCst) {
                    match socket.recv_from(&mut buf) {
                        Ok((len, from)) => trace!("Multicast event from {} ({} bytes)", from, len),
                        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                        Err(e) => {
                            debug!("Multicast event receive error: {}", e);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            stop,
            _binding: binding,
        })
    }
}

impl Drop for EventingListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Session ouverte par le tracker.
///
/// La session est perdue sur `ssdp:byebye` du pair ou à l'arrêt du tracker ;
/// l'écoute des événements multicast est alors libérée.
pub struct SsdpSession {
    peer_id: PeerIdentifier,
    description: DeviceDescription,
    open: AtomicBool,
    handler: Mutex<Option<DisconnectHandler>>,
    eventing: Mutex<Option<EventingListener>>,
}

impl SsdpSession {
    fn new(description: DeviceDescription, eventing: Option<EventingListener>) -> Self {
        Self {
            peer_id: description.udn.clone(),
            description,
            open: AtomicBool::new(true),
            handler: Mutex::new(None),
            eventing: Mutex::new(eventing),
        }
    }

    pub fn has_eventing(&self) -> bool {
        self.eventing.lock().is_some()
    }

    fn fire_disconnect(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.eventing.lock().take();
        info!(udn = %self.peer_id, "Session lost");
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl Session for SsdpSession {
    fn peer_id(&self) -> &PeerIdentifier {
        &self.peer_id
    }

    fn description(&self) -> &DeviceDescription {
        &self.description
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        let mut slot = self.handler.lock();
        if self.open.load(Ordering::SeqCst) {
            *slot = Some(handler);
            return;
        }
        drop(slot);
        handler();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.eventing.lock().take();
            self.handler.lock().take();
            debug!(udn = %self.peer_id, "Session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const UDN: &str = "4d696e69-444c-164e-9d41-b827eb0f0a6b";

    fn description_xml() -> String {
        format!(
            "<?xml version=\"1.0\"?>\
             <root xmlns=\"urn:schemas-upnp-org:device-1-0\"><device>\
             <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>\
             <friendlyName>MiniDLNA</friendlyName>\
             <UDN>uuid:{}</UDN>\
             <serviceList><service>\
             <serviceType>urn:schemas-upnp-org:service:ContentDirectory:1</serviceType>\
             <serviceId>urn:upnp-org:serviceId:ContentDirectory</serviceId>\
             <controlURL>/ctl/ContentDir</controlURL>\
             <eventSubURL>/evt/ContentDir</eventSubURL>\
             </service></serviceList></device></root>",
            UDN
        )
    }

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<PeerIdentifier>>,
        removed: Mutex<Vec<PeerIdentifier>>,
    }

    impl DiscoveryListener for Recorder {
        fn on_root_device_added(&self, device: &DiscoveredDevice) {
            self.added.lock().push(device.udn.clone());
        }

        fn on_device_removed(&self, udn: &PeerIdentifier) {
            self.removed.lock().push(udn.clone());
        }
    }

    fn alive(location: &str, server: &str) -> SsdpEvent {
        SsdpEvent::Alive {
            usn: format!("uuid:{}::upnp:rootdevice", UDN),
            nt: "upnp:rootdevice".to_string(),
            location: location.to_string(),
            server: server.to_string(),
            max_age: 1800,
            from: "127.0.0.1:1900".parse().unwrap(),
        }
    }

    fn byebye() -> SsdpEvent {
        SsdpEvent::ByeBye {
            usn: format!("uuid:{}::upnp:rootdevice", UDN),
            nt: "upnp:rootdevice".to_string(),
            from: "127.0.0.1:1900".parse().unwrap(),
        }
    }

    #[test]
    fn test_copies_from_other_sockets_are_dropped() {
        let mut filter = DuplicateFilter::new(DUPLICATE_WINDOW);
        let from: SocketAddr = "192.168.1.20:1900".parse().unwrap();
        let notify = |from: SocketAddr, nts: &str| Datagram {
            from,
            payload: format!("NOTIFY * HTTP/1.1\r\nNTS: {}\r\n\r\n", nts),
        };
        let start = Instant::now();

        // Même datagramme reçu par trois sockets liés à 0.0.0.0:1900
        assert!(!filter.is_duplicate(&notify(from, "ssdp:alive"), start));
        assert!(filter.is_duplicate(&notify(from, "ssdp:alive"), start));
        assert!(filter.is_duplicate(
            &notify(from, "ssdp:alive"),
            start + Duration::from_millis(5)
        ));

        // Autre contenu ou autre émetteur : pas un doublon
        assert!(!filter.is_duplicate(&notify(from, "ssdp:byebye"), start));
        let other: SocketAddr = "192.168.1.21:1900".parse().unwrap();
        assert!(!filter.is_duplicate(&notify(other, "ssdp:alive"), start));

        // Une réannonce périodique passe après la fenêtre
        assert!(!filter.is_duplicate(
            &notify(from, "ssdp:alive"),
            start + DUPLICATE_WINDOW + Duration::from_millis(1)
        ));
        assert_eq!(filter.seen.len(), 1);
    }

    #[test]
    fn test_alive_fetches_description_once() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/rootDesc.xml")
            .with_status(200)
            .with_header("content-type", "text/xml")
            .with_body(description_xml())
            .expect(1)
            .create();
        let location = format!("{}/rootDesc.xml", server.url());

        let tracker = SsdpNetworkTracker::new(TrackerSettings::default());
        let recorder = Arc::new(Recorder::default());
        tracker.inner.add_listener(recorder.clone());

        tracker.inner.handle_event(alive(&location, "Linux UPnP/1.0 MiniDLNA/1.3"));
        tracker.inner.handle_event(alive(&location, "Linux UPnP/1.0 MiniDLNA/1.3"));

        mock.assert();
        assert_eq!(recorder.added.lock().len(), 2);
        let known = tracker.known_devices();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].friendly_name, "MiniDLNA");
        assert!(known[0].advertises("urn:upnp-org:serviceId:ContentDirectory"));
    }

    #[test]
    fn test_non_device_announcements_are_ignored() {
        let tracker = SsdpNetworkTracker::new(TrackerSettings::default());
        let recorder = Arc::new(Recorder::default());
        tracker.inner.add_listener(recorder.clone());

        tracker.inner.handle_event(SsdpEvent::Alive {
            usn: format!("uuid:{}::urn:schemas-upnp-org:service:ContentDirectory:1", UDN),
            nt: "urn:schemas-upnp-org:service:ContentDirectory:1".to_string(),
            location: "http://127.0.0.1:1/unused.xml".to_string(),
            server: String::new(),
            max_age: 1800,
            from: "127.0.0.1:1900".parse().unwrap(),
        });
        assert!(recorder.added.lock().is_empty());
        assert!(tracker.known_devices().is_empty());
    }

    #[test]
    fn test_byebye_removes_device_and_loses_session() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/rootDesc.xml")
            .with_body(description_xml())
            .create();
        let location = format!("{}/rootDesc.xml", server.url());

        let tracker = SsdpNetworkTracker::new(TrackerSettings::default());
        let recorder = Arc::new(Recorder::default());
        let id = tracker.inner.add_listener(recorder.clone());
        tracker.inner.handle_event(alive(&location, "Linux UPnP/1.0 MiniDLNA/1.3"));

        let device = tracker.known_devices().remove(0);
        let description = tracker
            .resolve_description(&device, Duration::from_secs(5))
            .unwrap();
        let session = tracker.open_session(&device, description).unwrap();
        assert!(session.find_service("urn:upnp-org:serviceId:ContentDirectory").is_some());

        let lost = Arc::new(AtomicUsize::new(0));
        let counter = lost.clone();
        session.set_disconnect_handler(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.inner.handle_event(byebye());
        tracker.inner.handle_event(byebye());

        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert!(!session.is_open());
        assert_eq!(recorder.removed.lock().as_slice(), &[PeerIdentifier::new(UDN)]);
        assert!(tracker.known_devices().is_empty());

        // Traitant installé après la perte : appelé immédiatement
        let late = lost.clone();
        session.set_disconnect_handler(Box::new(move || {
            late.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(lost.load(Ordering::SeqCst), 2);

        tracker.unregister_listener(id);
        tracker.inner.handle_event(alive(&location, "Linux UPnP/1.0 MiniDLNA/1.3"));
        assert_eq!(recorder.added.lock().len(), 1);
    }

    #[test]
    fn test_unsupported_major_version_refuses_session() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/rootDesc.xml")
            .with_body(description_xml())
            .create();
        let location = format!("{}/rootDesc.xml", server.url());

        let tracker = SsdpNetworkTracker::new(TrackerSettings::default());
        tracker.inner.handle_event(alive(&location, "Linux UPnP/2.0 Future/1"));
        let device = tracker.known_devices().remove(0);
        let description = tracker
            .resolve_description(&device, Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            tracker.open_session(&device, description),
            Err(DiscoveryError::Identifier(_))
        ));
    }

    #[test]
    fn test_closed_session_never_calls_handler() {
        let description = parse_description_for_test();
        let session = SsdpSession::new(description, None);
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        session.set_disconnect_handler(Box::new(move || flag.store(true, Ordering::SeqCst)));
        session.close();
        session.fire_disconnect();
        assert!(!called.load(Ordering::SeqCst));
    }

    fn parse_description_for_test() -> DeviceDescription {
        super::super::parse_description(description_xml().as_bytes(), "http://127.0.0.1/d.xml")
            .unwrap()
    }
}
