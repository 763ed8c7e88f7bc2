use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use pmoconnect::discovery::DisconnectHandler;
use pmoconfig::Config;
use pmoconnect::{
    DeviceDescription, DiscoveredDevice, DiscoveryError, DiscoveryFacility, DiscoveryListener,
    ListenerId, PeerConfigExt, PeerConnection, PeerConnectionError, PeerConnectionObserver, PeerConnectionState,
    PeerSettings, ProxyError, ServiceDescription, Session,
};
use pmoupnp::PeerIdentifier;
use pmoupnp::soap::build_soap_response;

const MEDIA_SERVER: &str = "urn:schemas-upnp-org:device:MediaServer:1";
const CD_TYPE: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";
const CM_TYPE: &str = "urn:schemas-upnp-org:service:ConnectionManager:1";
const WAIT: Duration = Duration::from_secs(5);

struct FakeSession {
    description: DeviceDescription,
    lost: AtomicBool,
    closed: AtomicBool,
    handler: Mutex<Option<DisconnectHandler>>,
}

impl FakeSession {
    fn lose(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            if let Some(handler) = self.handler.lock().take() {
                handler();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Session for FakeSession {
    fn peer_id(&self) -> &PeerIdentifier {
        &self.description.udn
    }

    fn description(&self) -> &DeviceDescription {
        &self.description
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        if self.lost.load(Ordering::SeqCst) {
            handler();
        } else {
            *self.handler.lock() = Some(handler);
        }
    }

    fn is_open(&self) -> bool {
        !self.lost.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.handler.lock().take();
    }
}

#[derive(Default)]
struct FakeFacility {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn DiscoveryListener>)>>,
    next_id: AtomicU64,
    refuse_registration: bool,
    known: Mutex<Vec<DiscoveredDevice>>,
    descriptions: Mutex<HashMap<PeerIdentifier, DeviceDescription>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    /// Bloque chaque résolution de description jusqu'à un jeton
    gate: Option<Receiver<()>>,
    resolving: AtomicUsize,
}

impl FakeFacility {
    fn add_peer(&self, description: DeviceDescription) -> DiscoveredDevice {
        let device = DiscoveredDevice {
            udn: description.udn.clone(),
            device_type: description.device_type.clone(),
            friendly_name: description.friendly_name.clone(),
            service_ids: description.service_ids(),
            locations: Vec::new(),
            server_header: "Linux UPnP/1.0 test/1".to_string(),
        };
        self.descriptions
            .lock()
            .insert(description.udn.clone(), description);
        self.known.lock().push(device.clone());
        device
    }

    fn announce(&self, device: &DiscoveredDevice) {
        let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_root_device_added(device);
        }
    }

    fn remove(&self, udn: &PeerIdentifier) {
        self.known.lock().retain(|d| &d.udn != udn);
        let listeners: Vec<_> = self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_device_removed(udn);
        }
    }

    fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn resolving(&self) -> usize {
        self.resolving.load(Ordering::SeqCst)
    }
}

impl DiscoveryFacility for FakeFacility {
    fn register_listener(
        &self,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<ListenerId, DiscoveryError> {
        if self.refuse_registration {
            return Err(DiscoveryError::NoLocalAddress);
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((id, listener));
        Ok(id)
    }

    fn unregister_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(known, _)| *known != id);
    }

    fn known_devices(&self) -> Vec<DiscoveredDevice> {
        self.known.lock().clone()
    }

    fn resolve_description(
        &self,
        device: &DiscoveredDevice,
        _timeout: Duration,
    ) -> Result<DeviceDescription, DiscoveryError> {
        self.resolving.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _ = gate.recv_timeout(WAIT);
        }
        self.descriptions
            .lock()
            .get(&device.udn)
            .cloned()
            .ok_or_else(|| DiscoveryError::NoLocation(device.udn.to_string()))
    }

    fn open_session(
        &self,
        _device: &DiscoveredDevice,
        description: DeviceDescription,
    ) -> Result<Arc<dyn Session>, DiscoveryError> {
        let session = Arc::new(FakeSession {
            description,
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handler: Mutex::new(None),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Notification {
    Connected(PeerIdentifier),
    Disconnected(PeerIdentifier),
}

struct Recorder(Sender<Notification>);

impl PeerConnectionObserver for Recorder {
    fn on_connected(&self, session: &Arc<dyn Session>) {
        let _ = self.0.send(Notification::Connected(session.peer_id().clone()));
    }

    fn on_disconnected(&self, session: &Arc<dyn Session>) {
        let _ = self
            .0
            .send(Notification::Disconnected(session.peer_id().clone()));
    }
}

/// Arrête la connexion dès qu'elle est établie
struct StopOnConnect {
    connection: Mutex<Weak<PeerConnection>>,
    events: Sender<Notification>,
}

impl PeerConnectionObserver for StopOnConnect {
    fn on_connected(&self, session: &Arc<dyn Session>) {
        let _ = self
            .events
            .send(Notification::Connected(session.peer_id().clone()));
        if let Some(connection) = self.connection.lock().upgrade() {
            connection.stop();
        }
    }

    fn on_disconnected(&self, session: &Arc<dyn Session>) {
        let _ = self
            .events
            .send(Notification::Disconnected(session.peer_id().clone()));
    }
}

fn service(kind: &str, id: &str, control_url: &str) -> ServiceDescription {
    ServiceDescription {
        service_type: kind.to_string(),
        service_id: format!("urn:upnp-org:serviceId:{}", id),
        control_url: control_url.to_string(),
        event_sub_url: String::new(),
    }
}

fn media_server(udn: &str, control_base: &str) -> DeviceDescription {
    DeviceDescription {
        udn: PeerIdentifier::new(udn),
        device_type: MEDIA_SERVER.to_string(),
        friendly_name: format!("Server {}", udn),
        location: format!("{}/description.xml", control_base),
        services: vec![
            service(
                CD_TYPE,
                "ContentDirectory",
                &format!("{}/ctl/ContentDir", control_base),
            ),
            service(
                CM_TYPE,
                "ConnectionManager",
                &format!("{}/ctl/ConnectionMgr", control_base),
            ),
        ],
    }
}

fn connection(
    facility: &Arc<FakeFacility>,
    target: &str,
) -> (PeerConnection, Receiver<Notification>) {
    let connection = PeerConnection::new(
        facility.clone(),
        PeerSettings {
            target_udn: target.to_string(),
            handshake_timeout_secs: 2,
            ..PeerSettings::default()
        },
    );
    let (tx, rx) = unbounded();
    connection.add_observer(Arc::new(Recorder(tx)));
    (connection, rx)
}

/// Facility dont les handshakes attendent un jeton sur `release`
fn gated_facility() -> (Arc<FakeFacility>, Sender<()>) {
    let (release, gate) = unbounded();
    let facility = Arc::new(FakeFacility {
        gate: Some(gate),
        ..FakeFacility::default()
    });
    (facility, release)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn connects_only_to_target_and_invalidates_proxies_on_loss() {
    let mut server = mockito::Server::new();
    let update = build_soap_response(CD_TYPE, "GetSystemUpdateID", &[("Id", Some("3"))]).unwrap();
    let mock = server
        .mock("POST", "/ctl/ContentDir")
        .with_body(update)
        .expect(1)
        .create();

    let facility = Arc::new(FakeFacility::default());
    let other = facility.add_peer(media_server("uuid:other", "http://127.0.0.1:9"));
    let target = facility.add_peer(media_server("uuid:target", &server.url()));
    facility.known.lock().clear();

    let (connection, events) = connection(&facility, "uuid:target");
    connection.start().unwrap();
    assert_eq!(connection.state(), PeerConnectionState::Watching);

    facility.announce(&other);
    assert_eq!(connection.state(), PeerConnectionState::Watching);
    assert!(facility.sessions().is_empty());
    assert!(connection.content_directory().is_none());

    facility.announce(&target);
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(target.udn.clone())
    );
    assert_eq!(connection.state(), PeerConnectionState::Connected);
    assert_eq!(connection.session().unwrap().peer_id(), &target.udn);

    let directory = connection.content_directory().unwrap();
    assert!(connection.connection_manager().is_some());
    assert_eq!(directory.get_system_update_id().unwrap(), 3);
    mock.assert();

    // Une réannonce ne relance pas de connexion
    facility.announce(&target);
    assert_eq!(facility.sessions().len(), 1);

    facility.sessions()[0].lose();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Disconnected(target.udn.clone())
    );
    assert_eq!(connection.state(), PeerConnectionState::Watching);
    assert!(connection.content_directory().is_none());
    assert!(matches!(
        directory.get_system_update_id(),
        Err(ProxyError::NotConnected(_))
    ));

    // La cible réannoncée donne une nouvelle connexion
    facility.announce(&target);
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(target.udn.clone())
    );
    assert_eq!(facility.sessions().len(), 2);
}

#[test]
fn missing_service_leaves_nothing_bound() {
    let facility = Arc::new(FakeFacility::default());
    let mut description = media_server("uuid:target", "http://127.0.0.1:9");
    description.services.truncate(1);
    let target = facility.add_peer(description);
    facility.known.lock().clear();

    let (connection, events) = connection(&facility, "uuid:target");
    connection.start().unwrap();
    facility.announce(&target);

    wait_until(|| connection.state() == PeerConnectionState::Watching);
    let sessions = facility.sessions();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].is_closed());
    assert!(connection.content_directory().is_none());
    assert!(events.try_recv().is_err());
}

#[test]
fn wrong_device_type_is_refused() {
    let facility = Arc::new(FakeFacility::default());
    let mut description = media_server("uuid:target", "http://127.0.0.1:9");
    description.device_type = "urn:schemas-upnp-org:device:MediaRenderer:1".to_string();
    let target = facility.add_peer(description);
    facility.known.lock().clear();

    let (connection, events) = connection(&facility, "uuid:target");
    connection.start().unwrap();
    facility.announce(&target);

    wait_until(|| connection.state() == PeerConnectionState::Watching);
    assert!(facility.sessions().is_empty());
    assert!(events.try_recv().is_err());
}

#[test]
fn known_target_is_connected_on_start() {
    let facility = Arc::new(FakeFacility::default());
    let target = facility.add_peer(media_server("uuid:target", "http://127.0.0.1:9"));

    let (connection, events) = connection(&facility, "uuid:target");
    connection.start().unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(target.udn.clone())
    );

    facility.remove(&target.udn);
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Disconnected(target.udn.clone())
    );
    assert_eq!(connection.state(), PeerConnectionState::Watching);
    assert!(facility.sessions()[0].is_closed());
}

#[test]
fn start_and_stop_are_idempotent() {
    let facility = Arc::new(FakeFacility::default());
    let target = facility.add_peer(media_server("uuid:target", "http://127.0.0.1:9"));
    let (connection, events) = connection(&facility, "uuid:target");

    connection.stop();
    assert_eq!(connection.state(), PeerConnectionState::Idle);

    connection.start().unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(target.udn.clone())
    );
    connection.start().unwrap();
    assert_eq!(facility.listener_count(), 1);
    assert_eq!(facility.sessions().len(), 1);

    connection.stop();
    connection.stop();
    assert_eq!(connection.state(), PeerConnectionState::Idle);
    assert_eq!(facility.listener_count(), 0);
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Disconnected(target.udn.clone())
    );
    assert!(events.try_recv().is_err());

    // Plus aucune notification après l'arrêt
    facility.sessions()[0].lose();
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn stop_from_observer() {
    let facility = Arc::new(FakeFacility::default());
    let target = facility.add_peer(media_server("uuid:target", "http://127.0.0.1:9"));

    let connection = Arc::new(PeerConnection::new(
        facility.clone(),
        PeerSettings {
            target_udn: "uuid:target".to_string(),
            ..PeerSettings::default()
        },
    ));
    let (tx, events) = unbounded();
    connection.add_observer(Arc::new(StopOnConnect {
        connection: Mutex::new(Arc::downgrade(&connection)),
        events: tx,
    }));
    connection.start().unwrap();

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(target.udn.clone())
    );
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Disconnected(target.udn.clone())
    );
    assert_eq!(connection.state(), PeerConnectionState::Idle);
    assert!(facility.sessions()[0].is_closed());
}

#[test]
fn changing_target_reconnects() {
    let facility = Arc::new(FakeFacility::default());
    let first = facility.add_peer(media_server("uuid:first", "http://127.0.0.1:9"));
    let second = facility.add_peer(media_server("uuid:second", "http://127.0.0.1:9"));

    let (connection, events) = connection(&facility, "uuid:first");
    connection.start().unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(first.udn.clone())
    );

    connection.set_target_identifier(Some(second.udn.clone()));
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Disconnected(first.udn.clone())
    );
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(second.udn.clone())
    );
    assert_eq!(connection.target_identifier(), Some(second.udn.clone()));
}

#[test]
fn registration_failure_is_reported() {
    let facility = Arc::new(FakeFacility {
        refuse_registration: true,
        ..FakeFacility::default()
    });
    let (connection, _events) = connection(&facility, "uuid:target");

    let err = connection.start().unwrap_err();
    assert!(matches!(err, PeerConnectionError::Registration(_)));
    assert_eq!(connection.state(), PeerConnectionState::Idle);
}

#[test]
fn stop_during_handshake_rolls_back() {
    let (facility, release) = gated_facility();
    let target = facility.add_peer(media_server("uuid:target", "http://127.0.0.1:9"));
    facility.known.lock().clear();

    let (connection, events) = connection(&facility, "uuid:target");
    connection.start().unwrap();
    facility.announce(&target);
    wait_until(|| facility.resolving() == 1);
    assert_eq!(connection.state(), PeerConnectionState::Connecting);

    connection.stop();
    assert_eq!(connection.state(), PeerConnectionState::Idle);

    release.send(()).unwrap();
    wait_until(|| facility.sessions().iter().any(|s| s.is_closed()));
    assert_eq!(facility.sessions().len(), 1);
    assert_eq!(connection.state(), PeerConnectionState::Idle);
    assert!(connection.session().is_none());
    assert!(connection.content_directory().is_none());
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn removal_during_handshake_keeps_only_the_new_attempt() {
    let (facility, release) = gated_facility();
    let target = facility.add_peer(media_server("uuid:target", "http://127.0.0.1:9"));
    facility.known.lock().clear();

    let (connection, events) = connection(&facility, "uuid:target");
    connection.start().unwrap();
    facility.announce(&target);
    wait_until(|| facility.resolving() == 1);

    // Le pair part puis revient avant la fin du premier handshake
    facility.remove(&target.udn);
    assert_eq!(connection.state(), PeerConnectionState::Watching);
    facility.announce(&target);
    wait_until(|| facility.resolving() == 2);
    assert_eq!(connection.state(), PeerConnectionState::Connecting);

    release.send(()).unwrap();
    release.send(()).unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(target.udn.clone())
    );
    wait_until(|| facility.sessions().len() == 2 && facility.sessions().iter().any(|s| s.is_closed()));
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());

    let sessions = facility.sessions();
    let open: Vec<_> = sessions.iter().filter(|s| !s.is_closed()).collect();
    assert_eq!(open.len(), 1);
    assert_eq!(connection.state(), PeerConnectionState::Connected);
    assert_eq!(connection.session().unwrap().peer_id(), &target.udn);
    assert!(open[0].is_open());
    assert!(connection.content_directory().is_some());
}

#[test]
fn successful_connection_records_last_peer() {
    let facility = Arc::new(FakeFacility::default());
    let target = facility.add_peer(media_server("uuid:target", "http://127.0.0.1:9"));
    let config = Arc::new(
        Config::from_yaml_str("peer:\n  target_udn: \"uuid:target\"\n  handshake_timeout_secs: 2\n")
            .unwrap(),
    );
    assert_eq!(config.get_last_peer_udn(), None);

    let connection = PeerConnection::from_config(facility.clone(), config.clone());
    let (tx, events) = unbounded();
    connection.add_observer(Arc::new(Recorder(tx)));
    connection.start().unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Connected(target.udn.clone())
    );

    assert_eq!(config.get_last_peer_udn(), Some(target.udn.clone()));
    assert_eq!(config.get_last_peer_name().as_deref(), Some("Server uuid:target"));

    // Une tentative échouée n'efface pas le dernier pair
    connection.set_target_identifier(Some(PeerIdentifier::new("uuid:absent")));
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Notification::Disconnected(target.udn.clone())
    );
    assert_eq!(config.get_last_peer_udn(), Some(target.udn));
}
