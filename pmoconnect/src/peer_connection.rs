//! Connexion au pair désigné
//!
//! Une [`PeerConnection`] surveille les annonces de la couche de découverte,
//! se connecte au pair dont l'identifiant est la cible, lie ses services
//! requis en proxies typés et notifie ses observateurs.
//!
//! ```text
//! Idle ──start──▶ Watching ──cible annoncée──▶ Connecting ──succès──▶ Connected
//!                    ▲                              │                    │
//!                    └────────── échec ─────────────┘                    │
//!                    └────────────────── déconnexion ────────────────────┘
//! stop : tout état ──▶ Idle
//! ```
//!
//! Le verrou d'état ne protège que les décisions de transition. Le handshake
//! (description, contrôle du type, session, liaison des services) tourne sur
//! un thread dédié sans verrou, puis valide ou abandonne sa tentative.
//!
//! Une déconnexion qui survient pendant une tentative l'annule : la tentative
//! en cours est abandonnée à sa fin, ses proxies invalidés et sa session
//! fermée, et la connexion revient en surveillance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Mutex, ReentrantMutex};
use pmoconfig::Config;
use pmoupnp::PeerIdentifier;
use pmoupnp::identifiers::parse_type_version_urn;
use tracing::{debug, info, trace, warn};

use crate::config_ext::{PeerConfigExt, PeerSettings};
use crate::discovery::{
    DiscoveredDevice, DiscoveryFacility, DiscoveryListener, ListenerId, Session,
};
use crate::errors::PeerConnectionError;
use crate::proxy::{ConnectionManagerProxy, ContentDirectoryProxy, ServiceProxy};

const CONTENT_DIRECTORY_ID: &str = "urn:upnp-org:serviceId:ContentDirectory";
const CONNECTION_MANAGER_ID: &str = "urn:upnp-org:serviceId:ConnectionManager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Idle,
    Watching,
    Connecting,
    Connected,
}

/// Observateur des connexions et déconnexions.
///
/// Chaque notification est émise au plus une fois par transition, sur un
/// thread quelconque. Un observateur peut appeler les proxies ou
/// [`PeerConnection::stop`] depuis la notification.
pub trait PeerConnectionObserver: Send + Sync {
    fn on_connected(&self, session: &Arc<dyn Session>);
    fn on_disconnected(&self, session: &Arc<dyn Session>);
}

/// Proxies liés pendant une connexion, indexés par identifiant de service.
#[derive(Debug, Clone)]
pub struct ServiceBindings {
    proxies: HashMap<String, ServiceProxy>,
    valid: Arc<AtomicBool>,
}

impl ServiceBindings {
    pub fn get(&self, service_id: &str) -> Option<&ServiceProxy> {
        self.proxies.get(&service_id.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

struct Active {
    session: Arc<dyn Session>,
    bindings: ServiceBindings,
}

struct State {
    phase: PeerConnectionState,
    target: Option<PeerIdentifier>,
    /// Incrémenté à chaque start et stop
    epoch: u64,
    /// Incrémenté à chaque tentative et à chaque annulation
    attempt: u64,
    listener: Option<ListenerId>,
    active: Option<Active>,
}

struct Inner {
    facility: Arc<dyn DiscoveryFacility>,
    settings: PeerSettings,
    /// Configuration où mémoriser le dernier pair connecté
    record: Option<Arc<Config>>,
    state: Mutex<State>,
    notifications: ReentrantMutex<()>,
    observers: Mutex<Vec<Arc<dyn PeerConnectionObserver>>>,
    self_ref: Weak<Inner>,
}

/// Écouteur inscrit auprès de la couche de découverte
struct ConnectionListener(Weak<Inner>);

impl DiscoveryListener for ConnectionListener {
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

/// Connexion à un pair désigné par son identifiant.
pub struct PeerConnection {
    inner: Arc<Inner>,
}

impl PeerConnection {
    pub fn new(facility: Arc<dyn DiscoveryFacility>, settings: PeerSettings) -> Self {
        Self::build(facility, settings, None)
    }

    /// Réglages lus dans la section `peer` ; chaque connexion réussie y
    /// mémorise le pair (`last_udn`, `last_name`).
    pub fn from_config(facility: Arc<dyn DiscoveryFacility>, config: Arc<Config>) -> Self {
        let settings = config.peer_settings();
        Self::build(facility, settings, Some(config))
    }

    fn build(
        facility: Arc<dyn DiscoveryFacility>,
        settings: PeerSettings,
        record: Option<Arc<Config>>,
    ) -> Self {
        let target = settings.target();
        let inner = Arc::new_cyclic(|self_ref| Inner {
            facility,
            settings,
            record,
            state: Mutex::new(State {
                phase: PeerConnectionState::Idle,
                target,
                epoch: 0,
                attempt: 0,
                listener: None,
                active: None,
            }),
            notifications: ReentrantMutex::new(()),
            observers: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    pub fn settings(&self) -> &PeerSettings {
        &self.inner.settings
    }

    pub fn add_observer(&self, observer: Arc<dyn PeerConnectionObserver>) {
        self.inner.observers.lock().push(observer);
    }

    pub fn state(&self) -> PeerConnectionState {
        self.inner.state.lock().phase
    }

    pub fn target_identifier(&self) -> Option<PeerIdentifier> {
        self.inner.state.lock().target.clone()
    }

    /// Change le pair cible.
    ///
    /// Autorisé avant [`start`](Self::start). Une connexion (ou tentative) à
    /// l'ancienne cible est interrompue et la surveillance reprend pour la
    /// nouvelle.
    pub fn set_target_identifier(&self, target: Option<PeerIdentifier>) {
        let (lost, watching) = {
            let mut state = self.inner.state.lock();
            if state.target == target {
                return;
            }
            state.target = target.clone();
            let lost = Inner::drop_connection(&mut state);
            (lost, state.phase == PeerConnectionState::Watching)
        };

        match &target {
            Some(id) => info!(udn = %id, "Peer target set"),
            None => info!("Peer target cleared"),
        }
        if let Some(active) = lost {
            self.inner.finish_disconnect(active);
        }
        if watching {
            self.inner.check_known_devices();
        }
    }

    /// Commence la surveillance. Sans effet si elle est déjà commencée.
    ///
    /// Seule l'impossibilité de s'inscrire auprès de la couche de découverte
    /// (sockets indisponibles) est une erreur.
    pub fn start(&self) -> Result<(), PeerConnectionError> {
        let epoch = {
            let mut state = self.inner.state.lock();
            if state.phase != PeerConnectionState::Idle {
                return Ok(());
            }
            state.phase = PeerConnectionState::Watching;
            state.epoch += 1;
            state.epoch
        };

        let listener: Arc<dyn DiscoveryListener> =
            Arc::new(ConnectionListener(Arc::downgrade(&self.inner)));
        let id = match self.inner.facility.register_listener(listener) {
            Ok(id) => id,
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.epoch == epoch {
                    state.phase = PeerConnectionState::Idle;
                }
                return Err(PeerConnectionError::Registration(e));
            }
        };

        {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                // Arrêté entre-temps
                drop(state);
                self.inner.facility.unregister_listener(id);
                return Ok(());
            }
            state.listener = Some(id);
            match &state.target {
                Some(target) => info!(udn = %target, "Watching for peer"),
                None => info!("Watching without target"),
            }
        }

        self.inner.check_known_devices();
        Ok(())
    }

    /// Arrête la surveillance et ferme la connexion. Sans effet si elle est
    /// déjà arrêtée.
    ///
    /// Au retour, aucune notification n'est plus émise ; l'appel est possible
    /// depuis un observateur.
    pub fn stop(&self) {
        let (listener, lost) = {
            let mut state = self.inner.state.lock();
            if state.phase == PeerConnectionState::Idle {
                return;
            }
            let lost = Inner::drop_connection(&mut state);
            state.phase = PeerConnectionState::Idle;
            state.epoch += 1;
            (state.listener.take(), lost)
        };

        if let Some(id) = listener {
            self.inner.facility.unregister_listener(id);
        }

        // Attend la fin d'une notification en cours sur un autre thread
        let _notifying = self.inner.notifications.lock();
        if let Some(active) = lost {
            self.inner.finish_disconnect(active);
        }
        info!("Peer connection stopped");
    }

    /// Session courante, seulement à l'état `Connected`
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        let state = self.inner.state.lock();
        match (&state.phase, &state.active) {
            (PeerConnectionState::Connected, Some(active)) => Some(active.session.clone()),
            _ => None,
        }
    }

    /// Proxy d'un service requis, seulement à l'état `Connected`
    pub fn service(&self, service_id: &str) -> Option<ServiceProxy> {
        let state = self.inner.state.lock();
        match (&state.phase, &state.active) {
            (PeerConnectionState::Connected, Some(active)) => {
                active.bindings.get(service_id).cloned()
            }
            _ => None,
        }
    }

    pub fn content_directory(&self) -> Option<ContentDirectoryProxy> {
        self.service(CONTENT_DIRECTORY_ID)
            .map(ContentDirectoryProxy::new)
    }

    pub fn connection_manager(&self) -> Option<ConnectionManagerProxy> {
        self.service(CONNECTION_MANAGER_ID)
            .map(ConnectionManagerProxy::new)
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn observers(&self) -> Vec<Arc<dyn PeerConnectionObserver>> {
        self.observers.lock().clone()
    }

    /// Annule la connexion ou la tentative en cours, sous le verrou d'état.
    fn drop_connection(state: &mut State) -> Option<Active> {
        match state.phase {
            PeerConnectionState::Connecting | PeerConnectionState::Connected => {
                state.attempt += 1;
                state.phase = PeerConnectionState::Watching;
                let active = state.active.take();
                if let Some(active) = &active {
                    active.bindings.invalidate();
                }
                active
            }
            _ => None,
        }
    }

    fn finish_disconnect(&self, active: Active) {
        let _notifying = self.notifications.lock();
        info!(udn = %active.session.peer_id(), "Peer disconnected");
        for observer in self.observers() {
            observer.on_disconnected(&active.session);
        }
        active.session.close();
    }

    fn check_known_devices(&self) {
        let Some(target) = self.state.lock().target.clone() else {
            return;
        };
        if let Some(device) = self
            .facility
            .known_devices()
            .into_iter()
            .find(|device| device.udn == target)
        {
            self.device_added(&device);
        }
    }

    fn device_added(&self, device: &DiscoveredDevice) {
        let attempt = {
            let mut state = self.state.lock();
            if state.target.as_ref() != Some(&device.udn) {
                trace!(udn = %device.udn, "Not the target, ignored");
                return;
            }
            if state.phase != PeerConnectionState::Watching {
                trace!(udn = %device.udn, state = ?state.phase, "Target announced, nothing to do");
                return;
            }
            state.phase = PeerConnectionState::Connecting;
            state.attempt += 1;
            state.attempt
        };

        info!(udn = %device.udn, "Target discovered, connecting");
        let weak = self.self_ref.clone();
        let device = device.clone();
        let spawned = thread::Builder::new()
            .name("pmoconnect-handshake".into())
            .spawn(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.run_handshake(attempt, device);
                }
            });
        if let Err(e) = spawned {
            let error = PeerConnectionError::Spawn(e);
            warn!(step = error.step(), "Connection attempt failed: {}", error);
            self.abandon_attempt(attempt);
        }
    }

    fn device_removed(&self, udn: &PeerIdentifier) {
        let lost = {
            let mut state = self.state.lock();
            if state.target.as_ref() != Some(udn) {
                return;
            }
            Self::drop_connection(&mut state)
        };
        debug!(udn = %udn, "Target left the network");
        if let Some(active) = lost {
            self.finish_disconnect(active);
        }
    }

    fn session_lost(&self, attempt: u64) {
        let lost = {
            let mut state = self.state.lock();
            if state.attempt != attempt {
                return;
            }
            Self::drop_connection(&mut state)
        };
        if let Some(active) = lost {
            self.finish_disconnect(active);
        }
    }

    fn abandon_attempt(&self, attempt: u64) {
        let mut state = self.state.lock();
        if state.attempt == attempt && state.phase == PeerConnectionState::Connecting {
            state.phase = PeerConnectionState::Watching;
        }
    }

    fn run_handshake(&self, attempt: u64, device: DiscoveredDevice) {
        match self.handshake(attempt, &device) {
            Ok(active) => self.commit(attempt, active),
            Err(e) => {
                warn!(udn = %device.udn, step = e.step(), "Connection attempt failed: {}", e);
                self.abandon_attempt(attempt);
            }
        }
    }

    fn handshake(&self, attempt: u64, device: &DiscoveredDevice) -> Result<Active, PeerConnectionError> {
        let udn = device.udn.to_string();
        let timeout = self.settings.handshake_timeout();

        let description = self
            .facility
            .resolve_description(device, timeout)
            .map_err(|source| PeerConnectionError::Description {
                udn: udn.clone(),
                source,
            })?;
        self.check_device_type(&udn, &description.device_type)?;

        let session = self
            .facility
            .open_session(device, description)
            .map_err(|source| PeerConnectionError::Session {
                udn: udn.clone(),
                source,
            })?;

        let weak = self.self_ref.clone();
        session.set_disconnect_handler(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.session_lost(attempt);
            }
        }));

        match self.bind_services(&udn, session.as_ref()) {
            Ok(bindings) => Ok(Active { session, bindings }),
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    fn check_device_type(&self, udn: &str, device_type: &str) -> Result<(), PeerConnectionError> {
        let expected = self
            .settings
            .device_type
            .strip_prefix("urn:")
            .unwrap_or(self.settings.device_type.as_str());
        let wrong = || PeerConnectionError::WrongDeviceType {
            udn: udn.to_string(),
            found: device_type.to_string(),
            expected: expected.to_string(),
            min_version: self.settings.min_device_version,
        };

        let (kind, version) = parse_type_version_urn(device_type).map_err(|_| wrong())?;
        if !kind.eq_ignore_ascii_case(expected) || version < self.settings.min_device_version {
            return Err(wrong());
        }
        Ok(())
    }

    /// Lie tous les services requis, ou aucun.
    fn bind_services(
        &self,
        udn: &str,
        session: &dyn Session,
    ) -> Result<ServiceBindings, PeerConnectionError> {
        let valid = Arc::new(AtomicBool::new(true));
        let timeout = self.settings.handshake_timeout();
        let mut proxies = HashMap::with_capacity(self.settings.required_services.len());

        for service_id in &self.settings.required_services {
            match session.find_service(service_id) {
                Some(service) => {
                    debug!(udn = %udn, service = %service_id, url = %service.control_url, "Service bound");
                    proxies.insert(
                        service_id.to_ascii_lowercase(),
                        ServiceProxy::new(service, valid.clone(), timeout),
                    );
                }
                None => {
                    valid.store(false, Ordering::SeqCst);
                    return Err(PeerConnectionError::MissingService {
                        udn: udn.to_string(),
                        service_id: service_id.clone(),
                    });
                }
            }
        }

        Ok(ServiceBindings { proxies, valid })
    }

    fn commit(&self, attempt: u64, active: Active) {
        let _notifying = self.notifications.lock();
        let session = {
            let mut state = self.state.lock();
            if state.attempt != attempt || state.phase != PeerConnectionState::Connecting {
                drop(state);
                debug!(udn = %active.session.peer_id(), "Connection attempt cancelled, rolling back");
                active.bindings.invalidate();
                active.session.close();
                return;
            }
            let session = active.session.clone();
            state.active = Some(active);
            state.phase = PeerConnectionState::Connected;
            session
        };

        info!(udn = %session.peer_id(), "✅ Connected to peer");
        if let Some(config) = &self.record {
            let name = &session.description().friendly_name;
            if let Err(e) = config.set_last_peer(session.peer_id(), name) {
                warn!(udn = %session.peer_id(), "Cannot record last peer: {}", e);
            }
        }
        for observer in self.observers() {
            observer.on_connected(&session);
        }
    }
}
