//! Découverte des devices UPnP
//!
//! Ce module définit le contrat entre la connexion au pair
//! ([`PeerConnection`](crate::PeerConnection)) et la couche de découverte :
//!
//! - [`DiscoveryListener`] : notifications « device racine ajouté » / « device retiré »
//! - [`DiscoveryFacility`] : inscription des écouteurs, description, ouverture de session
//! - [`Session`] : accès aux services d'un pair et notification de déconnexion
//!
//! [`SsdpNetworkTracker`] en est l'implémentation réseau.

mod description;
mod tracker;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use pmoupnp::PeerIdentifier;
use pmoutils::AddressFamily;

pub use description::{
    DeviceDescription, ServiceDescription, fetch_description, parse_description, resolve_url,
};
pub use tracker::{SsdpNetworkTracker, SsdpSession, TrackerSettings};

use crate::errors::DiscoveryError;

/// Emplacement auquel un device est joignable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLocation {
    pub host: IpAddr,
    pub description_url: String,
    pub family: AddressFamily,
}

impl DeviceLocation {
    pub fn new(host: IpAddr, description_url: &str) -> Self {
        Self {
            host,
            description_url: description_url.to_string(),
            family: AddressFamily::of(&host),
        }
    }
}

/// Device racine annoncé sur le réseau.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub udn: PeerIdentifier,
    pub device_type: String,
    pub friendly_name: String,
    /// Identifiants des services annoncés par la description
    pub service_ids: Vec<String>,
    pub locations: Vec<DeviceLocation>,
    /// En-tête `SERVER` de l'annonce
    pub server_header: String,
}

impl DiscoveredDevice {
    pub fn from_description(
        description: &DeviceDescription,
        location: DeviceLocation,
        server_header: &str,
    ) -> Self {
        Self {
            udn: description.udn.clone(),
            device_type: description.device_type.clone(),
            friendly_name: description.friendly_name.clone(),
            service_ids: description.service_ids(),
            locations: vec![location],
            server_header: server_header.to_string(),
        }
    }

    pub fn advertises(&self, service_id: &str) -> bool {
        self.service_ids
            .iter()
            .any(|id| id.eq_ignore_ascii_case(service_id))
    }

    /// Emplacement à utiliser en priorité : IPv4 d'abord, puis ordre d'annonce.
    pub fn preferred_location(&self) -> Option<&DeviceLocation> {
        self.locations
            .iter()
            .find(|l| l.family == AddressFamily::Ipv4)
            .or_else(|| self.locations.first())
    }

    /// Ajoute un emplacement s'il n'est pas déjà connu.
    pub fn add_location(&mut self, location: DeviceLocation) -> bool {
        if self.locations.contains(&location) {
            false
        } else {
            self.locations.push(location);
            true
        }
    }
}

/// Observateur des annonces de devices.
///
/// Les méthodes sont appelées depuis un thread de la couche de découverte ;
/// elles doivent rendre la main rapidement.
pub trait DiscoveryListener: Send + Sync {
    fn on_root_device_added(&self, device: &DiscoveredDevice);
    fn on_device_removed(&self, udn: &PeerIdentifier);
}

/// Jeton d'inscription d'un [`DiscoveryListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Fonction appelée au plus une fois quand une session est perdue
pub type DisconnectHandler = Box<dyn FnOnce() + Send + 'static>;

/// Session ouverte avec un pair.
pub trait Session: Send + Sync {
    fn peer_id(&self) -> &PeerIdentifier;

    fn description(&self) -> &DeviceDescription;

    fn find_service(&self, service_id: &str) -> Option<ServiceDescription> {
        self.description().find_service(service_id).cloned()
    }

    /// Installe le traitant de déconnexion ; il est appelé immédiatement si
    /// la session est déjà perdue.
    fn set_disconnect_handler(&self, handler: DisconnectHandler);

    fn is_open(&self) -> bool;

    /// Ferme la session sans appeler le traitant de déconnexion.
    fn close(&self);
}

/// Couche de découverte utilisée par [`PeerConnection`](crate::PeerConnection)
/// et [`PeerWatcher`](crate::PeerWatcher).
pub trait DiscoveryFacility: Send + Sync {
    /// Inscrit un écouteur ; seule l'impossibilité d'ouvrir les sockets de
    /// découverte est une erreur.
    fn register_listener(
        &self,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Result<ListenerId, DiscoveryError>;

    fn unregister_listener(&self, id: ListenerId);

    /// Devices racine actuellement connus
    fn known_devices(&self) -> Vec<DiscoveredDevice>;

    /// Récupère la description à jour d'un device.
    fn resolve_description(
        &self,
        device: &DiscoveredDevice,
        timeout: Duration,
    ) -> Result<DeviceDescription, DiscoveryError>;

    /// Ouvre une session avec un device dont la description a été résolue.
    fn open_session(
        &self,
        device: &DiscoveredDevice,
        description: DeviceDescription,
    ) -> Result<Arc<dyn Session>, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DiscoveredDevice {
        DiscoveredDevice {
            udn: PeerIdentifier::new("abc"),
            device_type: "urn:schemas-upnp-org:device:MediaServer:1".into(),
            friendly_name: "Test".into(),
            service_ids: vec!["urn:upnp-org:serviceId:ContentDirectory".into()],
            locations: vec![DeviceLocation::new(
                "fe80::1".parse().unwrap(),
                "http://[fe80::1]:8200/desc.xml",
            )],
            server_header: "Linux UPnP/1.0 Test/1".into(),
        }
    }

    #[test]
    fn test_preferred_location_favours_ipv4() {
        let mut device = device();
        assert_eq!(device.preferred_location().unwrap().family, AddressFamily::Ipv6);

        let v4 = DeviceLocation::new("192.168.1.20".parse().unwrap(), "http://192.168.1.20/d.xml");
        assert!(device.add_location(v4.clone()));
        assert!(!device.add_location(v4));
        assert_eq!(device.locations.len(), 2);
        assert_eq!(device.preferred_location().unwrap().family, AddressFamily::Ipv4);
    }

    #[test]
    fn test_advertises_ignores_case() {
        assert!(device().advertises("URN:UPNP-ORG:SERVICEID:CONTENTDIRECTORY"));
        assert!(!device().advertises("urn:upnp-org:serviceId:ConnectionManager"));
    }
}
