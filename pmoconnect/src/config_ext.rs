//! Extension pour intégrer les réglages du pair désigné dans pmoconfig
//!
//! Ce module fournit le trait `PeerConfigExt` qui ajoute à `pmoconfig::Config`
//! la section `peer`, et [`PeerSettings`], sa forme désérialisée utilisée par
//! [`PeerConnection`](crate::PeerConnection).

use std::time::Duration;

use anyhow::Result;
use pmoconfig::Config;
use pmoupnp::PeerIdentifier;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_DEVICE_TYPE: &str = "schemas-upnp-org:device:MediaServer";
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Identifiants des services requis par défaut
pub const DEFAULT_REQUIRED_SERVICES: &[&str] = &[
    "urn:upnp-org:serviceId:ContentDirectory",
    "urn:upnp-org:serviceId:ConnectionManager",
];

/// Réglages d'une [`PeerConnection`](crate::PeerConnection)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// UDN du pair désigné, vide pour ne rien cibler
    pub target_udn: String,
    /// Type de device attendu, sans version
    pub device_type: String,
    pub min_device_version: u32,
    pub handshake_timeout_secs: u64,
    pub required_services: Vec<String>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            target_udn: String::new(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            min_device_version: 1,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            required_services: DEFAULT_REQUIRED_SERVICES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PeerSettings {
    pub fn target(&self) -> Option<PeerIdentifier> {
        let id = PeerIdentifier::new(&self.target_udn);
        (!id.is_empty()).then_some(id)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}

/// Trait d'extension pour la section `peer`
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmoconnect::PeerConfigExt;
///
/// let config = get_config();
/// config.set_target_udn(Some(&"uuid:4d696e69-444c-164e-9d41-b827eb0f0a6b".parse()?))?;
/// let settings = config.peer_settings();
/// ```
pub trait PeerConfigExt {
    fn get_target_udn(&self) -> Option<PeerIdentifier>;

    /// Désigne le pair cible (`None` efface la cible)
    fn set_target_udn(&self, target: Option<&PeerIdentifier>) -> Result<()>;

    fn get_device_type(&self) -> String;

    fn get_min_device_version(&self) -> u32;

    fn get_required_services(&self) -> Vec<String>;

    fn get_handshake_timeout(&self) -> Duration;

    fn set_handshake_timeout(&self, timeout: Duration) -> Result<()>;

    /// Dernier pair auquel une connexion a abouti
    fn get_last_peer_udn(&self) -> Option<PeerIdentifier>;

    fn get_last_peer_name(&self) -> Option<String>;

    /// Mémorise le pair connecté et son nom d'affichage
    fn set_last_peer(&self, udn: &PeerIdentifier, friendly_name: &str) -> Result<()>;

    /// Section `peer` complète, valeurs par défaut pour les clés absentes
    fn peer_settings(&self) -> PeerSettings;
}

impl PeerConfigExt for Config {
    fn get_target_udn(&self) -> Option<PeerIdentifier> {
        self.get_string(&["peer", "target_udn"])
            .map(|udn| PeerIdentifier::new(&udn))
            .filter(|id| !id.is_empty())
    }

    fn set_target_udn(&self, target: Option<&PeerIdentifier>) -> Result<()> {
        let value = target.map(PeerIdentifier::to_udn).unwrap_or_default();
        self.set_string(&["peer", "target_udn"], &value)
    }

    fn get_device_type(&self) -> String {
        self.get_string(&["peer", "device_type"])
            .unwrap_or_else(|| DEFAULT_DEVICE_TYPE.to_string())
    }

    fn get_min_device_version(&self) -> u32 {
        let version = self.get_u64(&["peer", "min_device_version"], 1);
        u32::try_from(version).unwrap_or(u32::MAX)
    }

    fn get_required_services(&self) -> Vec<String> {
        let services = self.get_string_list(&["peer", "required_services"]);
        if services.is_empty() {
            DEFAULT_REQUIRED_SERVICES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            services
        }
    }

    fn get_handshake_timeout(&self) -> Duration {
        let secs = self.get_u64(
            &["peer", "handshake_timeout_secs"],
            DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        );
        Duration::from_secs(secs.max(1))
    }

    fn set_handshake_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_u64(&["peer", "handshake_timeout_secs"], timeout.as_secs().max(1))
    }

    fn get_last_peer_udn(&self) -> Option<PeerIdentifier> {
        self.get_string(&["peer", "last_udn"])
            .map(|udn| PeerIdentifier::new(&udn))
            .filter(|id| !id.is_empty())
    }

    fn get_last_peer_name(&self) -> Option<String> {
        self.get_string(&["peer", "last_name"])
            .filter(|name| !name.is_empty())
    }

    fn set_last_peer(&self, udn: &PeerIdentifier, friendly_name: &str) -> Result<()> {
        self.set_string(&["peer", "last_udn"], &udn.to_udn())?;
        self.set_string(&["peer", "last_name"], friendly_name)
    }

    fn peer_settings(&self) -> PeerSettings {
        match self.get_section::<PeerSettings>(&["peer"]) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Invalid peer section, using defaults: {}", e);
                PeerSettings::default()
            }
        }
    }
}
