//! Extension pour intégrer la configuration réseau UPnP dans pmoconfig
//!
//! Ce module fournit le trait `UpnpNetworkConfigExt` qui ajoute à
//! `pmoconfig::Config` les réglages des sections `network` et `upnp`.

use anyhow::Result;
use pmoconfig::Config;
use pmoutils::AddressFamily;

use crate::identifiers::VersionPolicy;

const DEFAULT_SEARCH_TARGET: &str = "upnp:rootdevice";

/// Trait d'extension pour la configuration réseau UPnP
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmoupnp::UpnpNetworkConfigExt;
///
/// let config = get_config();
/// let allowed = config.get_allowed_addresses();
/// let policy = config.get_version_policy();
/// ```
pub trait UpnpNetworkConfigExt {
    /// Liste blanche des adresses locales (vide = toutes)
    fn get_allowed_addresses(&self) -> Vec<String>;

    fn set_allowed_addresses(&self, addresses: &[String]) -> Result<()>;

    fn get_ipv4_enabled(&self) -> bool;

    fn set_ipv4_enabled(&self, enabled: bool) -> Result<()>;

    fn get_ipv6_enabled(&self) -> bool;

    fn set_ipv6_enabled(&self, enabled: bool) -> Result<()>;

    /// Familles d'adresses actives, IPv4 en premier
    fn enabled_families(&self) -> Vec<AddressFamily>;

    /// Traite les adresses IPv6 globales comme de portée site pour l'envoi
    fn get_site_local_operation(&self) -> bool;

    fn get_version_policy(&self) -> VersionPolicy;

    fn set_version_policy(&self, policy: VersionPolicy) -> Result<()>;

    /// Cibles des M-SEARCH envoyés au démarrage (défaut: "upnp:rootdevice")
    fn get_search_targets(&self) -> Vec<String>;
}

impl UpnpNetworkConfigExt for Config {
    fn get_allowed_addresses(&self) -> Vec<String> {
        self.get_string_list(&["network", "allowed_addresses"])
    }

    fn set_allowed_addresses(&self, addresses: &[String]) -> Result<()> {
        self.set_string_list(&["network", "allowed_addresses"], addresses)
    }

    fn get_ipv4_enabled(&self) -> bool {
        self.get_bool(&["network", "ipv4"], true)
    }

    fn set_ipv4_enabled(&self, enabled: bool) -> Result<()> {
        self.set_bool(&["network", "ipv4"], enabled)
    }

    fn get_ipv6_enabled(&self) -> bool {
        self.get_bool(&["network", "ipv6"], true)
    }

    fn set_ipv6_enabled(&self, enabled: bool) -> Result<()> {
        self.set_bool(&["network", "ipv6"], enabled)
    }

    fn enabled_families(&self) -> Vec<AddressFamily> {
        let mut families = Vec::with_capacity(2);
        if self.get_ipv4_enabled() {
            families.push(AddressFamily::Ipv4);
        }
        if self.get_ipv6_enabled() {
            families.push(AddressFamily::Ipv6);
        }
        families
    }

    fn get_site_local_operation(&self) -> bool {
        self.get_bool(&["network", "site_local_operation"], false)
    }

    fn get_version_policy(&self) -> VersionPolicy {
        VersionPolicy::from_lax(self.get_bool(&["upnp", "lax_version_parsing"], true))
    }

    fn set_version_policy(&self, policy: VersionPolicy) -> Result<()> {
        self.set_bool(
            &["upnp", "lax_version_parsing"],
            policy == VersionPolicy::Lax,
        )
    }

    fn get_search_targets(&self) -> Vec<String> {
        let targets = self.get_string_list(&["upnp", "search_targets"]);
        if targets.is_empty() {
            vec![DEFAULT_SEARCH_TARGET.to_string()]
        } else {
            targets
        }
    }
}
