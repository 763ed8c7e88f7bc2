//! Sélection et classement des adresses IP locales.
//!
//! La « distance » d'une adresse mesure la portée du lien qu'elle représente :
//! plus elle est grande, plus l'envoi de paquets par cette adresse est coûteux.
//! L'ordre est : loopback, link-local, site-local, global.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use get_if_addrs::get_if_addrs;
use tracing::{debug, error, warn};

pub const ZERO_DISTANCE: u8 = 0;
pub const LINK_LOCAL_DISTANCE: u8 = 1;
pub const SITE_LOCAL_DISTANCE: u8 = 2;
pub const GLOBAL_DISTANCE: u8 = 3;

/// Famille d'adresse d'un pair ou d'une interface locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Adresse « any » de la famille (`0.0.0.0` ou `::`).
    pub fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn loopback(self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// Adresse locale candidate, avec sa famille et sa distance.
///
/// `scope_id` est l'index d'interface (utile uniquement pour IPv6, où il
/// désigne l'interface sur laquelle rejoindre les groupes multicast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCandidate {
    pub address: IpAddr,
    pub family: AddressFamily,
    pub distance: u8,
    pub scope_id: u32,
}

impl AddressCandidate {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            family: AddressFamily::of(&address),
            distance: link_distance(&address),
            scope_id: 0,
        }
    }

    pub fn with_scope_id(mut self, scope_id: u32) -> Self {
        self.scope_id = scope_id;
        self
    }

    pub fn is_loopback(&self) -> bool {
        self.address.is_loopback()
    }
}

pub(crate) fn is_ipv6_link_local(address: &Ipv6Addr) -> bool {
    (address.segments()[0] & 0xffc0) == 0xfe80
}

/// fec0::/10 (site-local historique) et fc00::/7 (unique local).
pub(crate) fn is_ipv6_site_local(address: &Ipv6Addr) -> bool {
    let first = address.segments()[0];
    (first & 0xffc0) == 0xfec0 || (first & 0xfe00) == 0xfc00
}

/// Retourne la distance d'une adresse.
///
/// IPv4 : loopback, 169.254/16 (link-local), plages privées RFC 1918
/// (site-local), tout le reste est global.
///
/// IPv6 : `::1`, fe80::/10, fec0::/10 et fc00::/7, tout le reste est global.
pub fn link_distance(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                ZERO_DISTANCE
            } else if v4.is_link_local() {
                LINK_LOCAL_DISTANCE
            } else if v4.is_private() {
                SITE_LOCAL_DISTANCE
            } else {
                GLOBAL_DISTANCE
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                ZERO_DISTANCE
            } else if is_ipv6_link_local(v6) {
                LINK_LOCAL_DISTANCE
            } else if is_ipv6_site_local(v6) {
                SITE_LOCAL_DISTANCE
            } else {
                GLOBAL_DISTANCE
            }
        }
    }
}

/// Trie les candidats par distance croissante.
///
/// Le tri est stable : à distance égale, l'ordre de découverte est conservé.
pub fn order_by_scope<I>(candidates: I) -> Vec<AddressCandidate>
where
    I: IntoIterator<Item = AddressCandidate>,
{
    let mut ordered: Vec<AddressCandidate> = candidates.into_iter().collect();
    ordered.sort_by_key(|candidate| candidate.distance);
    ordered
}

/// Restreint les candidats à la famille du pair, du plus proche au plus lointain.
pub fn select_for_family<I>(family: AddressFamily, candidates: I) -> Vec<AddressCandidate>
where
    I: IntoIterator<Item = AddressCandidate>,
{
    order_by_scope(
        candidates
            .into_iter()
            .filter(|candidate| candidate.family == family),
    )
}

/// Retire l'index de zone (`%eth0`, `%3`) d'une adresse textuelle IPv6.
pub fn strip_zone(text: &str) -> &str {
    match text.find('%') {
        Some(index) => &text[..index],
        None => text,
    }
}

fn matches_filter(candidate: &AddressCandidate, filter: &str) -> bool {
    let filter = strip_zone(filter.trim());
    if filter.eq_ignore_ascii_case(&ip_to_string(&candidate.address)) {
        return true;
    }
    filter
        .parse::<IpAddr>()
        .map(|parsed| parsed == candidate.address)
        .unwrap_or(false)
}

/// Filtre les candidats selon une liste blanche d'adresses textuelles.
///
/// La comparaison ignore la casse (littéraux hexadécimaux IPv6). Les adresses
/// loopback sont toujours conservées. Une entrée de la liste qui n'est pas une
/// adresse, ou qui ne correspond à aucun candidat, est signalée par un
/// avertissement et ignorée.
pub fn filter_addresses(
    candidates: Vec<AddressCandidate>,
    allow_list: &[String],
) -> Vec<AddressCandidate> {
    if allow_list.is_empty() {
        return candidates;
    }

    for filter in allow_list {
        match strip_zone(filter.trim()).parse::<IpAddr>() {
            Err(_) => {
                warn!(
                    filter = %filter,
                    "Address filter is not a valid IP address, ignoring it"
                );
            }
            Ok(address) => {
                if !address.is_loopback()
                    && !candidates.iter().any(|candidate| candidate.address == address)
                {
                    warn!(
                        filter = %address,
                        "Address filter references an address that is not available; check the IP configuration"
                    );
                }
            }
        }
    }

    candidates
        .into_iter()
        .filter(|candidate| {
            candidate.is_loopback()
                || allow_list
                    .iter()
                    .any(|filter| matches_filter(candidate, filter))
        })
        .collect()
}

#[cfg(unix)]
fn interface_index(name: &str) -> u32 {
    match std::ffi::CString::new(name) {
        // SAFETY: the pointer is a valid NUL-terminated string for the duration of the call.
        Ok(cname) => unsafe { libc::if_nametoindex(cname.as_ptr()) },
        Err(_) => 0,
    }
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> u32 {
    0
}

/// Énumère les adresses de toutes les interfaces locales.
///
/// Les adresses IPv6 portent l'index de leur interface dans `scope_id`.
pub fn local_candidates() -> io::Result<Vec<AddressCandidate>> {
    let interfaces = get_if_addrs()?;
    let mut result: Vec<AddressCandidate> = Vec::with_capacity(interfaces.len());
    for iface in interfaces {
        let address = iface.ip();
        let scope_id = match address {
            IpAddr::V6(_) => interface_index(&iface.name),
            IpAddr::V4(_) => 0,
        };
        if result.iter().any(|c| c.address == address) {
            continue;
        }
        debug!(interface = %iface.name, address = %address, scope_id, "Local address found");
        result.push(AddressCandidate::new(address).with_scope_id(scope_id));
    }
    Ok(result)
}

fn local_candidates_or_empty() -> Vec<AddressCandidate> {
    match local_candidates() {
        Ok(candidates) => candidates,
        Err(e) => {
            error!("Error retrieving local IP addresses: {}", e);
            Vec::new()
        }
    }
}

/// Adresses sur lesquelles lier les sockets d'une famille.
///
/// Sans liste blanche, l'adresse « any » de la famille suffit. Sinon, les
/// adresses de la famille sont filtrées et la loopback est ajoutée.
pub fn bindable_addresses(family: AddressFamily, allow_list: &[String]) -> Vec<AddressCandidate> {
    if allow_list.is_empty() {
        return vec![AddressCandidate::new(family.unspecified())];
    }
    bindable_from(family, local_candidates_or_empty(), allow_list)
}

pub(crate) fn bindable_from(
    family: AddressFamily,
    candidates: Vec<AddressCandidate>,
    allow_list: &[String],
) -> Vec<AddressCandidate> {
    if allow_list.is_empty() {
        return vec![AddressCandidate::new(family.unspecified())];
    }
    let of_family: Vec<AddressCandidate> = candidates
        .into_iter()
        .filter(|candidate| candidate.family == family)
        .collect();
    let mut result = filter_addresses(of_family, allow_list);
    let loopback = family.loopback();
    if !result.iter().any(|candidate| candidate.address == loopback) {
        result.push(AddressCandidate::new(loopback));
    }
    result
}

/// Adresses sur lesquelles le système UPnP est actif.
///
/// La loopback IPv6 est exclue ; la loopback IPv4 est toujours présente.
pub fn upnp_enabled_addresses(allow_list: &[String]) -> Vec<AddressCandidate> {
    upnp_enabled_from(local_candidates_or_empty(), allow_list)
}

pub(crate) fn upnp_enabled_from(
    candidates: Vec<AddressCandidate>,
    allow_list: &[String],
) -> Vec<AddressCandidate> {
    let candidates: Vec<AddressCandidate> = candidates
        .into_iter()
        .filter(|candidate| candidate.address != IpAddr::V6(Ipv6Addr::LOCALHOST))
        .collect();
    let mut result = filter_addresses(candidates, allow_list);
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    if !result.iter().any(|candidate| candidate.address == loopback) {
        result.push(AddressCandidate::new(loopback));
    }
    result
}

/// Représentation textuelle sans index de zone (`192.168.1.2`, `fe80::1`).
pub fn ip_to_string(address: &IpAddr) -> String {
    strip_zone(&address.to_string()).to_string()
}

/// Nom d'hôte utilisable dans une URL : les adresses IPv6 sont entre crochets.
pub fn host_name(address: &IpAddr) -> String {
    match address {
        IpAddr::V4(_) => ip_to_string(address),
        IpAddr::V6(_) => format!("[{}]", ip_to_string(address)),
    }
}

/// `123.123.123.123:1234` ou `[abcd::1]:1234`.
pub fn endpoint_to_string(address: &IpAddr, port: u16) -> String {
    format!("{}:{}", host_name(address), port)
}

/// Compare deux noms d'hôtes, en comparant les adresses lorsque les deux
/// chaînes en sont.
pub fn host_names_equal(host1: &str, host2: &str) -> bool {
    let unbracket = |host: &str| -> Option<String> {
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
    };
    let (h1, h2) = match (unbracket(host1), unbracket(host2)) {
        (Some(a), Some(b)) => (a, b),
        _ => (host1.to_string(), host2.to_string()),
    };
    if let (Ok(a1), Ok(a2)) = (
        strip_zone(&h1).parse::<IpAddr>(),
        strip_zone(&h2).parse::<IpAddr>(),
    ) {
        if a1 == a2 {
            return true;
        }
    }
    h1 == h2
}
