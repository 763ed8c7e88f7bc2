//! # Module SSDP - Simple Service Discovery Protocol
//!
//! Primitives SSDP côté control point :
//!
//! - ✅ Liaison des sockets multicast de découverte (1900) et d'événements (7900)
//! - ✅ Adhésion aux groupes IPv4 et aux quatre portées IPv6 (nœud, lien, site, global)
//! - ✅ Libération symétrique des groupes et fermeture unique du socket
//! - ✅ Parsing des NOTIFY alive/byebye et des réponses M-SEARCH
//! - ✅ Construction des requêtes M-SEARCH
//!
//! ## Architecture
//!
//! - [`MulticastBinding`] : socket lié et groupes rejoints
//! - [`SsdpEvent`] : message SSDP reçu
//!
//! ## Constantes
//!
//! - **Découverte**: 239.255.255.250:1900, FF0x::C
//! - **Événements multicast (GENA, UPnP 1.1)**: 239.255.255.246:7900, FF0x::130
//! - **Max-Age** par défaut : 1800 secondes

use std::net::{Ipv4Addr, Ipv6Addr};

mod message;
mod multicast;

pub use message::{SsdpEvent, build_msearch, parse_message};
pub use multicast::{
    GroupInterface, GroupSocket, MulticastBinding, MulticastChannel, MulticastError,
    MulticastGroup, MulticastScope, UdpGroupSocket, bind_multicast, groups_for,
    multicast_address_for_interface,
};

/// Port SSDP
pub const SSDP_PORT: u16 = 1900;

/// Adresse multicast SSDP (IPv4)
pub const SSDP_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_MULTICAST_V6_NODE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff01, 0, 0, 0, 0, 0, 0, 0xc);
pub const SSDP_MULTICAST_V6_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);
pub const SSDP_MULTICAST_V6_SITE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);
pub const SSDP_MULTICAST_V6_GLOBAL: Ipv6Addr = Ipv6Addr::new(0xff0e, 0, 0, 0, 0, 0, 0, 0xc);

/// Port des événements GENA multicast
pub const GENA_MULTICAST_PORT: u16 = 7900;

pub const GENA_MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 246);
pub const GENA_MULTICAST_V6_NODE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff01, 0, 0, 0, 0, 0, 0, 0x130);
pub const GENA_MULTICAST_V6_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x130);
pub const GENA_MULTICAST_V6_SITE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x130);
pub const GENA_MULTICAST_V6_GLOBAL: Ipv6Addr = Ipv6Addr::new(0xff0e, 0, 0, 0, 0, 0, 0, 0x130);

/// Durée de validité des annonces (en secondes)
pub const MAX_AGE: u32 = 1800;

/// Délai de réponse maximal demandé dans les M-SEARCH (en secondes)
pub const DEFAULT_MX: u32 = 3;
