//! # pmoupnp - primitives filaires UPnP
//!
//! Briques sans état partagé utilisées par le control point `pmoconnect` :
//!
//! - [`ssdp`] : liaison des sockets multicast SSDP/GENA, parsing des messages SSDP
//! - [`compression`] : négociation `Accept-Encoding` et (dé)compression des corps HTTP
//! - [`soap`] : écriture et lecture des enveloppes SOAP, faults
//! - [`identifiers`] : USN, URN type/version, UDN, version UPnP des chaînes d'agent
//! - [`config_ext`] : réglages réseau dans `pmoconfig`

pub mod compression;
pub mod config_ext;
pub mod identifiers;
pub mod soap;
pub mod ssdp;

pub use crate::compression::{Codec, CompressionError, CompressionNegotiator};
pub use crate::config_ext::UpnpNetworkConfigExt;
pub use crate::identifiers::{IdentifierError, PeerIdentifier, VersionPolicy};
pub use crate::soap::EnvelopeError;
pub use crate::ssdp::MulticastError;

/// Jeton d'agent annoncé dans les en-têtes `SERVER` / `USER-AGENT`
pub const USER_AGENT: &str = concat!(
    "PMOConnect/",
    env!("CARGO_PKG_VERSION"),
    " UPnP/1.1"
);
