//! Utilitaires réseau partagés par les crates PMO.
//!
//! Le module [`ip_utils`] classe les adresses locales par « distance »
//! (loopback < link-local < site-local < global), filtre les adresses selon une
//! liste blanche et fournit les représentations textuelles utilisées dans les
//! en-têtes HTTP et SSDP.
//!
//! Toutes les fonctions de tri et de filtrage sont pures : elles opèrent sur des
//! listes de [`AddressCandidate`] construites par l'appelant, ce qui les rend
//! testables sans interface réseau.
//!
//! # Examples
//!
//! ```
//! use pmoutils::{AddressCandidate, order_by_scope};
//!
//! let candidates = vec![
//!     AddressCandidate::new("2001:db8::1".parse().unwrap()),
//!     AddressCandidate::new("::1".parse().unwrap()),
//! ];
//! let ordered = order_by_scope(candidates);
//! assert!(ordered[0].address.is_loopback());
//! ```
pub mod ip_utils;

pub use ip_utils::{
    AddressCandidate, AddressFamily, GLOBAL_DISTANCE, LINK_LOCAL_DISTANCE, SITE_LOCAL_DISTANCE,
    ZERO_DISTANCE, bindable_addresses, endpoint_to_string, filter_addresses, host_name,
    host_names_equal, ip_to_string, link_distance, local_candidates, order_by_scope,
    select_for_family, upnp_enabled_addresses,
};
