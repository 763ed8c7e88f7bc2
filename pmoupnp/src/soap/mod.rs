//! # Module SOAP - Simple Object Access Protocol
//!
//! Ce module implémente le cadrage SOAP utilisé par les proxies de services UPnP.
//!
//! ## Fonctionnalités
//!
//! - ✅ Écriture d'enveloppes (déclaration, `Envelope`, `Body`, fermeture)
//! - ✅ Marqueur de valeur nulle `xsi:nil="true"`
//! - ✅ Lecture nœud par nœud, formes vides et non vides
//! - ✅ Construction de requêtes et de réponses d'actions
//! - ✅ Gestion des SOAP Faults avec détail UPnP
//!
//! ## Architecture
//!
//! - [`EnvelopeWriter`] / [`EnvelopeReader`] : cadrage bas niveau
//! - [`SoapAction`] : action ou réponse extraite d'un corps
//! - [`SoapFault`] : erreur SOAP
//!
//! ## Example
//!
//! ```
//! use pmoupnp::soap::{build_soap_response, parse_soap_action};
//!
//! let xml = build_soap_response(
//!     "urn:schemas-upnp-org:service:ContentDirectory:1",
//!     "GetSystemUpdateID",
//!     &[("Id", Some("42"))],
//! )
//! .unwrap();
//!
//! let response = parse_soap_action(xml.as_bytes()).unwrap();
//! assert_eq!(response.name, "GetSystemUpdateIDResponse");
//! assert_eq!(response.get("Id"), Some("42"));
//! ```

mod builder;
mod envelope;
mod fault;
mod parser;

pub use builder::{build_soap_request, build_soap_response};
pub use envelope::{
    ElementInfo, EnvelopeError, EnvelopeReader, EnvelopeWriter, SOAP_ENCODING_STYLE,
    SOAP_ENVELOPE_NS, XSI_NS,
};
pub use fault::{SoapFault, UpnpError, build_soap_fault};
pub use parser::{SoapAction, SoapMessage, parse_soap_action, parse_soap_message};

/// Valeur de l'en-tête `Content-Type` des requêtes SOAP
pub const SOAP_CONTENT_TYPE: &str = r#"text/xml; charset="utf-8""#;

/// Valeur de l'en-tête `SOAPAction` : `"urn:service#Action"`
pub fn soap_action_header(service_urn: &str, action: &str) -> String {
    format!(r#""{}#{}""#, service_urn, action)
}

/// Codes d'erreur SOAP UPnP standards
pub mod error_codes {
    /// Action invalide
    pub const INVALID_ACTION: &str = "401";

    /// Arguments invalides
    pub const INVALID_ARGS: &str = "402";

    /// Action échouée
    pub const ACTION_FAILED: &str = "501";

    /// Valeur d'argument invalide
    pub const ARGUMENT_VALUE_INVALID: &str = "600";

    /// Argument hors limites
    pub const ARGUMENT_VALUE_OUT_OF_RANGE: &str = "601";

    /// Action optionnelle non implémentée
    pub const OPTIONAL_ACTION_NOT_IMPLEMENTED: &str = "602";

    /// Mémoire insuffisante
    pub const OUT_OF_MEMORY: &str = "603";

    /// Intervention humaine requise
    pub const HUMAN_INTERVENTION_REQUIRED: &str = "604";

    /// Argument sous forme de chaîne trop long
    pub const STRING_ARGUMENT_TOO_LONG: &str = "605";

    /// ContentDirectory : objet inexistant
    pub const NO_SUCH_OBJECT: &str = "701";
}
