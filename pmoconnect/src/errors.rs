use std::io;

use pmoupnp::soap::SoapFault;
use pmoupnp::{CompressionError, EnvelopeError, IdentifierError, MulticastError};
use thiserror::Error;

/// Erreurs de la couche de découverte (tracker SSDP, descriptions, sessions).
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: ureq::Error,
    },

    #[error("{url} answered with HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode HTTP body: {0}")]
    Compression(#[from] CompressionError),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Missing required device element: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error("Device {0} has no reachable location")]
    NoLocation(String),

    #[error(transparent)]
    Multicast(#[from] MulticastError),

    #[error("No local address available for SSDP")]
    NoLocalAddress,

    #[error("Discovery tracker is stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DiscoveryError {
    pub fn http(url: &str, source: ureq::Error) -> Self {
        DiscoveryError::Http {
            url: url.to_string(),
            source,
        }
    }

    pub fn status(url: &str, status: u16) -> Self {
        DiscoveryError::Status {
            url: url.to_string(),
            status,
        }
    }
}

/// Erreurs d'appel d'une action sur un service distant.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Service {0} is not connected")]
    NotConnected(String),

    #[error("HTTP error when calling {action}: {source}")]
    Http {
        action: String,
        #[source]
        source: ureq::Error,
    },

    #[error("{action} failed with HTTP status {status}")]
    Status { action: String, status: u16 },

    #[error("SOAP envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Cannot decode response body: {0}")]
    Compression(#[from] CompressionError),

    #[error("{action} returned a SOAP fault: {fault}")]
    Fault { action: String, fault: SoapFault },

    #[error("Expected {expected} in SOAP body, found {found}")]
    UnexpectedResponse { expected: String, found: String },

    #[error("Missing {0} element in SOAP body")]
    MissingReturnValue(String),

    #[error("Invalid {0} value: {1}")]
    BadReturnValue(String, String),
}

impl ProxyError {
    pub fn missing_return_value(value: &str) -> Self {
        ProxyError::MissingReturnValue(value.to_string())
    }

    pub fn bad_return_value(name: &str, value: &str) -> Self {
        ProxyError::BadReturnValue(name.to_string(), value.to_string())
    }

    /// Code d'erreur UPnP porté par un fault, s'il y en a un.
    pub fn upnp_error_code(&self) -> Option<u32> {
        match self {
            ProxyError::Fault { fault, .. } => fault.upnp_error_code(),
            _ => None,
        }
    }
}

/// Erreurs d'une tentative de connexion au pair désigné.
///
/// Les échecs de handshake ne remontent jamais à l'appelant : ils sont
/// journalisés et la connexion revient en surveillance.
#[derive(Debug, Error)]
pub enum PeerConnectionError {
    #[error("Cannot resolve description of {udn}: {source}")]
    Description {
        udn: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("Device {udn} is a {found}, expected {expected} version {min_version} or later")]
    WrongDeviceType {
        udn: String,
        found: String,
        expected: String,
        min_version: u32,
    },

    #[error("Cannot open session with {udn}: {source}")]
    Session {
        udn: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("Device {udn} does not provide required service {service_id}")]
    MissingService { udn: String, service_id: String },

    #[error("Cannot register to the discovery facility: {0}")]
    Registration(#[source] DiscoveryError),

    #[error("Cannot spawn handshake thread: {0}")]
    Spawn(#[source] io::Error),
}

impl PeerConnectionError {
    /// Étape du handshake en échec, pour la journalisation.
    pub fn step(&self) -> &'static str {
        match self {
            PeerConnectionError::Description { .. } => "description",
            PeerConnectionError::WrongDeviceType { .. } => "device type",
            PeerConnectionError::Session { .. } => "session",
            PeerConnectionError::MissingService { .. } => "service binding",
            PeerConnectionError::Registration(_) => "registration",
            PeerConnectionError::Spawn(_) => "spawn",
        }
    }
}
