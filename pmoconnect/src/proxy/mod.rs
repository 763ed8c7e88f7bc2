//! Proxies des services distants
//!
//! [`ServiceProxy`] envoie des actions SOAP sur l'URL de contrôle d'un
//! service ; les proxies typés ([`ContentDirectoryProxy`],
//! [`ConnectionManagerProxy`]) l'enveloppent avec les actions de leur
//! service.
//!
//! Tous les proxies d'une même connexion partagent un indicateur de
//! validité : après la déconnexion, chaque appel échoue avec
//! [`ProxyError::NotConnected`].

mod connection_manager;
mod content_directory;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pmoupnp::soap::{
    SOAP_CONTENT_TYPE, SoapAction, SoapMessage, build_soap_request, parse_soap_message,
    soap_action_header,
};
use pmoupnp::{CompressionNegotiator, USER_AGENT};
use tracing::{debug, trace};
use ureq::Agent;

pub use connection_manager::{ConnectionInfo, ConnectionManagerProxy, ProtocolInfo};
pub use content_directory::{BrowseFlag, BrowseResult, ContentDirectoryProxy};

use crate::discovery::ServiceDescription;
use crate::errors::ProxyError;

/// Client SOAP d'un service distant.
#[derive(Clone)]
pub struct ServiceProxy {
    service: ServiceDescription,
    valid: Arc<AtomicBool>,
    agent: Agent,
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.service)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl ServiceProxy {
    /// Crée un proxy ; `valid` est partagé par les proxies d'une connexion.
    pub fn new(service: ServiceDescription, valid: Arc<AtomicBool>, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            service,
            valid,
            agent: config.into(),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service.service_id
    }

    pub fn service_type(&self) -> &str {
        &self.service.service_type
    }

    pub fn control_url(&self) -> &str {
        &self.service.control_url
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Invoque une action et retourne les arguments de sa réponse.
    ///
    /// Le corps de la réponse est décodé selon son `Content-Encoding`. Un
    /// fault SOAP devient [`ProxyError::Fault`], quel que soit le statut HTTP.
    pub fn invoke(&self, action: &str, args: &[(&str, &str)]) -> Result<SoapAction, ProxyError> {
        if !self.is_valid() {
            return Err(ProxyError::NotConnected(self.service.service_id.clone()));
        }

        let body = build_soap_request(&self.service.service_type, action, args)?;
        let negotiator = CompressionNegotiator::global();
        debug!(
            service = %self.service.service_id,
            url = %self.service.control_url,
            "Invoking {}", action
        );

        let mut response = self
            .agent
            .post(&self.service.control_url)
            .header("Content-Type", SOAP_CONTENT_TYPE)
            .header("SOAPAction", &soap_action_header(&self.service.service_type, action))
            .header("Accept-Encoding", &negotiator.accept_encoding_header())
            .header("User-Agent", USER_AGENT)
            .send(body)
            .map_err(|source| ProxyError::Http {
                action: action.to_string(),
                source,
            })?;

        let status = response.status();
        let content_encoding = response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let raw = response
            .body_mut()
            .read_to_vec()
            .map_err(|source| ProxyError::Http {
                action: action.to_string(),
                source,
            })?;
        let body = negotiator.decode_body(content_encoding.as_deref(), raw)?;
        trace!("{} response ({}): {}", action, status, String::from_utf8_lossy(&body));

        let message = match parse_soap_message(&body) {
            Ok(message) => message,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(ProxyError::Status {
                    action: action.to_string(),
                    status: status.as_u16(),
                });
            }
        };

        match message {
            SoapMessage::Fault(fault) => Err(ProxyError::Fault {
                action: action.to_string(),
                fault,
            }),
            SoapMessage::Action(_) if !status.is_success() => Err(ProxyError::Status {
                action: action.to_string(),
                status: status.as_u16(),
            }),
            SoapMessage::Action(response) => {
                let expected = format!("{}Response", action);
                if response.name == expected {
                    Ok(response)
                } else {
                    Err(ProxyError::UnexpectedResponse {
                        expected,
                        found: response.name,
                    })
                }
            }
        }
    }
}

/// Valeur obligatoire d'une réponse
pub(crate) fn required<'a>(response: &'a SoapAction, name: &str) -> Result<&'a str, ProxyError> {
    response
        .get(name)
        .ok_or_else(|| ProxyError::missing_return_value(name))
}

/// Valeur numérique obligatoire d'une réponse
pub(crate) fn required_number<T: std::str::FromStr>(
    response: &SoapAction,
    name: &str,
) -> Result<T, ProxyError> {
    let value = required(response, name)?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ProxyError::bad_return_value(name, value))
}

/// Découpe une liste CSV UPnP en ignorant les entrées vides.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}
