//! Récupération et lecture des descriptions de devices (`description.xml`)

use std::time::Duration;

use pmoupnp::{CompressionNegotiator, PeerIdentifier, USER_AGENT};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::{Error as XmlError, Reader, events::Event};
use tracing::{debug, trace};
use ureq::Agent;
use url::Url;

use crate::errors::DiscoveryError;

/// Service déclaré dans la `serviceList` du device racine.
///
/// Les URLs sont résolues par rapport à l'emplacement de la description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescription {
    pub service_type: String,
    pub service_id: String,
    pub control_url: String,
    pub event_sub_url: String,
}

/// Description du device racine.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescription {
    pub udn: PeerIdentifier,
    pub device_type: String,
    pub friendly_name: String,
    pub location: String,
    pub services: Vec<ServiceDescription>,
}

impl DeviceDescription {
    /// Service d'identifiant `service_id` (comparaison insensible à la casse)
    pub fn find_service(&self, service_id: &str) -> Option<&ServiceDescription> {
        self.services
            .iter()
            .find(|s| s.service_id.eq_ignore_ascii_case(service_id))
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.services.iter().map(|s| s.service_id.clone()).collect()
    }
}

/// Récupère et parse la description publiée à `location`.
///
/// Le corps est demandé compressé si possible, puis décodé selon son
/// `Content-Encoding`.
pub fn fetch_description(
    location: &str,
    timeout: Duration,
) -> Result<DeviceDescription, DiscoveryError> {
    debug!("Fetching description at {}", location);

    let negotiator = CompressionNegotiator::global();
    let config = Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build();
    let agent: Agent = config.into();

    let mut response = agent
        .get(location)
        .header("Accept-Encoding", &negotiator.accept_encoding_header())
        .header("User-Agent", USER_AGENT)
        .call()
        .map_err(|e| DiscoveryError::http(location, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::status(location, status.as_u16()));
    }

    let content_encoding = response
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let raw = response
        .body_mut()
        .read_to_vec()
        .map_err(|e| DiscoveryError::http(location, e))?;
    let body = negotiator.decode_body(content_encoding.as_deref(), raw)?;

    parse_description(&body, location)
}

/// Parse une description de device.
///
/// Seuls le device racine et sa `serviceList` sont lus ; les devices
/// embarqués sont ignorés.
pub fn parse_description(xml: &[u8], location: &str) -> Result<DeviceDescription, DiscoveryError> {
    let mut reader = Reader::from_reader(xml);

    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    let mut url_base: Option<String> = None;
    let mut udn: Option<String> = None;
    let mut device_type: Option<String> = None;
    let mut friendly_name = String::new();
    let mut services = Vec::new();
    let mut current = ServiceDescription::default();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                text.clear();
            }
            Event::Text(e) => {
                text.push_str(&e.decode().map_err(XmlError::Encoding)?);
            }
            Event::CData(e) => {
                text.push_str(&e.decode().map_err(XmlError::Encoding)?);
            }
            Event::GeneralRef(e) => {
                if let Some(ch) = e.resolve_char_ref()? {
                    text.push(ch);
                } else {
                    let entity = e.decode().map_err(XmlError::Encoding)?;
                    if let Some(resolved) = resolve_predefined_entity(&entity) {
                        text.push_str(resolved);
                    }
                }
            }
            Event::End(_) => {
                let value = text.trim().to_string();
                text.clear();
                let segments: Vec<&str> = path.iter().map(String::as_str).collect();
                match segments.as_slice() {
                    ["root", "URLBase"] => url_base = Some(value),
                    ["root", "device", "UDN"] => udn = Some(value),
                    ["root", "device", "deviceType"] => device_type = Some(value),
                    ["root", "device", "friendlyName"] => friendly_name = value,
                    ["root", "device", "serviceList", "service", field] => match *field {
                        "serviceType" => current.service_type = value,
                        "serviceId" => current.service_id = value,
                        "controlURL" => current.control_url = value,
                        "eventSubURL" => current.event_sub_url = value,
                        _ => {}
                    },
                    ["root", "device", "serviceList", "service"] => {
                        let service = std::mem::take(&mut current);
                        if service.service_id.is_empty() {
                            trace!("Service without serviceId in {}, ignored", location);
                        } else {
                            services.push(service);
                        }
                    }
                    _ => {}
                }
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let udn = udn.ok_or(DiscoveryError::MissingField("UDN"))?;
    let device_type = device_type.ok_or(DiscoveryError::MissingField("deviceType"))?;
    let base = url_base.as_deref().unwrap_or(location);
    for service in &mut services {
        service.control_url = resolve_url(base, &service.control_url);
        service.event_sub_url = resolve_url(base, &service.event_sub_url);
    }

    let description = DeviceDescription {
        udn: PeerIdentifier::from_udn(&udn)?,
        device_type,
        friendly_name,
        location: location.to_string(),
        services,
    };
    debug!(
        udn = %description.udn,
        device_type = %description.device_type,
        services = description.services.len(),
        "Description parsed"
    );
    Ok(description)
}

/// Résout une URL de description par rapport à `base`.
///
/// Les URLs absolues sont conservées ; les autres sont jointes à `base` avec
/// normalisation des segments `.` et `..`. Une base illisible laisse l'URL
/// telle quelle.
pub fn resolve_url(base: &str, url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    match Url::parse(base).and_then(|base| base.join(url)) {
        Ok(resolved) => resolved.to_string(),
        Err(e) => {
            trace!("Cannot resolve {} against {}: {}", url, base, e);
            url.to_string()
        }
    }
}
