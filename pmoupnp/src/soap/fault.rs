//! SOAP Faults pour UPnP

use std::fmt;
use std::io::BufRead;

use super::envelope::{EnvelopeError, EnvelopeReader, EnvelopeWriter};

const UPNP_CONTROL_NS: &str = "urn:schemas-upnp-org:control-1-0";

/// Erreur SOAP (Fault)
#[derive(Debug, Clone, PartialEq)]
pub struct SoapFault {
    /// Code d'erreur (ex: "s:Client")
    pub fault_code: String,

    /// Description de l'erreur
    pub fault_string: String,

    /// Détails UPnP optionnels
    pub upnp_error: Option<UpnpError>,
}

/// Erreur UPnP spécifique
#[derive(Debug, Clone, PartialEq)]
pub struct UpnpError {
    /// Code d'erreur UPnP (ex: "401", "501")
    pub error_code: String,

    /// Description de l'erreur
    pub error_description: String,
}

impl SoapFault {
    /// Crée un fault SOAP simple
    pub fn new(fault_code: String, fault_string: String) -> Self {
        Self {
            fault_code,
            fault_string,
            upnp_error: None,
        }
    }

    /// Crée un fault SOAP avec erreur UPnP
    pub fn with_upnp_error(
        fault_code: String,
        fault_string: String,
        error_code: String,
        error_description: String,
    ) -> Self {
        Self {
            fault_code,
            fault_string,
            upnp_error: Some(UpnpError {
                error_code,
                error_description,
            }),
        }
    }

    /// Code UPnP numérique, s'il est présent et lisible.
    pub fn upnp_error_code(&self) -> Option<u32> {
        self.upnp_error
            .as_ref()
            .and_then(|e| e.error_code.trim().parse().ok())
    }
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.upnp_error {
            Some(upnp) => write!(
                f,
                "{} ({}): UPnP error {} {}",
                self.fault_string, self.fault_code, upnp.error_code, upnp.error_description
            ),
            None => write!(f, "{} ({})", self.fault_string, self.fault_code),
        }
    }
}

/// Construit un SOAP Fault XML
///
/// # Arguments
///
/// * `fault_code` - Code du fault (ex: "s:Client")
/// * `fault_string` - Message d'erreur
/// * `upnp_error_code` - Code d'erreur UPnP optionnel (ex: "401")
/// * `upnp_error_desc` - Description d'erreur UPnP optionnelle
pub fn build_soap_fault(
    fault_code: &str,
    fault_string: &str,
    upnp_error_code: Option<&str>,
    upnp_error_desc: Option<&str>,
) -> Result<String, EnvelopeError> {
    let mut writer = EnvelopeWriter::open(Vec::new(), false)?;
    writer.start_element("s:Fault")?;
    writer.write_element("faultcode", Some(fault_code))?;
    writer.write_element("faultstring", Some(fault_string))?;

    if let Some(code) = upnp_error_code {
        writer.start_element("detail")?;
        writer.start_element("UPnPError")?;
        writer.attribute("xmlns", UPNP_CONTROL_NS)?;
        writer.write_element("errorCode", Some(code))?;
        if let Some(desc) = upnp_error_desc {
            writer.write_element("errorDescription", Some(desc))?;
        }
        writer.end_element()?;
        writer.end_element()?;
    }

    writer.end_element()?;
    Ok(String::from_utf8(writer.close_envelope()?)?)
}

/// Lit un élément `Fault` ; le lecteur doit être positionné dessus.
pub(crate) fn read_fault<R: BufRead>(reader: &mut EnvelopeReader<R>) -> Result<SoapFault, EnvelopeError> {
    let mut fault = SoapFault::new(String::new(), String::new());
    if reader.read_empty_element(Some("Fault"))? {
        return Ok(fault);
    }

    while let Some(child) = reader.peek_element()? {
        match child.local_name.as_str() {
            "faultcode" => fault.fault_code = reader.read_element_string(None)?.trim().to_string(),
            "faultstring" => fault.fault_string = reader.read_element_string(None)?.trim().to_string(),
            "detail" => fault.upnp_error = read_detail(reader)?,
            _ => reader.skip_element()?,
        }
    }
    reader.read_end_element()?;
    Ok(fault)
}

fn read_detail<R: BufRead>(reader: &mut EnvelopeReader<R>) -> Result<Option<UpnpError>, EnvelopeError> {
    if reader.read_empty_element(Some("detail"))? {
        return Ok(None);
    }
    let mut upnp_error = None;
    while let Some(child) = reader.peek_element()? {
        if child.local_name == "UPnPError" {
            upnp_error = read_upnp_error(reader)?;
        } else {
            reader.skip_element()?;
        }
    }
    reader.read_end_element()?;
    Ok(upnp_error)
}

fn read_upnp_error<R: BufRead>(reader: &mut EnvelopeReader<R>) -> Result<Option<UpnpError>, EnvelopeError> {
    if reader.read_empty_element(Some("UPnPError"))? {
        return Ok(None);
    }
    let mut error = UpnpError {
        error_code: String::new(),
        error_description: String::new(),
    };
    while let Some(child) = reader.peek_element()? {
        match child.local_name.as_str() {
            "errorCode" => error.error_code = reader.read_element_string(None)?.trim().to_string(),
            "errorDescription" => {
                error.error_description = reader.read_element_string(None)?.trim().to_string()
            }
            _ => reader.skip_element()?,
        }
    }
    reader.read_end_element()?;
    Ok(Some(error))
}
