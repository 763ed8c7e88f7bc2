//! Parser SOAP pour actions et réponses UPnP

use std::io::BufRead;

use super::envelope::{EnvelopeError, EnvelopeReader};
use super::fault::{SoapFault, read_fault};

/// Action (ou réponse d'action) UPnP extraite d'une enveloppe SOAP
#[derive(Debug, Clone, PartialEq)]
pub struct SoapAction {
    /// Nom de l'action (ex: "Browse", "BrowseResponse")
    pub name: String,

    /// Namespace de l'action (ex: "urn:schemas-upnp-org:service:ContentDirectory:1")
    pub namespace: Option<String>,

    /// Arguments dans l'ordre du document ; `None` pour une valeur nulle
    pub args: Vec<(String, Option<String>)>,
}

impl SoapAction {
    /// Valeur d'un argument ; `None` s'il est absent ou nul.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(arg, _)| arg == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Vrai si l'argument est présent avec le marqueur nul.
    pub fn is_null(&self, name: &str) -> bool {
        self.args
            .iter()
            .any(|(arg, value)| arg == name && value.is_none())
    }
}

/// Contenu du corps d'une enveloppe : une action, ou un fault.
#[derive(Debug, Clone, PartialEq)]
pub enum SoapMessage {
    Action(SoapAction),
    Fault(SoapFault),
}

/// Parse le corps d'une enveloppe SOAP reçue
pub fn parse_soap_message(xml: &[u8]) -> Result<SoapMessage, EnvelopeError> {
    let mut reader = EnvelopeReader::new(xml);
    reader.open()?;

    let first = reader.peek_element()?.ok_or(EnvelopeError::NoAction)?;
    let message = if first.local_name == "Fault" {
        SoapMessage::Fault(read_fault(&mut reader)?)
    } else {
        SoapMessage::Action(read_action(&mut reader)?)
    };

    reader.close()?;
    Ok(message)
}

/// Parse une action SOAP à partir de bytes XML
pub fn parse_soap_action(xml: &[u8]) -> Result<SoapAction, EnvelopeError> {
    match parse_soap_message(xml)? {
        SoapMessage::Action(action) => Ok(action),
        SoapMessage::Fault(fault) => Err(EnvelopeError::UnexpectedNode {
            expected: "an action".to_string(),
            found: format!("fault '{}'", fault),
        }),
    }
}

fn read_action<R: BufRead>(reader: &mut EnvelopeReader<R>) -> Result<SoapAction, EnvelopeError> {
    let element = reader.peek_element()?.ok_or(EnvelopeError::NoAction)?;
    let mut action = SoapAction {
        name: element.local_name.clone(),
        namespace: element.namespace().map(str::to_string),
        args: Vec::new(),
    };

    if reader.read_empty_element(None)? {
        return Ok(action);
    }

    while let Some(arg) = reader.peek_element()? {
        let value = reader.read_optional_string(None)?;
        action.args.push((arg.local_name, value));
    }
    reader.read_end_element()?;
    Ok(action)
}
