//! Construction des requêtes et réponses SOAP

use super::envelope::{EnvelopeError, EnvelopeWriter};

fn build_action_envelope<'a, I>(
    element_name: &str,
    service_urn: &str,
    args: I,
    include_schema_namespace: bool,
) -> Result<String, EnvelopeError>
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut writer = EnvelopeWriter::open(Vec::new(), include_schema_namespace)?;
    writer.start_element(element_name)?;
    writer.attribute("xmlns:u", service_urn)?;
    for (name, value) in args {
        writer.write_element(name, value)?;
    }
    writer.end_element()?;
    let bytes = writer.close_envelope()?;
    Ok(String::from_utf8(bytes)?)
}

/// Construit la requête SOAP d'une action UPnP
///
/// # Arguments
///
/// * `service_urn` - URN du service (ex: "urn:schemas-upnp-org:service:ContentDirectory:1")
/// * `action` - Nom de l'action (ex: "Browse")
/// * `args` - Arguments, dans l'ordre de la description du service
pub fn build_soap_request(
    service_urn: &str,
    action: &str,
    args: &[(&str, &str)],
) -> Result<String, EnvelopeError> {
    build_action_envelope(
        &format!("u:{}", action),
        service_urn,
        args.iter().map(|(name, value)| (*name, Some(*value))),
        false,
    )
}

/// Construit une réponse SOAP UPnP
///
/// Une valeur `None` est écrite avec le marqueur nul ; le préfixe `xsi` n'est
/// alors déclaré qu'une fois, sur l'enveloppe.
pub fn build_soap_response(
    service_urn: &str,
    action: &str,
    values: &[(&str, Option<&str>)],
) -> Result<String, EnvelopeError> {
    let has_null = values.iter().any(|(_, value)| value.is_none());
    build_action_envelope(
        &format!("u:{}Response", action),
        service_urn,
        values.iter().copied(),
        has_null,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request() {
        let xml = build_soap_request(
            "urn:schemas-upnp-org:service:ContentDirectory:1",
            "Browse",
            &[("ObjectID", "0"), ("BrowseFlag", "BrowseDirectChildren"), ("Filter", "*")],
        )
        .unwrap();

        assert!(xml.contains(
            "<u:Browse xmlns:u=\"urn:schemas-upnp-org:service:ContentDirectory:1\">"
        ));
        assert!(xml.contains("<ObjectID>0</ObjectID>"));
        assert!(xml.contains("<Filter>*</Filter>"));
        assert!(!xml.contains("xmlns:xsi"));
    }

    #[test]
    fn test_build_request_without_args() {
        let xml = build_soap_request(
            "urn:schemas-upnp-org:service:ConnectionManager:1",
            "GetProtocolInfo",
            &[],
        )
        .unwrap();
        assert!(xml.contains(
            "<u:GetProtocolInfo xmlns:u=\"urn:schemas-upnp-org:service:ConnectionManager:1\"/>"
        ));
    }

    #[test]
    fn test_build_response_with_null() {
        let xml = build_soap_response(
            "urn:schemas-upnp-org:service:ContentDirectory:1",
            "GetSortCapabilities",
            &[("SortCaps", None)],
        )
        .unwrap();

        assert!(xml.contains("GetSortCapabilitiesResponse"));
        assert!(xml.contains("xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">"));
        assert!(xml.contains("<SortCaps xsi:nil=\"true\"/>"));
    }
}
