use std::io::Read;

use pmoupnp::compression::{Codec, CompressionNegotiator};
use pmoupnp::soap::{EnvelopeReader, EnvelopeWriter, SoapMessage, parse_soap_message};

fn response_with_nulls() -> Vec<u8> {
    let mut writer = EnvelopeWriter::open(Vec::new(), true).unwrap();
    writer.start_element("u:BrowseResponse").unwrap();
    writer
        .attribute("xmlns:u", "urn:schemas-upnp-org:service:ContentDirectory:1")
        .unwrap();
    writer.write_element("Result", Some("<DIDL-Lite/>")).unwrap();
    writer.write_element("NumberReturned", None).unwrap();
    writer.write_element("TotalMatches", Some("0")).unwrap();
    writer.end_element().unwrap();
    writer.close_envelope().unwrap()
}

#[test]
fn compressed_envelope_survives_negotiation() {
    let negotiator = CompressionNegotiator::global();
    let accept = Some("deflate, gzip;q=0.5, br");
    let codec = negotiator.select_codec(accept);
    assert_eq!(codec, Some(Codec::Gzip));

    let raw = response_with_nulls();
    let mut response = http::Response::new(Vec::new());
    negotiator.write_body(codec, accept, &raw, &mut response).unwrap();

    let content_encoding = response
        .headers()
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut decoded = Vec::new();
    negotiator
        .read_body(content_encoding.as_deref(), response.body().as_slice())
        .unwrap()
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, raw);

    match parse_soap_message(&decoded).unwrap() {
        SoapMessage::Action(action) => {
            assert_eq!(action.get("Result"), Some("<DIDL-Lite/>"));
            assert!(action.is_null("NumberReturned"));
            assert_eq!(action.get("TotalMatches"), Some("0"));
        }
        SoapMessage::Fault(fault) => panic!("unexpected fault {}", fault),
    }
}

#[test]
fn reader_stays_positioned_after_null_marker() {
    let raw = response_with_nulls();
    let mut reader = EnvelopeReader::new(raw.as_slice());
    reader.open().unwrap();

    assert!(!reader.read_empty_element(Some("BrowseResponse")).unwrap());
    assert_eq!(
        reader.read_optional_string(Some("Result")).unwrap().as_deref(),
        Some("<DIDL-Lite/>")
    );
    assert!(reader.read_null_marker().unwrap());
    assert_eq!(reader.read_element_string(Some("TotalMatches")).unwrap(), "0");
    reader.read_end_element().unwrap();
    reader.close().unwrap();
}
