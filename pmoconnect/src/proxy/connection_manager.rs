use super::{ServiceProxy, required, required_number, split_list};
use crate::errors::ProxyError;

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolInfo {
    /// protocolInfo "source" (séparés par virgule dans UPnP)
    pub source: Vec<String>,
    /// protocolInfo "sink"
    pub sink: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub rcs_id: i32,
    pub av_transport_id: i32,
    pub protocol_info: String,
    pub peer_connection_manager: String,
    pub peer_connection_id: i32,
    pub direction: String,
    pub status: String,
}

/// Proxy du service ConnectionManager
#[derive(Debug, Clone)]
pub struct ConnectionManagerProxy {
    service: ServiceProxy,
}

impl ConnectionManagerProxy {
    pub fn new(service: ServiceProxy) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ServiceProxy {
        &self.service
    }

    /// GetProtocolInfo
    pub fn get_protocol_info(&self) -> Result<ProtocolInfo, ProxyError> {
        let response = self.service.invoke("GetProtocolInfo", &[])?;
        Ok(ProtocolInfo {
            source: split_list(response.get("Source").unwrap_or_default()),
            sink: split_list(response.get("Sink").unwrap_or_default()),
        })
    }

    /// GetCurrentConnectionIDs
    pub fn get_current_connection_ids(&self) -> Result<Vec<i32>, ProxyError> {
        let response = self.service.invoke("GetCurrentConnectionIDs", &[])?;
        let ids = response.get("ConnectionIDs").unwrap_or_default();
        split_list(ids)
            .iter()
            .map(|value| {
                value
                    .parse::<i32>()
                    .map_err(|_| ProxyError::bad_return_value("ConnectionIDs", value))
            })
            .collect()
    }

    /// GetCurrentConnectionInfo
    pub fn get_current_connection_info(
        &self,
        connection_id: i32,
    ) -> Result<ConnectionInfo, ProxyError> {
        let connection_id = connection_id.to_string();
        let response = self
            .service
            .invoke("GetCurrentConnectionInfo", &[("ConnectionID", &connection_id)])?;

        Ok(ConnectionInfo {
            rcs_id: required_number(&response, "RcsID")?,
            av_transport_id: required_number(&response, "AVTransportID")?,
            protocol_info: response.get("ProtocolInfo").unwrap_or_default().to_string(),
            peer_connection_manager: response
                .get("PeerConnectionManager")
                .unwrap_or_default()
                .to_string(),
            peer_connection_id: required_number(&response, "PeerConnectionID")?,
            direction: required(&response, "Direction")?.to_string(),
            status: required(&response, "Status")?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ServiceDescription;
    use pmoupnp::soap::build_soap_response;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const CM_TYPE: &str = "urn:schemas-upnp-org:service:ConnectionManager:1";

    fn proxy(server: &mockito::Server) -> ConnectionManagerProxy {
        ConnectionManagerProxy::new(ServiceProxy::new(
            ServiceDescription {
                service_type: CM_TYPE.to_string(),
                service_id: "urn:upnp-org:serviceId:ConnectionManager".to_string(),
                control_url: format!("{}/ctl/ConnectionMgr", server.url()),
                event_sub_url: String::new(),
            },
            Arc::new(AtomicBool::new(true)),
            Duration::from_secs(5),
        ))
    }

    #[test]
    fn test_get_protocol_info() {
        let mut server = mockito::Server::new();
        let body = build_soap_response(
            CM_TYPE,
            "GetProtocolInfo",
            &[
                ("Source", Some("http-get:*:audio/flac:*, http-get:*:audio/mpeg:*")),
                ("Sink", Some("")),
            ],
        )
        .unwrap();
        let _mock = server
            .mock("POST", "/ctl/ConnectionMgr")
            .with_body(body)
            .create();

        let info = proxy(&server).get_protocol_info().unwrap();
        assert_eq!(info.source, vec!["http-get:*:audio/flac:*", "http-get:*:audio/mpeg:*"]);
        assert!(info.sink.is_empty());
    }

    #[test]
    fn test_get_current_connection_ids() {
        let mut server = mockito::Server::new();
        let body =
            build_soap_response(CM_TYPE, "GetCurrentConnectionIDs", &[("ConnectionIDs", Some("0, 4"))])
                .unwrap();
        let _mock = server
            .mock("POST", "/ctl/ConnectionMgr")
            .with_body(body)
            .create();

        assert_eq!(proxy(&server).get_current_connection_ids().unwrap(), vec![0, 4]);
    }

    #[test]
    fn test_bad_connection_info() {
        let mut server = mockito::Server::new();
        let body = build_soap_response(
            CM_TYPE,
            "GetCurrentConnectionInfo",
            &[
                ("RcsID", Some("-1")),
                ("AVTransportID", Some("x")),
                ("PeerConnectionID", Some("-1")),
                ("Direction", Some("Output")),
                ("Status", Some("OK")),
            ],
        )
        .unwrap();
        let _mock = server
            .mock("POST", "/ctl/ConnectionMgr")
            .with_body(body)
            .create();

        let err = proxy(&server).get_current_connection_info(0).unwrap_err();
        assert!(matches!(err, ProxyError::BadReturnValue(name, _) if name == "AVTransportID"));
    }
}
