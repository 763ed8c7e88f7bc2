//! Messages SSDP reçus et émis par un control point

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::trace;

use super::MAX_AGE;

/// Événements SSDP intéressants pour un control point
#[derive(Debug, Clone, PartialEq)]
pub enum SsdpEvent {
    Alive {
        usn: String,
        nt: String,
        location: String,
        server: String,
        max_age: u32,
        from: SocketAddr,
    },
    ByeBye {
        usn: String,
        nt: String,
        from: SocketAddr,
    },
    SearchResponse {
        usn: String,
        st: String,
        location: String,
        server: String,
        max_age: u32,
        from: SocketAddr,
    },
}

impl SsdpEvent {
    pub fn usn(&self) -> &str {
        match self {
            SsdpEvent::Alive { usn, .. }
            | SsdpEvent::ByeBye { usn, .. }
            | SsdpEvent::SearchResponse { usn, .. } => usn,
        }
    }

    /// `NT` d'une notification ou `ST` d'une réponse de recherche
    pub fn notification_type(&self) -> &str {
        match self {
            SsdpEvent::Alive { nt, .. } | SsdpEvent::ByeBye { nt, .. } => nt,
            SsdpEvent::SearchResponse { st, .. } => st,
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            SsdpEvent::Alive { location, .. } | SsdpEvent::SearchResponse { location, .. } => {
                Some(location)
            }
            SsdpEvent::ByeBye { .. } => None,
        }
    }

    pub fn server(&self) -> Option<&str> {
        match self {
            SsdpEvent::Alive { server, .. } | SsdpEvent::SearchResponse { server, .. } => {
                Some(server)
            }
            SsdpEvent::ByeBye { .. } => None,
        }
    }

    /// Adresse d'où provient le datagramme
    pub fn sender(&self) -> SocketAddr {
        match self {
            SsdpEvent::Alive { from, .. }
            | SsdpEvent::ByeBye { from, .. }
            | SsdpEvent::SearchResponse { from, .. } => *from,
        }
    }
}

/// Construit une requête M-SEARCH
///
/// * `host` - valeur de l'en-tête HOST (ex: "239.255.255.250:1900", "[ff02::c]:1900")
/// * `st` - cible de recherche (ex: "upnp:rootdevice")
/// * `mx` - délai de réponse maximal, au moins 1
pub fn build_msearch(host: &str, st: &str, mx: u32, user_agent: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         USER-AGENT: {}\r\n\
         \r\n",
        host,
        mx.max(1),
        st,
        user_agent
    )
}

/// Parse un datagramme SSDP ; `None` pour les messages ignorés ou invalides.
pub fn parse_message(data: &str, from: SocketAddr) -> Option<SsdpEvent> {
    let mut lines = data.lines();
    let first_line = lines.next()?.trim();
    let upper = first_line.to_ascii_uppercase();
    let headers = parse_headers(lines);

    let result = if upper.starts_with("NOTIFY ") {
        handle_notify(&headers, from)
    } else if upper.starts_with("HTTP/") && upper.contains(" 200 ") {
        handle_search_response(&headers, from)
    } else if upper.starts_with("M-SEARCH ") {
        // Requête d'un autre control point
        None
    } else {
        trace!("Unknown SSDP message type from {}: {}", from, first_line);
        None
    };

    if result.is_none() {
        trace!("SSDP message from {} ignored:\n{}", from, data);
    }

    result
}

fn handle_notify(headers: &HashMap<String, String>, from: SocketAddr) -> Option<SsdpEvent> {
    let nts = headers.get("NTS")?.to_ascii_lowercase();
    let nt = headers.get("NT")?.to_string();
    let usn = headers.get("USN")?.to_string();

    match nts.as_str() {
        "ssdp:alive" => {
            let Some(location) = headers.get("LOCATION") else {
                trace!("NOTIFY ssdp:alive from {} missing LOCATION header, ignoring", from);
                return None;
            };
            Some(SsdpEvent::Alive {
                usn,
                nt,
                location: location.to_string(),
                server: server_header(headers),
                max_age: parse_max_age(headers.get("CACHE-CONTROL")),
                from,
            })
        }
        "ssdp:byebye" => Some(SsdpEvent::ByeBye { usn, nt, from }),
        _ => {
            trace!("Unknown NTS value from {}: {}", from, nts);
            None
        }
    }
}

fn handle_search_response(
    headers: &HashMap<String, String>,
    from: SocketAddr,
) -> Option<SsdpEvent> {
    let (Some(st), Some(usn), Some(location)) =
        (headers.get("ST"), headers.get("USN"), headers.get("LOCATION"))
    else {
        trace!("M-SEARCH response from {} misses ST, USN or LOCATION, ignoring", from);
        return None;
    };

    Some(SsdpEvent::SearchResponse {
        usn: usn.to_string(),
        st: st.to_string(),
        location: location.to_string(),
        server: server_header(headers),
        max_age: parse_max_age(headers.get("CACHE-CONTROL")),
        from,
    })
}

fn server_header(headers: &HashMap<String, String>) -> String {
    headers
        .get("SERVER")
        .cloned()
        .unwrap_or_else(|| "Unknown".to_string())
}

fn parse_headers<'a, I>(lines: I) -> HashMap<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        // Les valeurs peuvent contenir ':' (URL)
        match line.split_once(':') {
            Some((name, value)) => {
                let name = name.trim().to_ascii_uppercase();
                let value = value.trim();
                if !name.is_empty() && !value.is_empty() {
                    headers.insert(name, value.to_string());
                } else {
                    trace!("Skipping malformed header: '{}'", line);
                }
            }
            None => trace!("Skipping line without colon: '{}'", line),
        }
    }
    headers
}

fn parse_max_age(value: Option<&String>) -> u32 {
    if let Some(v) = value {
        let lower = v.to_ascii_lowercase();
        if let Some(idx) = lower.find("max-age") {
            let after_eq = lower[idx + 7..]
                .trim_start()
                .trim_start_matches('=')
                .trim_start();
            let digits: String = after_eq.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(age) = digits.parse::<u32>() {
                return age;
            }
        }
        trace!("Could not parse max-age from CACHE-CONTROL: '{}', using default {}", v, MAX_AGE);
    }
    MAX_AGE
}
