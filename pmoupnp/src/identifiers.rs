//! Parsers pour les identifiants UPnP.
//!
//! - USN : `uuid:<device-id>::<reste>`
//! - URN type/version : `urn:<type>:<version>`
//! - UDN : `uuid:<device-id>`
//! - chaînes d'agent (`SERVER`, `USER-AGENT`) contenant un jeton `UPnP/<major>.<minor>`
//!
//! Toutes les fonctions sont pures et retournent une erreur explicite en cas
//! d'entrée malformée.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

const UUID_PREFIX: &str = "uuid:";
const URN_PREFIX: &str = "urn:";
const USN_SEPARATOR: &str = "::";
const UPNP_TOKEN: &str = "UPnP/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("USN '{usn}' is malformed: {reason}")]
    InvalidUsn { usn: String, reason: &'static str },

    #[error("URN '{0}' is not of the form urn:<type>:<version>")]
    InvalidUrn(String),

    #[error("Version '{version}' of URN '{urn}' is not an integer")]
    InvalidUrnVersion { urn: String, version: String },

    #[error("UDN '{0}' does not start with 'uuid:'")]
    MissingUuidPrefix(String),

    #[error("Agent string '{0}' carries no valid UPnP version token")]
    InvalidAgentString(String),

    #[error("Unsupported UPnP major version {major} in '{agent}'")]
    UnsupportedMajorVersion { agent: String, major: u32 },
}

/// Politique de lecture des versions dans les chaînes d'agent.
///
/// Beaucoup d'équipements annoncent des chaînes `SERVER` fantaisistes ; en mode
/// [`VersionPolicy::Lax`], une chaîne sans jeton `UPnP/x.y` lisible est
/// considérée comme UPnP 1.0 au lieu d'être rejetée. Une version majeure
/// différente de 1 est refusée dans les deux modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    Strict,
    #[default]
    Lax,
}

impl VersionPolicy {
    pub fn from_lax(lax: bool) -> Self {
        if lax {
            VersionPolicy::Lax
        } else {
            VersionPolicy::Strict
        }
    }
}

/// USN découpé en identifiant de device et reste (type de service ou de device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usn<'a> {
    pub device_id: &'a str,
    pub remainder: &'a str,
}

/// Découpe un USN `uuid:<device-id>::<reste>`.
///
/// Le préfixe `uuid:` et le séparateur `::` sont obligatoires, et l'identifiant
/// du device ne peut pas être vide.
///
/// # Examples
///
/// ```
/// use pmoupnp::identifiers::parse_usn;
///
/// let usn = parse_usn("uuid:1234::urn:schemas:service:Foo:1").unwrap();
/// assert_eq!(usn.device_id, "1234");
/// assert_eq!(usn.remainder, "urn:schemas:service:Foo:1");
/// assert!(parse_usn("uuid:::x").is_err());
/// ```
pub fn parse_usn(usn: &str) -> Result<Usn<'_>, IdentifierError> {
    let invalid = |reason| IdentifierError::InvalidUsn {
        usn: usn.to_string(),
        reason,
    };

    let rest = strip_prefix_ignore_case(usn, UUID_PREFIX).ok_or_else(|| invalid("missing 'uuid:' prefix"))?;
    let separator = rest
        .find(USN_SEPARATOR)
        .ok_or_else(|| invalid("missing '::' separator"))?;

    let device_id = &rest[..separator];
    if device_id.is_empty() {
        return Err(invalid("empty device id"));
    }

    Ok(Usn {
        device_id,
        remainder: &rest[separator + USN_SEPARATOR.len()..],
    })
}

/// Découpe une URN `urn:<type>:<version>` en `(type, version)`.
///
/// Le type conserve ses `:` internes ; la version est ce qui suit le dernier
/// `:` et doit être un entier.
pub fn parse_type_version_urn(urn: &str) -> Result<(&str, u32), IdentifierError> {
    let rest = strip_prefix_ignore_case(urn, URN_PREFIX)
        .ok_or_else(|| IdentifierError::InvalidUrn(urn.to_string()))?;
    let colon = rest
        .rfind(':')
        .ok_or_else(|| IdentifierError::InvalidUrn(urn.to_string()))?;

    let type_part = &rest[..colon];
    if type_part.is_empty() {
        return Err(IdentifierError::InvalidUrn(urn.to_string()));
    }

    let version_text = &rest[colon + 1..];
    let version = version_text
        .parse::<u32>()
        .map_err(|_| IdentifierError::InvalidUrnVersion {
            urn: urn.to_string(),
            version: version_text.to_string(),
        })?;

    Ok((type_part, version))
}

/// Retire le préfixe obligatoire `uuid:` d'un UDN.
pub fn extract_uuid_from_udn(udn: &str) -> Result<&str, IdentifierError> {
    strip_prefix_ignore_case(udn.trim(), UUID_PREFIX)
        .ok_or_else(|| IdentifierError::MissingUuidPrefix(udn.to_string()))
}

/// Extrait la version mineure UPnP d'une chaîne d'agent.
///
/// La chaîne doit contenir un jeton `UPnP/1.<minor>`, par exemple
/// `Linux/6.1 UPnP/1.1 PMOMusic/0.2`. En mode [`VersionPolicy::Lax`], un
/// jeton absent ou illisible donne la version mineure 0.
pub fn parse_protocol_version_from_agent_string(
    agent: &str,
    policy: VersionPolicy,
) -> Result<u32, IdentifierError> {
    match parse_upnp_token(agent) {
        Some((1, minor)) => Ok(minor),
        Some((major, _)) => Err(IdentifierError::UnsupportedMajorVersion {
            agent: agent.to_string(),
            major,
        }),
        None => match policy {
            VersionPolicy::Lax => Ok(0),
            VersionPolicy::Strict => Err(IdentifierError::InvalidAgentString(agent.to_string())),
        },
    }
}

fn parse_upnp_token(agent: &str) -> Option<(u32, u32)> {
    let token = agent
        .split(|c: char| c.is_whitespace() || c == ',')
        .find_map(|token| strip_prefix_ignore_case(token, UPNP_TOKEN))?;
    let (major, minor) = token.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

/// Identifiant stable d'un pair (l'UUID de son UDN).
///
/// Deux identifiants sont égaux si leurs formes canoniques le sont : un UUID
/// valide est normalisé (minuscules, avec tirets), toute autre chaîne est
/// comparée sans tenir compte de la casse. Le texte d'origine est conservé pour
/// l'affichage.
#[derive(Debug, Clone)]
pub struct PeerIdentifier {
    raw: String,
    canonical: String,
}

impl PeerIdentifier {
    /// Construit un identifiant depuis un UUID, avec ou sans préfixe `uuid:`.
    pub fn new(text: &str) -> Self {
        let trimmed = text.trim();
        let raw = strip_prefix_ignore_case(trimmed, UUID_PREFIX).unwrap_or(trimmed);
        let canonical = match Uuid::parse_str(raw) {
            Ok(uuid) => uuid.hyphenated().to_string(),
            Err(_) => raw.to_ascii_lowercase(),
        };
        Self {
            raw: raw.to_string(),
            canonical,
        }
    }

    /// Construit un identifiant depuis un UDN (`uuid:` obligatoire).
    pub fn from_udn(udn: &str) -> Result<Self, IdentifierError> {
        extract_uuid_from_udn(udn).map(Self::new)
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    pub fn to_udn(&self) -> String {
        format!("{}{}", UUID_PREFIX, self.raw)
    }
}

impl PartialEq for PeerIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for PeerIdentifier {}

impl Hash for PeerIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for PeerIdentifier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usn() {
        let usn = parse_usn("uuid:1234::urn:schemas:service:Foo:1").unwrap();
        assert_eq!(usn.device_id, "1234");
        assert_eq!(usn.remainder, "urn:schemas:service:Foo:1");

        let usn = parse_usn("UUID:abcd::upnp:rootdevice").unwrap();
        assert_eq!(usn.device_id, "abcd");
        assert_eq!(usn.remainder, "upnp:rootdevice");
    }

    #[test]
    fn test_parse_usn_rejects_malformed() {
        assert!(matches!(
            parse_usn("not-a-usn"),
            Err(IdentifierError::InvalidUsn { .. })
        ));
        assert!(parse_usn("uuid:::x").is_err());
        assert!(parse_usn("uuid:1234").is_err());
        assert!(parse_usn("").is_err());
    }

    #[test]
    fn test_parse_type_version_urn() {
        assert_eq!(
            parse_type_version_urn("urn:schemas-upnp-org:device:MediaServer:1").unwrap(),
            ("schemas-upnp-org:device:MediaServer", 1)
        );
        assert_eq!(
            parse_type_version_urn("urn:schemas-upnp-org:service:ContentDirectory:4").unwrap(),
            ("schemas-upnp-org:service:ContentDirectory", 4)
        );
        assert!(matches!(
            parse_type_version_urn("urn:schemas-upnp-org:device:MediaServer:x"),
            Err(IdentifierError::InvalidUrnVersion { .. })
        ));
        assert!(parse_type_version_urn("schemas-upnp-org:device:MediaServer:1").is_err());
        assert!(parse_type_version_urn("urn:1").is_err());
    }

    #[test]
    fn test_extract_uuid_from_udn() {
        assert_eq!(extract_uuid_from_udn("uuid:abc-def").unwrap(), "abc-def");
        assert_eq!(
            extract_uuid_from_udn("abc-def"),
            Err(IdentifierError::MissingUuidPrefix("abc-def".to_string()))
        );
    }

    #[test]
    fn test_agent_string_versions() {
        let agent = "Linux/6.1 UPnP/1.1 PMOMusic/0.2";
        assert_eq!(
            parse_protocol_version_from_agent_string(agent, VersionPolicy::Strict).unwrap(),
            1
        );
        assert_eq!(
            parse_protocol_version_from_agent_string("Windows, UPnP/1.0, DLNADOC/1.50", VersionPolicy::Strict)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_agent_string_lax_and_strict() {
        let broken = "SomeBox/2.0 UPnP/one";
        assert_eq!(
            parse_protocol_version_from_agent_string(broken, VersionPolicy::Lax).unwrap(),
            0
        );
        assert!(matches!(
            parse_protocol_version_from_agent_string(broken, VersionPolicy::Strict),
            Err(IdentifierError::InvalidAgentString(_))
        ));
        // Une version majeure inconnue est refusée même en mode lax
        assert!(matches!(
            parse_protocol_version_from_agent_string("Box UPnP/2.0", VersionPolicy::Lax),
            Err(IdentifierError::UnsupportedMajorVersion { major: 2, .. })
        ));
    }

    #[test]
    fn test_peer_identifier_equality() {
        let a = PeerIdentifier::new("uuid:6F9A3C2E-0000-4000-8000-00AABBCCDDEE");
        let b = PeerIdentifier::new("6f9a3c2e-0000-4000-8000-00aabbccddee");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "6f9a3c2e-0000-4000-8000-00aabbccddee");
        assert_eq!(a.raw(), "6F9A3C2E-0000-4000-8000-00AABBCCDDEE");
        assert_eq!(b.to_udn(), "uuid:6f9a3c2e-0000-4000-8000-00aabbccddee");

        let custom = PeerIdentifier::new("MyDevice-1");
        assert_eq!(custom, PeerIdentifier::new("mydevice-1"));
        assert_ne!(custom, a);
    }

    #[test]
    fn test_peer_identifier_from_udn() {
        assert!(PeerIdentifier::from_udn("1234").is_err());
        assert_eq!(PeerIdentifier::from_udn("uuid:1234").unwrap().as_str(), "1234");
    }
}
