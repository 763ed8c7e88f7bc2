//! Négociation de la compression des corps HTTP (`Accept-Encoding` / `Content-Encoding`).
//!
//! La liste des codecs supportés est une table statique, ordonnée par
//! préférence locale : le premier codec supporté que le pair accepte est
//! choisi, quel que soit l'ordre dans lequel le pair les liste.
//!
//! Les corps sont toujours compressés entièrement en mémoire avant d'être
//! écrits, de sorte que `Content-Length` est exact.

use std::io::{self, Cursor, Read, Write};

use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, HeaderName, HeaderValue, VARY};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("{codec} compression failed: {source}")]
    Compress {
        codec: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{codec} decompression failed: {source}")]
    Decompress {
        codec: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read body: {0}")]
    Read(#[from] io::Error),
}

/// Codec de compression supporté. L'absence de codec signifie `identity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Gzip,
    Deflate,
}

impl Codec {
    /// Nom du codec tel qu'il apparaît dans les en-têtes HTTP.
    pub fn name(self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Deflate => "deflate",
        }
    }

    pub fn from_name(name: &str) -> Option<Codec> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Codec::Gzip),
            "deflate" => Some(Codec::Deflate),
            _ => None,
        }
    }

    /// Compresse `data` dans un nouveau tampon.
    ///
    /// `deflate` est produit au format zlib (RFC 1950), comme l'exige HTTP.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let wrap = |source| CompressionError::Compress {
            codec: self.name(),
            source,
        };
        match self {
            Codec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).map_err(wrap)?;
                encoder.finish().map_err(wrap)
            }
            Codec::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data).map_err(wrap)?;
                encoder.finish().map_err(wrap)
            }
        }
    }

    /// Décompresse entièrement `data`.
    ///
    /// Pour `deflate`, les flux zlib et les flux deflate bruts (envoyés par
    /// certains serveurs) sont acceptés.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let result = match self {
            Codec::Gzip => GzDecoder::new(data).read_to_end(&mut out),
            Codec::Deflate if has_zlib_header(data) => ZlibDecoder::new(data).read_to_end(&mut out),
            Codec::Deflate => DeflateDecoder::new(data).read_to_end(&mut out),
        };
        result.map_err(|source| CompressionError::Decompress {
            codec: self.name(),
            source,
        })?;
        Ok(out)
    }
}

fn has_zlib_header(data: &[u8]) -> bool {
    match data {
        [cmf, flg, ..] => (cmf & 0x0f) == 8 && ((u16::from(*cmf) << 8) | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

/// Ordre de préférence par défaut.
pub const DEFAULT_CODECS: &[Codec] = &[Codec::Gzip, Codec::Deflate];

static GLOBAL_NEGOTIATOR: CompressionNegotiator = CompressionNegotiator::new(DEFAULT_CODECS);

/// Corps de réponse HTTP en cours de construction.
pub trait BodySink {
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);
    fn set_body(&mut self, body: Vec<u8>);
}

impl BodySink for http::Response<Vec<u8>> {
    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers_mut().insert(name, value);
    }

    fn set_body(&mut self, body: Vec<u8>) {
        *self.body_mut() = body;
    }
}

/// Flux retourné par [`CompressionNegotiator::read_body`].
pub enum BodyReader<R> {
    /// Le flux d'origine, sans transformation.
    Plain(R),
    /// Le corps décompressé, entièrement en mémoire.
    Decoded(Cursor<Vec<u8>>),
}

impl<R: Read> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Plain(inner) => inner.read(buf),
            BodyReader::Decoded(cursor) => cursor.read(buf),
        }
    }
}

/// Entrée d'un en-tête `Accept-Encoding`.
#[derive(Debug, PartialEq)]
struct AcceptedEncoding {
    name: String,
    refused: bool,
}

fn parse_accept_encoding(header: &str) -> Vec<AcceptedEncoding> {
    header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let name = parts.next()?.trim().to_ascii_lowercase();
            if name.is_empty() {
                return None;
            }
            let refused = parts.any(|param| {
                let param = param.trim();
                match param.split_once('=') {
                    Some((key, value)) if key.trim().eq_ignore_ascii_case("q") => value
                        .trim()
                        .parse::<f32>()
                        .map(|q| q <= 0.0)
                        .unwrap_or(false),
                    _ => false,
                }
            });
            Some(AcceptedEncoding { name, refused })
        })
        .collect()
}

/// Sélectionne et applique la compression des corps HTTP.
#[derive(Debug, Clone, Copy)]
pub struct CompressionNegotiator {
    codecs: &'static [Codec],
}

impl CompressionNegotiator {
    pub const fn new(codecs: &'static [Codec]) -> Self {
        Self { codecs }
    }

    /// Négociateur partagé du processus, construit sur [`DEFAULT_CODECS`].
    pub fn global() -> &'static CompressionNegotiator {
        &GLOBAL_NEGOTIATOR
    }

    pub fn supported(&self) -> &'static [Codec] {
        self.codecs
    }

    /// Valeur à envoyer dans `Accept-Encoding` pour annoncer nos codecs.
    pub fn accept_encoding_header(&self) -> String {
        self.codecs
            .iter()
            .map(|codec| codec.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Retourne le premier codec supporté accepté par le pair.
    ///
    /// Un en-tête absent ou vide, ou sans codec commun, donne `None` (pas de
    /// compression). Les entrées `;q=0` sont considérées comme refusées et `*`
    /// accepte tout codec qui n'est pas explicitement refusé.
    pub fn select_codec(&self, accept_encoding: Option<&str>) -> Option<Codec> {
        let accepted = parse_accept_encoding(accept_encoding?);
        let wildcard = accepted.iter().any(|e| e.name == "*" && !e.refused);

        self.codecs.iter().copied().find(|codec| {
            let entry = accepted
                .iter()
                .find(|e| Codec::from_name(&e.name) == Some(*codec));
            match entry {
                Some(entry) => !entry.refused,
                None => wildcard,
            }
        })
    }

    /// Écrit `raw` dans `sink`, compressé avec `codec` s'il y en a un.
    ///
    /// `Content-Length` reçoit toujours la taille exacte des octets écrits.
    /// `Vary: Accept-Encoding` est ajouté quand le pair proposait plus d'un
    /// encodage.
    pub fn write_body<S: BodySink>(
        &self,
        codec: Option<Codec>,
        accept_encoding: Option<&str>,
        raw: &[u8],
        sink: &mut S,
    ) -> Result<(), CompressionError> {
        let body = match codec {
            None => raw.to_vec(),
            Some(codec) => {
                let compressed = codec.compress(raw)?;
                debug!(
                    codec = codec.name(),
                    raw = raw.len(),
                    compressed = compressed.len(),
                    "Body compressed"
                );
                sink.set_header(CONTENT_ENCODING, HeaderValue::from_static(codec.name()));
                let offered = accept_encoding
                    .map(|header| parse_accept_encoding(header).iter().filter(|e| !e.refused).count())
                    .unwrap_or(0);
                if offered > 1 {
                    sink.set_header(VARY, HeaderValue::from_static("Accept-Encoding"));
                }
                compressed
            }
        };

        sink.set_header(CONTENT_LENGTH, HeaderValue::from(body.len()));
        sink.set_body(body);
        Ok(())
    }

    /// Retourne un flux décompressé si `content_encoding` désigne un codec
    /// supporté, sinon le flux d'origine.
    pub fn read_body<R: Read>(
        &self,
        content_encoding: Option<&str>,
        mut stream: R,
    ) -> Result<BodyReader<R>, CompressionError> {
        let Some(codec) = self.codec_for_content_encoding(content_encoding) else {
            return Ok(BodyReader::Plain(stream));
        };
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        let decoded = codec.decompress(&raw)?;
        trace!(codec = codec.name(), size = decoded.len(), "Body decompressed");
        Ok(BodyReader::Decoded(Cursor::new(decoded)))
    }

    /// Variante de [`read_body`](Self::read_body) pour un corps déjà en mémoire.
    pub fn decode_body(
        &self,
        content_encoding: Option<&str>,
        raw: Vec<u8>,
    ) -> Result<Vec<u8>, CompressionError> {
        match self.codec_for_content_encoding(content_encoding) {
            Some(codec) => codec.decompress(&raw),
            None => Ok(raw),
        }
    }

    fn codec_for_content_encoding(&self, content_encoding: Option<&str>) -> Option<Codec> {
        let name = content_encoding?.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("identity") {
            return None;
        }
        match Codec::from_name(name).filter(|codec| self.codecs.contains(codec)) {
            Some(codec) => Some(codec),
            None => {
                debug!(content_encoding = name, "Unsupported content encoding, body left as is");
                None
            }
        }
    }
}

impl Default for CompressionNegotiator {
    fn default() -> Self {
        GLOBAL_NEGOTIATOR
    }
}
