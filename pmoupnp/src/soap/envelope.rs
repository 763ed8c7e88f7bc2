//! Écriture et lecture des enveloppes SOAP.
//!
//! [`EnvelopeWriter`] produit le cadre `Envelope`/`Body`, les éléments
//! d'arguments et le marqueur de valeur nulle (`xsi:nil="true"`).
//! [`EnvelopeReader`] parcourt un corps reçu nœud par nœud, sans connaître
//! les arguments de l'action.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Error as XmlError, Reader, Writer};
use thiserror::Error;

pub const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

const NIL_ATTRIBUTE: &str = "xsi:nil";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] XmlError),

    #[error("Invalid escape sequence: {0}")]
    Escape(#[from] quick_xml::escape::EscapeError),

    #[error("Envelope is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Unknown entity '&{0};'")]
    UnknownEntity(String),

    #[error("Missing SOAP Envelope")]
    MissingEnvelope,

    #[error("Missing SOAP Body")]
    MissingBody,

    #[error("No action found in SOAP Body")]
    NoAction,

    #[error("Expected {expected}, found {found}")]
    UnexpectedNode { expected: String, found: String },

    #[error("Unexpected end of document")]
    UnexpectedEof,

    #[error("No element is open")]
    NoOpenElement,

    #[error("Elements left open when closing the envelope: {0:?}")]
    UnclosedElements(Vec<String>),
}

/// Écrit une enveloppe SOAP.
///
/// Un élément sans contenu est émis sous forme vide (`<a/>`), ce qui permet
/// d'ajouter des attributs, dont le marqueur nul, jusqu'au premier contenu.
pub struct EnvelopeWriter<W: Write> {
    writer: Writer<W>,
    schema_namespace: bool,
    pending: Option<BytesStart<'static>>,
    open: Vec<String>,
}

impl<W: Write> EnvelopeWriter<W> {
    /// Écrit la déclaration XML puis ouvre `s:Envelope` et `s:Body`.
    ///
    /// Avec `include_schema_namespace`, le préfixe `xsi` est déclaré sur
    /// l'enveloppe.
    pub fn open(inner: W, include_schema_namespace: bool) -> Result<Self, EnvelopeError> {
        let mut writer = Writer::new(inner);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

        let mut envelope = BytesStart::new("s:Envelope");
        envelope.push_attribute(("xmlns:s", SOAP_ENVELOPE_NS));
        envelope.push_attribute(("s:encodingStyle", SOAP_ENCODING_STYLE));
        if include_schema_namespace {
            envelope.push_attribute(("xmlns:xsi", XSI_NS));
        }
        writer.write_event(Event::Start(envelope))?;
        writer.write_event(Event::Start(BytesStart::new("s:Body")))?;

        Ok(Self {
            writer,
            schema_namespace: include_schema_namespace,
            pending: None,
            open: Vec::new(),
        })
    }

    fn flush_pending(&mut self) -> Result<(), EnvelopeError> {
        if let Some(start) = self.pending.take() {
            self.writer.write_event(Event::Start(start))?;
        }
        Ok(())
    }

    pub fn start_element(&mut self, name: &str) -> Result<(), EnvelopeError> {
        self.flush_pending()?;
        self.pending = Some(BytesStart::new(name.to_string()));
        self.open.push(name.to_string());
        Ok(())
    }

    /// Ajoute un attribut à l'élément courant, tant qu'il n'a pas de contenu.
    pub fn attribute(&mut self, name: &str, value: &str) -> Result<(), EnvelopeError> {
        let start = self.pending.as_mut().ok_or(EnvelopeError::NoOpenElement)?;
        start.push_attribute((name, value));
        Ok(())
    }

    /// Marque l'élément courant comme valeur absente.
    pub fn write_null_marker(&mut self) -> Result<(), EnvelopeError> {
        if !self.schema_namespace {
            self.attribute("xmlns:xsi", XSI_NS)?;
        }
        self.attribute(NIL_ATTRIBUTE, "true")
    }

    pub fn write_text(&mut self, text: &str) -> Result<(), EnvelopeError> {
        if self.open.is_empty() {
            return Err(EnvelopeError::NoOpenElement);
        }
        self.flush_pending()?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        Ok(())
    }

    pub fn end_element(&mut self) -> Result<(), EnvelopeError> {
        let name = self.open.pop().ok_or(EnvelopeError::NoOpenElement)?;
        match self.pending.take() {
            Some(start) => self.writer.write_event(Event::Empty(start))?,
            None => self.writer.write_event(Event::End(BytesEnd::new(name)))?,
        }
        Ok(())
    }

    /// Écrit `<name>value</name>`, ou l'élément marqué nul si `value` est absent.
    pub fn write_element(&mut self, name: &str, value: Option<&str>) -> Result<(), EnvelopeError> {
        self.start_element(name)?;
        match value {
            Some(text) if !text.is_empty() => self.write_text(text)?,
            Some(_) => {}
            None => self.write_null_marker()?,
        }
        self.end_element()
    }

    /// Ferme `s:Body` et `s:Envelope` et rend le flux sous-jacent.
    ///
    /// L'écrivain est consommé : plus rien ne peut être écrit dans l'enveloppe.
    pub fn close_envelope(mut self) -> Result<W, EnvelopeError> {
        if !self.open.is_empty() {
            return Err(EnvelopeError::UnclosedElements(std::mem::take(&mut self.open)));
        }
        self.writer.write_event(Event::End(BytesEnd::new("s:Body")))?;
        self.writer.write_event(Event::End(BytesEnd::new("s:Envelope")))?;
        let mut inner = self.writer.into_inner();
        inner.flush()?;
        Ok(inner)
    }
}

/// Élément lu : nom qualifié, nom local et attributs (valeurs déséchappées).
#[derive(Debug, Clone, PartialEq)]
pub struct ElementInfo {
    pub name: String,
    pub local_name: String,
    pub attributes: Vec<(String, String)>,
}

impl ElementInfo {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, EnvelopeError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let local_name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(XmlError::InvalidAttr)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let raw = String::from_utf8_lossy(&attr.value);
            attributes.push((key, unescape(&raw)?.into_owned()));
        }
        Ok(Self {
            name,
            local_name,
            attributes,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Espace de noms associé au préfixe de l'élément (ou l'espace par défaut).
    pub fn namespace(&self) -> Option<&str> {
        let key = match self.name.split_once(':') {
            Some((prefix, _)) => format!("xmlns:{}", prefix),
            None => "xmlns".to_string(),
        };
        self.attribute(&key)
    }

    /// Vrai si l'élément porte `nil="true"` (quel que soit le préfixe).
    pub fn is_nil(&self) -> bool {
        self.attributes.iter().any(|(key, value)| {
            let local = key.rsplit(':').next().unwrap_or(key);
            local == "nil" && !key.starts_with("xmlns") && matches!(value.trim(), "true" | "1")
        })
    }

    fn matches(&self, name: Option<&str>) -> bool {
        match name {
            None => true,
            Some(expected) => self.local_name == expected || self.name == expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Start(ElementInfo),
    Empty(ElementInfo),
    Text(String),
    End(String),
    Eof,
}

impl Node {
    fn describe(&self) -> String {
        match self {
            Node::Start(el) => format!("start of <{}>", el.name),
            Node::Empty(el) => format!("empty <{}/>", el.name),
            Node::Text(text) => format!("text '{}'", text.trim()),
            Node::End(name) => format!("end of </{}>", name),
            Node::Eof => "end of document".to_string(),
        }
    }

    fn is_blank_text(&self) -> bool {
        matches!(self, Node::Text(text) if text.trim().is_empty())
    }
}

fn unexpected(expected: &str, found: &Node) -> EnvelopeError {
    match found {
        Node::Eof => EnvelopeError::UnexpectedEof,
        other => EnvelopeError::UnexpectedNode {
            expected: expected.to_string(),
            found: other.describe(),
        },
    }
}

/// Lit une enveloppe SOAP.
///
/// Le texte adjacent (y compris entités et CDATA) est fusionné en un seul
/// nœud ; les nœuds de texte blancs entre éléments sont ignorés.
pub struct EnvelopeReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    queue: VecDeque<Node>,
    depth: usize,
    body_open: bool,
}

impl<R: BufRead> EnvelopeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: Reader::from_reader(inner),
            buf: Vec::new(),
            queue: VecDeque::new(),
            depth: 0,
            body_open: false,
        }
    }

    fn fill(&mut self) -> Result<(), EnvelopeError> {
        if !self.queue.is_empty() {
            return Ok(());
        }
        let mut text: Option<String> = None;
        loop {
            self.buf.clear();
            let node = match self.reader.read_event_into(&mut self.buf)? {
                Event::Text(e) => {
                    let decoded = e.decode().map_err(XmlError::Encoding)?;
                    text.get_or_insert_with(String::new).push_str(&decoded);
                    continue;
                }
                Event::CData(e) => {
                    let decoded = e.decode().map_err(XmlError::Encoding)?;
                    text.get_or_insert_with(String::new).push_str(&decoded);
                    continue;
                }
                Event::GeneralRef(e) => {
                    let value = text.get_or_insert_with(String::new);
                    if let Some(ch) = e.resolve_char_ref()? {
                        value.push(ch);
                    } else {
                        let entity = e.decode().map_err(XmlError::Encoding)?;
                        match resolve_predefined_entity(&entity) {
                            Some(resolved) => value.push_str(resolved),
                            None => return Err(EnvelopeError::UnknownEntity(entity.into_owned())),
                        }
                    }
                    continue;
                }
                Event::Start(e) => Node::Start(ElementInfo::from_start(&e)?),
                Event::Empty(e) => Node::Empty(ElementInfo::from_start(&e)?),
                Event::End(e) => Node::End(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
                Event::Eof => Node::Eof,
                _ => continue,
            };
            if let Some(text) = text.take() {
                self.queue.push_back(Node::Text(text));
            }
            self.queue.push_back(node);
            return Ok(());
        }
    }

    fn peek_node(&mut self) -> Result<&Node, EnvelopeError> {
        self.fill()?;
        self.queue.front().ok_or(EnvelopeError::UnexpectedEof)
    }

    fn next_node(&mut self) -> Result<Node, EnvelopeError> {
        self.fill()?;
        let node = self.queue.pop_front().ok_or(EnvelopeError::UnexpectedEof)?;
        match &node {
            Node::Start(_) => self.depth += 1,
            Node::End(_) => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        Ok(node)
    }

    fn skip_blank(&mut self) -> Result<(), EnvelopeError> {
        while self.peek_node()?.is_blank_text() {
            self.next_node()?;
        }
        Ok(())
    }

    fn peek_structural(&mut self) -> Result<&Node, EnvelopeError> {
        self.skip_blank()?;
        self.peek_node()
    }

    /// Lit le cadre `Envelope`, saute un éventuel `Header`, et se positionne
    /// sur le premier enfant de `Body`.
    pub fn open(&mut self) -> Result<(), EnvelopeError> {
        match self.next_structural()? {
            Node::Start(el) if el.local_name == "Envelope" => {}
            _ => return Err(EnvelopeError::MissingEnvelope),
        }
        loop {
            match self.next_structural()? {
                Node::Start(el) if el.local_name == "Header" => self.skip_to_depth(1)?,
                Node::Empty(el) if el.local_name == "Header" => {}
                Node::Start(el) if el.local_name == "Body" => {
                    self.body_open = true;
                    return Ok(());
                }
                Node::Empty(el) if el.local_name == "Body" => return Ok(()),
                _ => return Err(EnvelopeError::MissingBody),
            }
        }
    }

    fn next_structural(&mut self) -> Result<Node, EnvelopeError> {
        self.skip_blank()?;
        self.next_node()
    }

    /// Consomme des nœuds jusqu'à revenir à la profondeur `depth`.
    fn skip_to_depth(&mut self, depth: usize) -> Result<(), EnvelopeError> {
        while self.depth > depth {
            if let Node::Eof = self.next_node()? {
                return Err(EnvelopeError::UnexpectedEof);
            }
        }
        Ok(())
    }

    /// Élément suivant, sans le consommer. `None` si le parent se ferme.
    pub fn peek_element(&mut self) -> Result<Option<ElementInfo>, EnvelopeError> {
        match self.peek_structural()? {
            Node::Start(el) | Node::Empty(el) => Ok(Some(el.clone())),
            Node::End(_) => Ok(None),
            other => Err(unexpected("element", other)),
        }
    }

    /// Vrai si l'élément suivant porte le marqueur nul.
    pub fn is_null_marker(&mut self) -> Result<bool, EnvelopeError> {
        match self.peek_structural()? {
            Node::Start(el) | Node::Empty(el) => Ok(el.is_nil()),
            _ => Ok(false),
        }
    }

    /// Consomme entièrement l'élément suivant s'il porte le marqueur nul.
    ///
    /// Les formes `<a xsi:nil="true"/>` et `<a xsi:nil="true"></a>` sont
    /// acceptées ; un contenu éventuel est ignoré. Retourne `false` sans rien
    /// consommer si l'élément n'est pas nul.
    pub fn read_null_marker(&mut self) -> Result<bool, EnvelopeError> {
        if !self.is_null_marker()? {
            return Ok(false);
        }
        self.skip_element()?;
        Ok(true)
    }

    /// Consomme la balise ouvrante de l'élément suivant et indique s'il était
    /// vide (`<a/>`).
    ///
    /// Si l'élément n'est pas vide, l'appelant doit lire son contenu puis
    /// appeler [`read_end_element`](Self::read_end_element).
    pub fn read_empty_element(&mut self, name: Option<&str>) -> Result<bool, EnvelopeError> {
        match self.peek_structural()? {
            Node::Start(el) | Node::Empty(el) if el.matches(name) => {}
            other => return Err(unexpected(&expected_element(name), other)),
        }
        Ok(matches!(self.next_node()?, Node::Empty(_)))
    }

    /// Consomme la balise ouvrante d'un élément non vide.
    pub fn read_start_element(&mut self, name: Option<&str>) -> Result<ElementInfo, EnvelopeError> {
        match self.next_structural()? {
            Node::Start(el) if el.matches(name) => Ok(el),
            other => Err(unexpected(&format!("start of {}", expected_element(name)), &other)),
        }
    }

    /// Lit le texte d'un élément simple : `<a>texte</a>` ou `<a/>` (chaîne vide).
    pub fn read_element_string(&mut self, name: Option<&str>) -> Result<String, EnvelopeError> {
        match self.next_structural()? {
            Node::Empty(el) if el.matches(name) => Ok(String::new()),
            Node::Start(el) if el.matches(name) => {
                let mut value = String::new();
                loop {
                    match self.next_node()? {
                        Node::Text(text) => value.push_str(&text),
                        Node::End(_) => return Ok(value),
                        other => return Err(unexpected(&format!("text of <{}>", el.name), &other)),
                    }
                }
            }
            other => Err(unexpected(&expected_element(name), &other)),
        }
    }

    /// Lit un argument pouvant porter le marqueur nul.
    pub fn read_optional_string(&mut self, name: Option<&str>) -> Result<Option<String>, EnvelopeError> {
        if self.read_null_marker()? {
            return Ok(None);
        }
        self.read_element_string(name).map(Some)
    }

    /// Consomme la balise fermante attendue ; retourne son nom.
    pub fn read_end_element(&mut self) -> Result<String, EnvelopeError> {
        match self.next_structural()? {
            Node::End(name) => Ok(name),
            other => Err(unexpected("end element", &other)),
        }
    }

    /// Consomme entièrement l'élément suivant, enfants compris.
    pub fn skip_element(&mut self) -> Result<(), EnvelopeError> {
        let depth = self.depth;
        match self.next_structural()? {
            Node::Empty(_) => Ok(()),
            Node::Start(_) => self.skip_to_depth(depth),
            other => Err(unexpected("element", &other)),
        }
    }

    /// Termine la lecture : les éléments restants du corps sont ignorés, puis
    /// `Body` et `Envelope` doivent se fermer.
    pub fn close(mut self) -> Result<(), EnvelopeError> {
        if self.body_open {
            // Profondeur 2 : à l'intérieur de Envelope et Body
            self.skip_to_depth(2)?;
            while self.peek_element()?.is_some() {
                self.skip_element()?;
            }
            self.read_end_element()?;
        }
        match self.next_structural()? {
            Node::End(name) if local(&name) == "Envelope" => Ok(()),
            other => Err(unexpected("end of Envelope", &other)),
        }
    }
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn expected_element(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("<{}>", name),
        None => "an element".to_string(),
    }
}
