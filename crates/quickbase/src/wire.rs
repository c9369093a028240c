//! The `<qdbapi>` XML envelope: request encoding and response decoding.
//!
//! Requests are a flat envelope with one child element per parameter.
//! Responses are decoded into a small owned tree, which is fine for the
//! bounded answers of non-query calls. Query results go through
//! [`crate::stream`] instead.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::QuickbaseError;
use crate::error::codes;
use crate::token::{Tag, text_of};

/// Name of the envelope element wrapping every request and response.
pub const ENVELOPE: &str = "qdbapi";

pub(crate) const ENVELOPE_OPEN: &[u8] = b"<qdbapi>";
pub(crate) const ENVELOPE_CLOSE: &[u8] = b"</qdbapi>";

/// Request parameters, element name to text content.
pub type Params = BTreeMap<String, String>;

/// Encode `params` as a complete request envelope.
pub fn encode(params: &Params) -> Result<Vec<u8>, QuickbaseError> {
    let mut out = Vec::with_capacity(64 + params.len() * 32);
    out.extend_from_slice(ENVELOPE_OPEN);
    for (key, value) in params {
        out.extend_from_slice(&encode_param(key, value)?);
    }
    out.extend_from_slice(ENVELOPE_CLOSE);
    Ok(out)
}

/// Write the same envelope as [`encode`] to an async writer, one parameter
/// at a time, then flush.
pub async fn write_envelope<W>(writer: &mut W, params: &Params) -> Result<(), QuickbaseError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(ENVELOPE_OPEN).await?;
    write_params(writer, params).await?;
    writer.write_all(ENVELOPE_CLOSE).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn write_params<W>(writer: &mut W, params: &Params) -> Result<(), QuickbaseError>
where
    W: AsyncWrite + Unpin,
{
    for (key, value) in params {
        writer.write_all(&encode_param(key, value)?).await?;
    }
    Ok(())
}

/// Fail if any parameter name cannot be encoded.
pub(crate) fn check_params(params: &Params) -> Result<(), QuickbaseError> {
    params.keys().try_for_each(|key| validate_name(key))
}

/// `<key>escaped value</key>`
pub(crate) fn encode_param(key: &str, value: &str) -> Result<Vec<u8>, QuickbaseError> {
    validate_name(key)?;
    Ok(format!("<{key}>{}</{key}>", escape(value)).into_bytes())
}

/// Parameter names become element names, so they must be XML names.
/// QuickBase only uses the ASCII subset.
fn validate_name(name: &str) -> Result<(), QuickbaseError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(QuickbaseError::InvalidParameter(format!(
            "{name:?} is not a valid parameter name"
        )))
    }
}

/// A decoded XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

/// Content of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn from_tag(tag: Tag) -> Self {
        Self {
            name: tag.name,
            attributes: tag.attributes,
            children: Vec::new(),
        }
    }

    /// The element's name and attributes, without its content.
    pub fn tag(&self) -> Tag {
        Tag {
            name: self.name.clone(),
            attributes: self.attributes.clone(),
        }
    }

    /// Value of the attribute `name`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Direct child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// First direct child named `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|element| element.name == name)
    }

    /// Direct children named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |element| element.name == name)
    }

    /// First descendant named `name`, depth-first in document order.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.elements().find_map(|element| {
            if element.name == name {
                Some(element)
            } else {
                element.find(name)
            }
        })
    }

    /// All descendants named `name`, depth-first in document order. Matches
    /// are not searched further.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect_named(name, &mut found);
        found
    }

    fn collect_named<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for element in self.elements() {
            if element.name == name {
                found.push(element);
            } else {
                element.collect_named(name, found);
            }
        }
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Text of the first direct child named `name`.
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text)
    }
}

/// Decode a complete document into its root element.
pub fn decode(bytes: &[u8]) -> Result<Element, QuickbaseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let completed = match event {
            Event::Start(start) => {
                stack.push(Element::from_tag(Tag::from_start(&start)?));
                None
            }
            Event::Empty(start) => Some(Element::from_tag(Tag::from_start(&start)?)),
            Event::End(_) => stack.pop(),
            Event::Text(text) => {
                let text = text_of(&text)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Text(text)),
                    None if text.trim().is_empty() => {}
                    None => {
                        return Err(QuickbaseError::Parse(
                            "text outside of the root element".to_string(),
                        ));
                    }
                }
                None
            }
            Event::CData(cdata) => {
                let text = String::from_utf8_lossy(&cdata.into_inner()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(text));
                }
                None
            }
            Event::Eof => break,
            // declarations, comments, processing instructions
            _ => None,
        };

        if let Some(element) = completed {
            match stack.last_mut() {
                Some(parent) => parent.children.push(Node::Element(element)),
                None if root.is_none() => root = Some(element),
                None => {
                    return Err(QuickbaseError::Parse(
                        "more than one root element".to_string(),
                    ));
                }
            }
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(QuickbaseError::Parse(format!(
            "document ended inside <{}>",
            open.name
        )));
    }
    root.ok_or_else(|| QuickbaseError::Parse("empty document".to_string()))
}

/// The status block embedded in every response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiStatus {
    pub code: i32,
    pub text: String,
    pub detail: Option<String>,
}

impl ApiStatus {
    pub fn is_success(&self) -> bool {
        self.code == codes::NO_ERROR
    }

    /// `Ok(())` on success, otherwise the matching [`QuickbaseError::Api`].
    pub fn into_result(self) -> Result<(), QuickbaseError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }

    pub(crate) fn into_error(self) -> QuickbaseError {
        QuickbaseError::Api {
            code: self.code,
            text: self.text,
            detail: self.detail,
        }
    }
}

/// Parse the text of an `errcode` element.
pub(crate) fn parse_code(text: &str) -> Result<i32, QuickbaseError> {
    text.trim()
        .parse()
        .map_err(|_| QuickbaseError::Protocol(format!("invalid errcode {text:?}")))
}

/// Read `errcode`, `errtext` and `errdetail` from a response root.
pub fn status_of(root: &Element) -> Result<ApiStatus, QuickbaseError> {
    let code = root
        .child_text("errcode")
        .ok_or_else(|| QuickbaseError::Protocol("response has no errcode".to_string()))?;

    Ok(ApiStatus {
        code: parse_code(&code)?,
        text: root.child_text("errtext").unwrap_or_default(),
        detail: root.child_text("errdetail").filter(|detail| !detail.is_empty()),
    })
}

/// Fail unless `root` is the response envelope.
pub(crate) fn expect_envelope(root: &Element) -> Result<(), QuickbaseError> {
    if root.name == ENVELOPE {
        Ok(())
    } else {
        Err(QuickbaseError::Protocol(format!(
            "{ENVELOPE} expected; {} found",
            root.name
        )))
    }
}
