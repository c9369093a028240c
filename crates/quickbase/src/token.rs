//! Owned XML tokens pulled one at a time from an async byte stream.
//!
//! The cursor owns both the reader and its scratch buffer, so a partially
//! consumed response can be moved into another task as a single value.

use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::name::QName;
use tokio::io::AsyncBufRead;

use crate::QuickbaseError;

/// An element name with its attributes. Namespace prefixes are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub(crate) fn from_start(start: &BytesStart<'_>) -> Result<Self, QuickbaseError> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = utf8(attr.key.local_name().as_ref())?;
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name: local_name(start.name())?,
            attributes,
        })
    }
}

fn local_name(name: QName<'_>) -> Result<String, QuickbaseError> {
    utf8(name.local_name().as_ref())
}

fn utf8(bytes: &[u8]) -> Result<String, QuickbaseError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| QuickbaseError::Parse(format!("invalid UTF-8 in name: {e}")))
}

/// Unescaped character data.
pub(crate) fn text_of(text: &BytesText<'_>) -> Result<String, QuickbaseError> {
    Ok(text.unescape()?.into_owned())
}

/// One XML token. CDATA sections arrive as [`Token::Text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Start(Tag),
    /// A self-closing element such as `<BR/>`.
    Empty(Tag),
    End(String),
    Text(String),
    Eof,
}

/// Pulls [`Token`]s from an async reader, skipping declarations, comments
/// and processing instructions.
pub struct TokenCursor<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    idle_timeout: Option<Duration>,
}

impl<R> TokenCursor<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        let mut reader = Reader::from_reader(inner);
        let config = reader.config_mut();
        config.trim_text(false);
        // A field left open is ended by the next start tag, so end tags
        // need not match.
        config.check_end_names = false;
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            idle_timeout: None,
        }
    }

    /// Fail a read that waits longer than `limit` for the next token.
    pub fn with_idle_timeout(mut self, limit: Duration) -> Self {
        self.idle_timeout = Some(limit);
        self
    }

    pub async fn next(&mut self) -> Result<Token, QuickbaseError> {
        loop {
            self.buf.clear();
            let read = self.reader.read_event_into_async(&mut self.buf);
            let event = match self.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| QuickbaseError::Timeout("waiting for response data"))??,
                None => read.await?,
            };

            let token = match event {
                Event::Start(start) => Token::Start(Tag::from_start(&start)?),
                Event::Empty(start) => Token::Empty(Tag::from_start(&start)?),
                Event::End(end) => Token::End(local_name(end.name())?),
                Event::Text(text) => Token::Text(text_of(&text)?),
                Event::CData(cdata) => {
                    Token::Text(String::from_utf8_lossy(&cdata.into_inner()).into_owned())
                }
                Event::Eof => Token::Eof,
                _ => continue,
            };
            return Ok(token);
        }
    }

    /// Consume the rest of an element whose start tag was just read.
    pub async fn skip_element(&mut self) -> Result<(), QuickbaseError> {
        let mut depth = 1usize;
        loop {
            match self.next().await? {
                Token::Start(_) => depth += 1,
                Token::End(_) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Token::Eof => return Err(truncated()),
                Token::Empty(_) | Token::Text(_) => {}
            }
        }
    }

    /// Collect the direct text of an element whose start tag was just read,
    /// through its end tag. Nested elements are consumed and ignored.
    pub async fn read_text(&mut self) -> Result<String, QuickbaseError> {
        let mut text = String::new();
        let mut depth = 1usize;
        loop {
            match self.next().await? {
                Token::Text(fragment) if depth == 1 => text.push_str(&fragment),
                Token::Start(_) => depth += 1,
                Token::End(_) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(text);
                    }
                }
                Token::Eof => return Err(truncated()),
                Token::Empty(_) | Token::Text(_) => {}
            }
        }
    }
}

/// The body ended before the document was complete.
pub(crate) fn truncated() -> QuickbaseError {
    QuickbaseError::Protocol("response ended before the envelope closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn tokens(xml: &'static str) -> Vec<Token> {
        let mut cursor = TokenCursor::new(xml.as_bytes());
        let mut out = Vec::new();
        loop {
            let token = cursor.next().await.unwrap();
            let done = token == Token::Eof;
            out.push(token);
            if done {
                return out;
            }
        }
    }

    #[tokio::test]
    async fn test_tokens_skip_declarations_and_comments() {
        let out = tokens(r#"<?xml version="1.0"?><!-- hi --><a x="1 &amp; 2"><b/>t&lt;</a>"#).await;
        assert_eq!(
            out,
            vec![
                Token::Start(Tag::new("a").with_attr("x", "1 & 2")),
                Token::Empty(Tag::new("b")),
                Token::Text("t<".to_string()),
                Token::End("a".to_string()),
                Token::Eof,
            ]
        );
    }

    #[tokio::test]
    async fn test_cdata_is_text() {
        let out = tokens("<a><![CDATA[x<y]]></a>").await;
        assert_eq!(out[1], Token::Text("x<y".to_string()));
    }

    #[tokio::test]
    async fn test_skip_element_and_read_text() {
        let mut cursor =
            TokenCursor::new("<r><skip><x>1</x><y/></skip><t>ab<i>no</i>c</t><z/></r>".as_bytes());
        assert!(matches!(cursor.next().await.unwrap(), Token::Start(tag) if tag.name == "r"));
        assert!(matches!(cursor.next().await.unwrap(), Token::Start(tag) if tag.name == "skip"));
        cursor.skip_element().await.unwrap();
        assert!(matches!(cursor.next().await.unwrap(), Token::Start(tag) if tag.name == "t"));
        assert_eq!(cursor.read_text().await.unwrap(), "abc");
        assert_eq!(cursor.next().await.unwrap(), Token::Empty(Tag::new("z")));
    }

    #[tokio::test]
    async fn test_read_text_truncated() {
        let mut cursor = TokenCursor::new("<r><t>abc".as_bytes());
        cursor.next().await.unwrap();
        cursor.next().await.unwrap();
        assert!(cursor.read_text().await.is_err());
    }

    #[tokio::test]
    async fn test_tokens_across_chunk_boundaries() {
        let mock = tokio_test::io::Builder::new()
            .read(b"<qdb")
            .read(b"api><err")
            .read(b"code>0</errc")
            .read(b"ode></qdbapi>")
            .build();
        let mut cursor = TokenCursor::new(tokio::io::BufReader::new(mock));

        assert_eq!(cursor.next().await.unwrap(), Token::Start(Tag::new("qdbapi")));
        assert_eq!(cursor.next().await.unwrap(), Token::Start(Tag::new("errcode")));
        assert_eq!(cursor.read_text().await.unwrap(), "0");
        assert_eq!(cursor.next().await.unwrap(), Token::End("qdbapi".to_string()));
        assert_eq!(cursor.next().await.unwrap(), Token::Eof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let mock = tokio_test::io::Builder::new()
            .read(b"<qdbapi>")
            .wait(Duration::from_secs(120))
            .build();
        let mut cursor =
            TokenCursor::new(tokio::io::BufReader::new(mock)).with_idle_timeout(Duration::from_secs(5));

        assert_eq!(cursor.next().await.unwrap(), Token::Start(Tag::new("qdbapi")));
        assert!(matches!(cursor.next().await, Err(QuickbaseError::Timeout(_))));
    }
}
