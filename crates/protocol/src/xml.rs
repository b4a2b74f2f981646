//! Minimal quick-xml helpers for the flat documents storage services return.

use std::borrow::Cow;
use std::io::{self, Write};

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesText, Event};

use crate::error::ProtocolError;

/// A root element and the text of its direct children, in document order.
#[derive(Debug, Default)]
pub(crate) struct FlatElement {
    pub name: String,
    pub children: Vec<(String, String)>,
}

impl FlatElement {
    /// Returns the text of the first child named `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the text of the first child named `name`, or an error.
    pub fn require(&self, name: &'static str) -> Result<&str, ProtocolError> {
        self.first(name).ok_or(ProtocolError::MissingElement(name))
    }
}

/// Parses `xml` into its root element name and leaf children.
///
/// Namespace prefixes are dropped. Grandchildren are skipped.
pub(crate) fn read_flat(xml: &[u8]) -> Result<FlatElement, ProtocolError> {
    let mut reader = Reader::from_reader(xml);

    let name = loop {
        match reader.read_event()? {
            Event::Start(e) => break element_name(e.local_name().as_ref()),
            Event::Empty(e) => {
                return Ok(FlatElement {
                    name: element_name(e.local_name().as_ref()),
                    children: Vec::new(),
                });
            }
            Event::Eof => return Err(ProtocolError::MissingElement("root element")),
            _ => {}
        }
    };

    let mut children = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let child = element_name(e.local_name().as_ref());
                let text = read_text_content(&mut reader)?;
                children.push((child, text));
            }
            Event::Empty(e) => {
                children.push((element_name(e.local_name().as_ref()), String::new()));
            }
            Event::End(_) => return Ok(FlatElement { name, children }),
            Event::Eof => return Err(ProtocolError::MissingElement("closing root tag")),
            _ => {}
        }
    }
}

/// Reads the text of the current element and consumes its end tag.
fn read_text_content(reader: &mut Reader<&[u8]>) -> Result<String, ProtocolError> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(e) => {
                let decoded = e
                    .decode()
                    .map_err(|err| ProtocolError::Encoding(err.to_string()))?;
                let unescaped = quick_xml::escape::unescape(&decoded)
                    .map_err(|err| ProtocolError::Encoding(err.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::CData(e) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Event::GeneralRef(e) => {
                let entity = e
                    .decode()
                    .map_err(|err| ProtocolError::Encoding(err.to_string()))?;
                text.push_str(&resolve_entity(&entity));
            }
            Event::Start(_) => skip_element(reader)?,
            Event::End(_) => return Ok(text.trim().to_string()),
            Event::Eof => return Err(ProtocolError::MissingElement("closing tag")),
            _ => {}
        }
    }
}

/// Skips an element and all of its children.
fn skip_element(reader: &mut Reader<&[u8]>) -> Result<(), ProtocolError> {
    let mut depth: u32 = 1;
    loop {
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(ProtocolError::MissingElement("closing tag")),
            _ => {}
        }
    }
}

fn resolve_entity(entity: &str) -> Cow<'static, str> {
    match entity {
        "lt" => Cow::Borrowed("<"),
        "gt" => Cow::Borrowed(">"),
        "amp" => Cow::Borrowed("&"),
        "apos" => Cow::Borrowed("'"),
        "quot" => Cow::Borrowed("\""),
        other => {
            let code = other
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| other.strip_prefix('#').and_then(|dec| dec.parse().ok()));
            match code.and_then(char::from_u32) {
                Some(ch) => Cow::Owned(ch.to_string()),
                None => Cow::Owned(format!("&{other};")),
            }
        }
    }
}

fn element_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Writes an XML declaration followed by `root` whose children are written by `body`.
pub(crate) fn to_xml<F>(root: &str, body: F) -> Result<String, ProtocolError>
where
    F: FnOnce(&mut Writer<&mut Vec<u8>>) -> io::Result<()>,
{
    let mut buf = Vec::with_capacity(512);
    let mut writer = Writer::new(&mut buf);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.create_element(root).write_inner_content(body)?;
    String::from_utf8(buf).map_err(|e| ProtocolError::Encoding(e.to_string()))
}

/// Writes a `<tag>text</tag>` element.
pub(crate) fn write_text_element<W: Write>(
    writer: &mut Writer<W>,
    tag: &str,
    text: &str,
) -> io::Result<()> {
    writer
        .create_element(tag)
        .write_text_content(BytesText::new(text))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_reads_leaf_children() {
        let xml = br#"<?xml version="1.0"?>
            <Root xmlns="urn:x"><A>one</A><Nested><Inner>x</Inner></Nested><B/></Root>"#;
        let el = read_flat(xml).unwrap();
        assert_eq!(el.name, "Root");
        assert_eq!(el.first("A"), Some("one"));
        assert_eq!(el.first("Nested"), Some(""));
        assert_eq!(el.first("B"), Some(""));
        assert!(el.first("Inner").is_none());
    }

    #[test]
    fn flat_resolves_entities() {
        let xml = b"<R><Key>a &amp; b &#x41;&quot;</Key></R>";
        let el = read_flat(xml).unwrap();
        assert_eq!(el.first("Key"), Some("a & b A\""));
    }

    #[test]
    fn flat_rejects_empty_document() {
        assert!(matches!(
            read_flat(b"   "),
            Err(ProtocolError::MissingElement("root element"))
        ));
    }

    #[test]
    fn writer_escapes_text() {
        let xml = to_xml("R", |w| write_text_element(w, "K", "a<b")).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<K>a&lt;b</K>"));
    }
}
