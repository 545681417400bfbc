//! Generic, opaque XML element tree. The rest of the crate never touches `quick_xml` directly;
//! [`crate::xtce`] walks the tree this module builds, the same separation the spec draws between
//! "XML document I/O" (an external collaborator) and the XTCE-specific interpreter.

use std::collections::HashMap;
use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::DefinitionLoadError;

/// One XML element: its stripped-of-namespace name, attributes, child elements in document
/// order, and any direct text content.
#[derive(Debug, Clone, Default)]
pub struct XmlElement {
    pub name: String,
    pub attrs: HashMap<String, String>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    /// First child named `name`, if any.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children named `name`, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// This element's `name` attribute value, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Trimmed direct text content.
    pub fn text(&self) -> &str {
        self.text.trim()
    }
}

/// Strips a namespace prefix (e.g. `xtce:SequenceContainer` -> `SequenceContainer`); this crate
/// treats the XTCE namespace as fixed and never validates the prefix itself resolves to the
/// expected URI, matching the spec's "opaque tree" framing.
fn strip_ns(name: &[u8]) -> String {
    let s = String::from_utf8_lossy(name);
    match s.find(':') {
        Some(idx) => s[idx + 1..].to_string(),
        None => s.into_owned(),
    }
}

fn xml_err(message: impl Into<String>) -> DefinitionLoadError {
    DefinitionLoadError::MalformedXml {
        message: message.into(),
    }
}

fn read_attrs<B: BufRead>(
    reader: &Reader<B>,
    e: &quick_xml::events::BytesStart,
) -> Result<HashMap<String, String>, DefinitionLoadError> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| xml_err(e.to_string()))?;
        let key = strip_ns(attr.key);
        let value = attr
            .unescape_and_decode_value(reader)
            .map_err(|e| xml_err(e.to_string()))?;
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn push_finished(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, elem: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(elem),
        None => *root = Some(elem),
    }
}

/// Parses a complete XML document into a tree of [`XmlElement`]s, rooted at the document's single
/// top-level element. Whitespace-only text nodes are dropped; everything else is the loader's
/// problem, not this module's.
pub fn parse(xml: &str) -> Result<XmlElement, DefinitionLoadError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let elem = XmlElement {
                    name: strip_ns(e.name()),
                    attrs: read_attrs(&reader, e)?,
                    children: Vec::new(),
                    text: String::new(),
                };
                stack.push(elem);
            }
            Ok(Event::Empty(ref e)) => {
                let elem = XmlElement {
                    name: strip_ns(e.name()),
                    attrs: read_attrs(&reader, e)?,
                    children: Vec::new(),
                    text: String::new(),
                };
                push_finished(&mut stack, &mut root, elem);
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape_and_decode(&reader)
                    .map_err(|e| xml_err(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                let elem = stack.pop().ok_or_else(|| xml_err("unmatched closing tag"))?;
                push_finished(&mut stack, &mut root, elem);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_err(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| xml_err("document has no root element"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespace_prefixes() {
        let tree = parse(r#"<xtce:SpaceSystem name="S"><xtce:Inner/></xtce:SpaceSystem>"#).unwrap();
        assert_eq!(tree.name, "SpaceSystem");
        assert_eq!(tree.attr("name"), Some("S"));
        assert_eq!(tree.child("Inner").unwrap().name, "Inner");
    }

    #[test]
    fn captures_text_content() {
        let tree = parse("<Unit>seconds</Unit>").unwrap();
        assert_eq!(tree.text(), "seconds");
    }
}
