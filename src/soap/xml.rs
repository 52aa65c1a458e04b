//! Minimal element tree for SOAP responses.
//!
//! vim25 responses are small and deeply nested, so the whole body is read
//! into a tree keyed by local element names (namespace prefixes are dropped).

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::VguestError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first direct child with the given local name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Attribute value by its qualified name, e.g. `type` or `xsi:type`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Depth-first search for the first descendant (or self) with `name`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}

fn parse_err(e: impl std::fmt::Display) -> VguestError {
    VguestError::Transport {
        message: format!("malformed XML response: {e}"),
    }
}

fn start_element(e: &BytesStart<'_>) -> Result<Element, VguestError> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(parse_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(parse_err)?.into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        ..Default::default()
    })
}

/// Parse a document and return its root element.
pub fn parse(input: &str) -> Result<Element, VguestError> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(parse_err)? {
            Event::Start(e) => stack.push(start_element(&e)?),
            Event::Empty(e) => {
                let el = start_element(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => root = Some(el),
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape().map_err(parse_err)?);
                }
            }
            Event::CData(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::End(_) => {
                let Some(done) = stack.pop() else {
                    return Err(parse_err("unbalanced end tag"));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => root = Some(done),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(parse_err("unexpected end of document"));
    }
    root.ok_or_else(|| parse_err("empty document"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespace_prefixes() {
        let doc = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
            <soapenv:Body><Foo xmlns="urn:vim25"><returnval>1</returnval></Foo></soapenv:Body>
        </soapenv:Envelope>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.name, "Envelope");
        let body = root.child("Body").unwrap();
        assert_eq!(body.child("Foo").unwrap().child_text("returnval"), Some("1"));
    }

    #[test]
    fn keeps_qualified_attribute_names() {
        let doc = r#"<val xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="ManagedObjectReference" type="Folder">group-d1</val>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.text, "group-d1");
        assert_eq!(root.attr("type"), Some("Folder"));
        assert_eq!(root.attr("xsi:type"), Some("ManagedObjectReference"));
    }

    #[test]
    fn unescapes_text() {
        let root = parse("<a>x &amp;&amp; y &lt;z&gt;</a>").unwrap();
        assert_eq!(root.text, "x && y <z>");
    }

    #[test]
    fn find_searches_descendants() {
        let root = parse("<a><b><c>deep</c></b><c>shallow</c></a>").unwrap();
        assert_eq!(root.find("c").unwrap().text, "deep");
        assert_eq!(root.children_named("c").count(), 1);
    }

    #[test]
    fn empty_elements_become_children() {
        let root = parse("<a><options/><b>1</b></a>").unwrap();
        assert_eq!(root.children.len(), 2);
        assert!(root.child("options").unwrap().text.is_empty());
    }

    #[test]
    fn rejects_truncated_document() {
        assert!(parse("<a><b>").is_err());
    }
}
