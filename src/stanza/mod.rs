//! Minimal XML element tree for stanzas.
//!
//! Stanzas are parsed with quick-xml into an owned [`Element`] tree and serialized
//! back with escaping. Namespaces are tracked through `xmlns` attributes only;
//! children without their own `xmlns` inherit the parent's.

pub mod framing;

use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::XmlError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Element with an `xmlns` attribute.
    pub fn with_ns(name: impl Into<String>, ns: &str) -> Self {
        Self::new(name).attr("xmlns", ns)
    }

    /// Builder-style attribute setter.
    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Sets the attribute only when `value` is `Some`.
    pub fn attr_opt(mut self, key: &str, value: Option<impl Into<String>>) -> Self {
        if let Some(value) = value {
            self.set_attr(key, value);
        }
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|(k, _)| k == key)?;
        Some(self.attrs.remove(pos).1)
    }

    pub fn append(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Qualified name as it appears on the wire (`stream:features`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without a namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Own `xmlns` attribute, if declared on this element.
    pub fn ns(&self) -> Option<&str> {
        self.get_attr("xmlns")
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child with the given local name whose effective namespace
    /// (own `xmlns`, else this element's) equals `ns` when one is given.
    pub fn find(&self, local_name: &str, ns: Option<&str>) -> Option<&Element> {
        let parent_ns = self.ns();
        self.children().find(|child| {
            child.local_name() == local_name
                && ns.map_or(true, |ns| child.ns().or(parent_ns) == Some(ns))
        })
    }

    pub fn find_all<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children().filter(move |c| c.local_name() == local_name)
    }

    /// Depth-first search for the first descendant with the given name and own namespace.
    pub fn find_descendant(&self, local_name: &str, ns: &str) -> Option<&Element> {
        for child in self.children() {
            if child.local_name() == local_name && child.ns() == Some(ns) {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(local_name, ns) {
                return Some(found);
            }
        }
        None
    }

    /// Concatenated text of the direct text children.
    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Text of the first child with the given local name.
    pub fn child_text(&self, local_name: &str) -> Option<String> {
        self.find(local_name, None).map(Element::text_content)
    }

    pub fn has_child(&self, local_name: &str, ns: Option<&str>) -> bool {
        self.find(local_name, ns).is_some()
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    /// Serialized children, without this element's own tags.
    pub fn inner_xml(&self) -> String {
        let mut out = String::new();
        self.write_children(&mut out);
        out
    }

    fn write_children(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_xml(out),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        self.write_children(out);
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse a single XML document (one stanza) into an element tree.
    pub fn parse(xml: &str) -> Result<Element, XmlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => stack.push(element_from_start(&e)?),
                Ok(Event::Empty(e)) => {
                    let element = element_from_start(&e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.append(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or(XmlError::Empty)?;
                    match stack.last_mut() {
                        Some(parent) => parent.append(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = t.unescape().map_err(|e| XmlError::Parse(e.to_string()))?;
                        if !text.is_empty() {
                            parent.children.push(Node::Text(text.into_owned()));
                        }
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                        parent.children.push(Node::Text(text));
                    }
                }
                Ok(Event::Eof) => {
                    return Err(if stack.is_empty() {
                        XmlError::Empty
                    } else {
                        XmlError::Incomplete
                    });
                }
                Ok(_) => {}
                Err(e) => return Err(XmlError::Parse(e.to_string())),
            }
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, XmlError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .into_owned();
        element.attrs.push((key, value));
    }
    Ok(element)
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// `<iq type=".."/>` in the client namespace.
pub fn iq(iq_type: &str) -> Element {
    Element::new("iq").attr("type", iq_type)
}

pub fn message() -> Element {
    Element::new("message")
}

pub fn presence() -> Element {
    Element::new("presence")
}

/// Empty `result` reply addressed back to the sender of `request`.
pub fn iq_result_for(request: &Element) -> Element {
    iq("result")
        .attr_opt("to", request.get_attr("from"))
        .attr_opt("id", request.get_attr("id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_stanza() {
        let xml = r#"<iq type="result" id="r1"><query xmlns="jabber:iq:roster" ver="v2"><item jid="bob@example.com" name="Bob"/></query></iq>"#;
        let el = Element::parse(xml).unwrap();
        assert_eq!(el.name(), "iq");
        assert_eq!(el.get_attr("type"), Some("result"));
        let query = el.find("query", Some("jabber:iq:roster")).unwrap();
        assert_eq!(query.get_attr("ver"), Some("v2"));
        let items: Vec<_> = query.find_all("item").collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get_attr("name"), Some("Bob"));
    }

    #[test]
    fn test_children_inherit_namespace() {
        let el = Element::parse(r#"<query xmlns="jabber:iq:roster"><item jid="a@b"/></query>"#).unwrap();
        assert!(el.find("item", Some("jabber:iq:roster")).is_some());
        assert!(el.find("item", Some("other")).is_none());
    }

    #[test]
    fn test_text_and_entities_roundtrip() {
        let el = message()
            .attr("to", "bob@example.com")
            .child(Element::new("body").text("1 < 2 & \"quotes\""));
        let xml = el.to_xml();
        assert!(xml.contains("&lt;"));
        let back = Element::parse(&xml).unwrap();
        assert_eq!(back.child_text("body").as_deref(), Some("1 < 2 & \"quotes\""));
    }

    #[test]
    fn test_cdata_is_text() {
        let el = Element::parse("<message><body><![CDATA[<b>hi</b>]]></body></message>").unwrap();
        assert_eq!(el.child_text("body").as_deref(), Some("<b>hi</b>"));
    }

    #[test]
    fn test_prefixed_names() {
        let el = Element::parse(r#"<stream:features><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"/></stream:features>"#).unwrap();
        assert_eq!(el.name(), "stream:features");
        assert_eq!(el.local_name(), "features");
        assert!(el.has_child("bind", Some("urn:ietf:params:xml:ns:xmpp-bind")));
    }

    #[test]
    fn test_incomplete_document() {
        assert_eq!(Element::parse("<message><body>hi"), Err(XmlError::Incomplete));
        assert_eq!(Element::parse("   "), Err(XmlError::Empty));
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut el = iq("get").attr("id", "a");
        el.set_attr("id", "b");
        assert_eq!(el.get_attr("id"), Some("b"));
        assert_eq!(el.attrs().count(), 2);
        assert_eq!(el.remove_attr("id").as_deref(), Some("b"));
        assert!(el.get_attr("id").is_none());
    }

    #[test]
    fn test_iq_result_for_swaps_addressing() {
        let request = iq("set").attr("from", "example.com").attr("id", "push1");
        let reply = iq_result_for(&request);
        assert_eq!(reply.get_attr("to"), Some("example.com"));
        assert_eq!(reply.get_attr("id"), Some("push1"));
        assert_eq!(reply.get_attr("type"), Some("result"));
    }

    #[test]
    fn test_find_descendant() {
        let el = Element::parse(
            r#"<message><received xmlns="urn:xmpp:carbons:2"><forwarded xmlns="urn:xmpp:forward:0"><message><body>x</body></message></forwarded></received></message>"#,
        )
        .unwrap();
        assert!(el.find_descendant("forwarded", "urn:xmpp:forward:0").is_some());
        assert!(el.find_descendant("forwarded", "other").is_none());
    }
}
