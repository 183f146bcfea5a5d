//! Minimal XML tree and exclusive canonicalization.
//!
//! IdP messages are parsed once into an owned tree so that signature
//! verification and field extraction operate on exactly the same nodes.
//! Comments, processing instructions and the XML declaration are dropped at
//! parse time; DOCTYPE declarations are rejected outright.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use thiserror::Error;

/// Namespace bindings in scope at an element: prefix -> URI ("" is the default namespace).
pub type NsScope = BTreeMap<String, String>;

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Deepest element nesting accepted. SAML responses stay well under a dozen
/// levels; the tree walkers below recurse once per level.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("DOCTYPE declarations are not allowed")]
    DocType,

    #[error("document has no root element")]
    Empty,

    #[error("document has more than one root element")]
    MultipleRoots,

    #[error("unexpected end of document")]
    Truncated,

    #[error("elements nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Qualified name as written (`ID`, `xmlns:saml`, `xsi:type`).
    pub name: String,
    /// Unescaped, whitespace-normalized value.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Qualified name as written (`saml:Assertion`).
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

/// Parse a document into its root element.
pub fn parse(xml: &str) -> Result<Element, XmlError> {
    let normalized = xml.replace("\r\n", "\n").replace('\r', "\n");
    let mut reader = Reader::from_str(&normalized);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep);
                }
                stack.push(Element::from_start(e)?);
            }
            Ok(Event::Empty(ref e)) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep);
                }
                let element = Element::from_start(e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack.pop().ok_or(XmlError::Truncated)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(ref e)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = e.unescape().map_err(|e| XmlError::Parse(e.to_string()))?;
                    parent.push_text(&text);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some(parent) = stack.last_mut() {
                    parent.push_text(&String::from_utf8_lossy(e));
                }
            }
            Ok(Event::DocType(_)) => return Err(XmlError::DocType),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(XmlError::Parse(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Truncated);
    }
    root.ok_or(XmlError::Empty)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(XmlError::MultipleRoots),
    }
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .to_string();

        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|e| XmlError::Parse(e.to_string()))?;
            let raw =
                std::str::from_utf8(&attr.value).map_err(|e| XmlError::Parse(e.to_string()))?;
            // Literal tabs and newlines normalize to spaces; character references survive.
            let raw = raw.replace(|c: char| c == '\t' || c == '\n', " ");
            let value = quick_xml::escape::unescape(&raw)
                .map_err(|e| XmlError::Parse(e.to_string()))?
                .into_owned();
            attributes.push(Attribute {
                name: key.to_string(),
                value,
            });
        }

        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    fn push_text(&mut self, text: &str) {
        if let Some(Node::Text(existing)) = self.children.last_mut() {
            existing.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_string()));
        }
    }

    pub fn prefix(&self) -> &str {
        split_qname(&self.name).0
    }

    pub fn local_name(&self) -> &str {
        split_qname(&self.name).1
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Scope visible inside this element given its parent's scope.
    pub fn scope(&self, parent: &NsScope) -> NsScope {
        let mut scope = parent.clone();
        for attr in &self.attributes {
            if attr.name == "xmlns" {
                scope.insert(String::new(), attr.value.clone());
            } else if let Some(prefix) = attr.name.strip_prefix("xmlns:") {
                scope.insert(prefix.to_string(), attr.value.clone());
            }
        }
        scope
    }

    /// Namespace URI of this element. `scope` must already include this
    /// element's own declarations.
    pub fn namespace<'s>(&self, scope: &'s NsScope) -> Option<&'s str> {
        resolve_prefix(self.prefix(), scope)
    }

    pub fn is(&self, scope: &NsScope, namespace: &str, local_name: &str) -> bool {
        self.local_name() == local_name && self.namespace(scope) == Some(namespace)
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child with the given namespace and local name.
    pub fn child<'a>(
        &'a self,
        scope: &NsScope,
        namespace: &str,
        local_name: &str,
    ) -> Option<&'a Element> {
        self.child_elements()
            .find(|c| c.is(&c.scope(scope), namespace, local_name))
    }

    pub fn children_named<'a>(
        &'a self,
        scope: &'a NsScope,
        namespace: &'a str,
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.child_elements()
            .filter(move |c| c.is(&c.scope(scope), namespace, local_name))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Every descendant (not including self) with the given name, paired with
    /// the scope in effect at that descendant.
    pub fn descendants_named(
        &self,
        scope: &NsScope,
        namespace: &str,
        local_name: &str,
    ) -> Vec<(&Element, NsScope)> {
        let mut found = Vec::new();
        self.collect_named(scope, namespace, local_name, &mut found);
        found
    }

    fn collect_named<'a>(
        &'a self,
        scope: &NsScope,
        namespace: &str,
        local_name: &str,
        found: &mut Vec<(&'a Element, NsScope)>,
    ) {
        for child in self.child_elements() {
            let child_scope = child.scope(scope);
            if child.is(&child_scope, namespace, local_name) {
                found.push((child, child_scope.clone()));
            }
            child.collect_named(&child_scope, namespace, local_name, found);
        }
    }
}

fn split_qname(name: &str) -> (&str, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", name),
    }
}

fn resolve_prefix<'s>(prefix: &str, scope: &'s NsScope) -> Option<&'s str> {
    if prefix == "xml" {
        return Some(XML_NS);
    }
    scope
        .get(prefix)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
}

/// Exclusive XML canonicalization (without comments).
#[derive(Debug, Default)]
pub struct Canonicalizer<'a> {
    /// Prefixes from an `InclusiveNamespaces PrefixList` (`#default` for "").
    pub inclusive_prefixes: Vec<String>,
    /// Subtree omitted from the output (the enveloped signature).
    pub skip: Option<&'a Element>,
    /// Omit every `ds:Signature` element.
    pub strip_signatures: bool,
}

impl<'a> Canonicalizer<'a> {
    /// Canonical form of `element`. `parent_scope` is the namespace scope
    /// inherited from the element's ancestors.
    pub fn canonicalize(&self, element: &Element, parent_scope: &NsScope) -> String {
        let mut out = String::new();
        self.write_element(element, parent_scope, &NsScope::new(), &mut out);
        out
    }

    fn skipped(&self, element: &Element, scope: &NsScope) -> bool {
        if let Some(skip) = self.skip {
            if std::ptr::eq(skip, element) {
                return true;
            }
        }
        self.strip_signatures && element.is(scope, super::signature::DSIG_NS, "Signature")
    }

    fn write_element(
        &self,
        element: &Element,
        parent_scope: &NsScope,
        rendered: &NsScope,
        out: &mut String,
    ) {
        let scope = element.scope(parent_scope);
        if self.skipped(element, &scope) {
            return;
        }

        // Visibly utilized prefixes plus the inclusive list.
        let mut utilized: Vec<&str> = vec![element.prefix()];
        for attr in &element.attributes {
            if is_namespace_decl(&attr.name) {
                continue;
            }
            let (prefix, _) = split_qname(&attr.name);
            if !prefix.is_empty() {
                utilized.push(prefix);
            }
        }
        for prefix in &self.inclusive_prefixes {
            let prefix = if prefix == "#default" { "" } else { prefix.as_str() };
            if scope.contains_key(prefix) {
                utilized.push(prefix);
            }
        }

        let mut declarations: BTreeMap<&str, &str> = BTreeMap::new();
        for prefix in utilized {
            if prefix == "xml" {
                continue;
            }
            let uri = scope.get(prefix).map(|s| s.as_str()).unwrap_or("");
            let already = rendered.get(prefix).map(|s| s.as_str()).unwrap_or("");
            if uri != already {
                declarations.insert(prefix, uri);
            }
        }

        let mut attributes: Vec<(&str, &str, &Attribute)> = element
            .attributes
            .iter()
            .filter(|a| !is_namespace_decl(&a.name))
            .map(|a| {
                let (prefix, local) = split_qname(&a.name);
                let ns = if prefix.is_empty() {
                    ""
                } else {
                    resolve_prefix(prefix, &scope).unwrap_or("")
                };
                (ns, local, a)
            })
            .collect();
        attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        out.push('<');
        out.push_str(&element.name);
        for (prefix, uri) in &declarations {
            if prefix.is_empty() {
                out.push_str(" xmlns=\"");
            } else {
                out.push_str(" xmlns:");
                out.push_str(prefix);
                out.push_str("=\"");
            }
            escape_attr(uri, out);
            out.push('"');
        }
        for (_, _, attr) in &attributes {
            out.push(' ');
            out.push_str(&attr.name);
            out.push_str("=\"");
            escape_attr(&attr.value, out);
            out.push('"');
        }
        out.push('>');

        let mut child_rendered = rendered.clone();
        for (prefix, uri) in declarations {
            child_rendered.insert(prefix.to_string(), uri.to_string());
        }

        for child in &element.children {
            match child {
                Node::Text(text) => escape_text(text, out),
                Node::Element(e) => self.write_element(e, &scope, &child_rendered, out),
            }
        }

        out.push_str("</");
        out.push_str(&element.name);
        out.push('>');
    }
}

fn is_namespace_decl(name: &str) -> bool {
    name == "xmlns" || name.starts_with("xmlns:")
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

/// Escape a value for inclusion in XML we generate ourselves.
pub fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}
