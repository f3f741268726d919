//! A minimal, tolerant recursive-descent XML tree reader shared by the
//! cipher-packet envelope and the digest RDF pipeline.
//!
//! This deliberately does not use a full XML crate: both wire formats are
//! flat, single-namespace documents, and the cipher-packet header in
//! particular must be parsed without assuming the input is well-formed
//! XML ahead of the terminating `?>` of its leading processing instruction.
//! A general-purpose parser would reject or mis-handle the
//! partially-scanned prefix this format requires.

use crate::error::{Result, ToolkitError};

#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Finds the first direct child with the given tag name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given tag name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// Parses `xml` into a tree rooted at the first real element (processing
/// instructions and comments before it are skipped). Unknown constructs
/// inside element bodies are tolerated; only a missing closing tag or
/// unterminated quote is a hard parse error.
pub fn parse(xml: &[u8]) -> Result<XmlNode> {
    let mut cur = Cursor::new(xml);
    loop {
        cur.skip_ws();
        match cur.peek() {
            None => return Err(ToolkitError::option("xml: no root element found")),
            Some(b'<') => {
                if xml[cur.pos..].starts_with(b"<?") {
                    skip_until(&mut cur, b"?>")?;
                    continue;
                }
                if xml[cur.pos..].starts_with(b"<!--") {
                    skip_until(&mut cur, b"-->")?;
                    continue;
                }
                return parse_element(&mut cur);
            }
            Some(_) => {
                cur.pos += 1;
            }
        }
    }
}

fn skip_until(cur: &mut Cursor, terminator: &[u8]) -> Result<()> {
    while !cur.eof() {
        if cur.bytes[cur.pos..].starts_with(terminator) {
            cur.pos += terminator.len();
            return Ok(());
        }
        cur.pos += 1;
    }
    Err(ToolkitError::option("xml: unterminated processing instruction/comment"))
}

fn parse_name(cur: &mut Cursor) -> String {
    let start = cur.pos;
    while let Some(b) = cur.peek() {
        if b.is_ascii_whitespace() || b == b'>' || b == b'/' || b == b'=' {
            break;
        }
        cur.pos += 1;
    }
    String::from_utf8_lossy(&cur.bytes[start..cur.pos]).into_owned()
}

fn parse_attrs(cur: &mut Cursor) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    loop {
        cur.skip_ws();
        match cur.peek() {
            Some(b'/') | Some(b'>') | None => break,
            _ => {}
        }
        let key = parse_name(cur);
        if key.is_empty() {
            break;
        }
        cur.skip_ws();
        if cur.peek() != Some(b'=') {
            // tolerate valueless attributes
            attrs.push((key, String::new()));
            continue;
        }
        cur.advance();
        cur.skip_ws();
        let quote = cur
            .advance()
            .ok_or_else(|| ToolkitError::option("xml: unterminated attribute"))?;
        if quote != b'"' && quote != b'\'' {
            return Err(ToolkitError::option("xml: attribute value must be quoted"));
        }
        let start = cur.pos;
        while cur.peek().is_some() && cur.peek() != Some(quote) {
            cur.pos += 1;
        }
        let value = String::from_utf8_lossy(&cur.bytes[start..cur.pos]).into_owned();
        cur.advance();
        attrs.push((key, value));
    }
    Ok(attrs)
}

fn parse_element(cur: &mut Cursor) -> Result<XmlNode> {
    cur.advance(); // consume '<'
    let name = parse_name(cur);
    let attrs = parse_attrs(cur)?;
    cur.skip_ws();

    if cur.peek() == Some(b'/') {
        cur.advance();
        if cur.peek() == Some(b'>') {
            cur.advance();
        }
        return Ok(XmlNode {
            name,
            attrs,
            children: Vec::new(),
            text: String::new(),
        });
    }
    if cur.peek() != Some(b'>') {
        return Err(ToolkitError::option(format!("xml: malformed start tag <{name}>")));
    }
    cur.advance();

    let mut node = XmlNode {
        name: name.clone(),
        attrs,
        children: Vec::new(),
        text: String::new(),
    };

    loop {
        if cur.eof() {
            return Err(ToolkitError::option(format!("xml: unclosed element <{name}>")));
        }
        if cur.peek() == Some(b'<') {
            if cur.bytes[cur.pos..].starts_with(b"</") {
                cur.pos += 2;
                let closing = parse_name(cur);
                cur.skip_ws();
                if cur.peek() == Some(b'>') {
                    cur.advance();
                }
                if closing != name {
                    tracing::warn!(expected = %name, found = %closing, "xml: mismatched closing tag, tolerating");
                }
                return Ok(node);
            }
            if cur.bytes[cur.pos..].starts_with(b"<!--") {
                skip_until(cur, b"-->")?;
                continue;
            }
            let child = parse_element(cur)?;
            node.children.push(child);
        } else {
            let start = cur.pos;
            while cur.peek().is_some() && cur.peek() != Some(b'<') {
                cur.pos += 1;
            }
            node.text.push_str(&String::from_utf8_lossy(&cur.bytes[start..cur.pos]));
        }
    }
}

/// Escapes text for inclusion as element content (minimal: the five XML
/// predefined entities are enough for the fields this format emits).
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_flat_document() {
        let doc = br#"<?xml version="1.0"?>
<rdf:RDF xmlns:rdf="x" xmlns:cipher="y">
  <cipher:Content rdf:about="file.txt">
    <cipher:type>AES</cipher:type>
    <cipher:mode>CBC</cipher:mode>
  </cipher:Content>
</rdf:RDF>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.name, "rdf:RDF");
        let content = root.child("cipher:Content").unwrap();
        assert_eq!(content.attr("rdf:about"), Some("file.txt"));
        assert_eq!(content.child("cipher:type").unwrap().text, "AES");
        assert_eq!(content.child("cipher:mode").unwrap().text, "CBC");
    }

    #[test]
    fn tolerates_unquoted_and_whitespace_heavy_attrs() {
        let doc = br#"<root   a = "1"   b="2"><child>v</child></root>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.attr("a"), Some("1"));
        assert_eq!(root.attr("b"), Some("2"));
        assert_eq!(root.child("child").unwrap().text, "v");
    }
}
