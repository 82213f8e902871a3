//! DBGp XML payload parsing
//!
//! Parses message payloads into a generic attribute/text/child tree and
//! decodes `property` elements into [`VariableInfo`] values.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;

use crate::common::{Error, Result};

use super::types::VariableInfo;

/// Generic XML element tree
#[derive(Debug, Clone, Default)]
pub struct XmlElement {
    /// Local element name, namespace prefix stripped
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Attribute value by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// First child with the given local name
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given local name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn local_name(raw: &[u8]) -> String {
    let full = String::from_utf8_lossy(raw);
    match full.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => full.into_owned(),
    }
}

fn element_from(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlElement> {
    let mut attributes = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Protocol(format!("bad XML attribute: {e}")))?;
        let key = local_name(attr.key.as_ref());
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Protocol(format!("bad XML attribute value: {e}")))?
            .into_owned();
        attributes.insert(key, value);
    }

    Ok(XmlElement {
        name: local_name(e.name().as_ref()),
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}

/// Parse one XML document into an element tree
pub fn parse(xml: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from(&e)?),
            Ok(Event::Empty(e)) => {
                let element = element_from(&e)?;
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::Protocol("unbalanced XML close tag".to_string()))?;
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Protocol(format!("bad XML text: {e}")))?;
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::Protocol(format!("invalid XML: {e}"))),
        }
    }

    root.ok_or_else(|| Error::Protocol("empty XML document".to_string()))
}

fn attach(stack: &mut Vec<XmlElement>, root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Decode a `property` element into a [`VariableInfo`]
///
/// Base64-encoded text is decoded to UTF-8; scalar values are coerced to
/// their declared type. A `size` attribute larger than the decoded text
/// marks the value as truncated.
pub fn decode_property(el: &XmlElement) -> VariableInfo {
    let name = el
        .attr("name")
        .or_else(|| el.attr("fullname"))
        .unwrap_or_default()
        .to_string();
    let var_type = el.attr("type").unwrap_or("string").to_string();

    let text = decode_text(el);

    let children: Vec<VariableInfo> = el
        .children_named("property")
        .map(decode_property)
        .collect();

    let numchildren = el.attr("numchildren").and_then(|n| n.parse().ok());
    let truncated = el
        .attr("size")
        .and_then(|s| s.parse::<usize>().ok())
        .map_or(false, |size| size > text.len());

    let value = if children.is_empty() {
        coerce_scalar(&var_type, &text)
    } else {
        None
    };

    VariableInfo {
        name,
        var_type,
        value,
        children: if children.is_empty() { None } else { Some(children) },
        classname: el.attr("classname").map(str::to_string),
        fullname: el.attr("fullname").map(str::to_string),
        numchildren,
        truncated,
    }
}

/// Element text with base64 decoding applied when declared
pub fn decode_text(el: &XmlElement) -> String {
    let raw = el.text.trim();
    if el.attr("encoding") == Some("base64") {
        match STANDARD.decode(raw) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => raw.to_string(),
        }
    } else {
        raw.to_string()
    }
}

fn coerce_scalar(var_type: &str, text: &str) -> Option<Value> {
    match var_type {
        "int" | "integer" => Some(
            text.parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(text.to_string())),
        ),
        "float" | "double" => Some(
            text.parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .unwrap_or_else(|| Value::String(text.to_string())),
        ),
        "bool" | "boolean" => {
            Some(Value::Bool(text == "1" || text.eq_ignore_ascii_case("true")))
        }
        "null" | "uninitialized" => None,
        "resource" => Some(Value::String(format!("[resource: {text}]"))),
        _ => Some(Value::String(text.to_string())),
    }
}
