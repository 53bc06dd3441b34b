//! roxmltree helpers shared by the dialect parsers.
//!
//! Lookups are shallow (direct element children) unless stated otherwise,
//! matching how the format nests its records.

use roxmltree::Node;

use crate::diag::Diagnostics;
use crate::error::ExtractError;

/// First direct child element with the given tag name.
pub fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|c| c.is_element() && c.has_tag_name(name))
}

/// Direct child elements with the given tag name.
pub fn children<'a, 'i>(node: Node<'a, 'i>, name: &'static str) -> Vec<Node<'a, 'i>> {
    node.children()
        .filter(|c| c.is_element() && c.has_tag_name(name))
        .collect()
}

/// Text of the first direct child with the given tag name.
pub fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|c| c.text())
}

/// Required direct child element.
pub fn req_child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, ExtractError> {
    child(node, name).ok_or_else(|| {
        ExtractError::malformed(format!(
            "<{}> missing required <{}> child",
            node.tag_name().name(),
            name
        ))
    })
}

/// Text of a required direct child; an empty element yields "".
pub fn req_child_text<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, ExtractError> {
    Ok(req_child(node, name)?.text().unwrap_or(""))
}

/// Required attribute on the node itself.
pub fn req_attr<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, ExtractError> {
    node.attribute(name).ok_or_else(|| {
        ExtractError::malformed(format!(
            "<{}> missing required {} attribute",
            node.tag_name().name(),
            name
        ))
    })
}

pub fn parse_int(text: &str, context: &str) -> Result<i64, ExtractError> {
    text.trim()
        .parse()
        .map_err(|_| ExtractError::malformed(format!("invalid integer in {context}: {text:?}")))
}

pub fn parse_float(text: &str, context: &str) -> Result<f64, ExtractError> {
    text.trim()
        .parse()
        .map_err(|_| ExtractError::malformed(format!("invalid number in {context}: {text:?}")))
}

/// Integer text of a required direct child.
pub fn req_int(node: Node, name: &str) -> Result<i64, ExtractError> {
    parse_int(req_child_text(node, name)?, name)
}

/// Float text of a required direct child.
pub fn req_float(node: Node, name: &str) -> Result<f64, ExtractError> {
    parse_float(req_child_text(node, name)?, name)
}

/// Integer text of an optional direct child.
pub fn opt_int(node: Node, name: &str) -> Result<Option<i64>, ExtractError> {
    match child(node, name) {
        Some(c) => parse_int(c.text().unwrap_or(""), name).map(Some),
        None => Ok(None),
    }
}

/// Float text of an optional direct child.
pub fn opt_float(node: Node, name: &str) -> Result<Option<f64>, ExtractError> {
    match child(node, name) {
        Some(c) => parse_float(c.text().unwrap_or(""), name).map(Some),
        None => Ok(None),
    }
}

/// Owned text of an optional direct child.
pub fn opt_text(node: Node, name: &str) -> Option<String> {
    child(node, name).map(|c| c.text().unwrap_or("").to_string())
}

/// Boolean text ("0"/"1") of an optional direct child.
pub fn opt_bool(node: Node, name: &str) -> Result<Option<bool>, ExtractError> {
    Ok(opt_int(node, name)?.map(|v| v != 0))
}

/// True when a direct child with the given tag name exists.
pub fn flag(node: Node, name: &str) -> bool {
    child(node, name).is_some()
}

/// Dot count: absent means none.
pub fn dots(node: Node) -> Result<u32, ExtractError> {
    Ok(opt_int(node, "dots")?.unwrap_or(0) as u32)
}

/// Text content of the `<body>` nested under an `<html-data>` block, each
/// fragment whitespace-trimmed.
pub fn html_body_text(node: Node) -> Option<String> {
    let body = node
        .descendants()
        .find(|d| d.is_element() && d.has_tag_name("body"))?;
    let mut out = String::new();
    for descendant in body.descendants() {
        if descendant.is_text() {
            if let Some(text) = descendant.text() {
                out.push_str(text.trim());
            }
        }
    }
    Some(out)
}

/// Record children a record type is known to sometimes carry but does not
/// parse yet.
pub fn note_possible_tags(node: Node, record: &str, names: &[&str], diag: &mut Diagnostics) {
    for name in names {
        if child(node, name).is_some() {
            diag.note_unexpected_field(record, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_lookups_are_shallow() {
        let doc = roxmltree::Document::parse("<a><b><c>1</c></b></a>").unwrap();
        let root = doc.root_element();
        assert!(child(root, "b").is_some());
        assert!(child(root, "c").is_none());
        assert_eq!(child_text(child(root, "b").unwrap(), "c"), Some("1"));
    }

    #[test]
    fn test_int_parsing_trims() {
        let doc = roxmltree::Document::parse("<a><n> 42 </n></a>").unwrap();
        assert_eq!(req_int(doc.root_element(), "n").unwrap(), 42);
    }

    #[test]
    fn test_html_body_text() {
        let doc = roxmltree::Document::parse(
            "<Text><html-data><html><body><p> Sonata </p><p>No. 1</p></body></html></html-data></Text>",
        )
        .unwrap();
        assert_eq!(
            html_body_text(doc.root_element()).as_deref(),
            Some("SonataNo. 1")
        );
    }

    #[test]
    fn test_missing_required_child() {
        let doc = roxmltree::Document::parse("<a/>").unwrap();
        assert!(matches!(
            req_child(doc.root_element(), "b"),
            Err(ExtractError::MalformedDocument(_))
        ));
    }
}
