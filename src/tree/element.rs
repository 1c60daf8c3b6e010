//! Path helpers over `xmltree` elements

use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;
use xmltree::{Element, XMLNode};

use crate::error::KdbxResult;

/// Element at a `/`-separated path below `el`
pub(crate) fn find<'a>(el: &'a Element, path: &str) -> Option<&'a Element> {
    path.split('/')
        .try_fold(el, |current, segment| current.get_child(segment))
}

/// Text of the element at `path`; an existing empty element yields `""`
pub(crate) fn text_at(el: &Element, path: &str) -> Option<String> {
    find(el, path).map(|e| e.get_text().map(|t| t.into_owned()).unwrap_or_default())
}

pub(crate) fn has_path(el: &Element, path: &str) -> bool {
    find(el, path).is_some()
}

/// Set the text at `path`, creating missing elements along the way
pub(crate) fn set_text_at(el: &mut Element, path: &str, value: &str) {
    let mut current = el;
    for segment in path.split('/') {
        let idx = match current
            .children
            .iter()
            .position(|n| matches!(n, XMLNode::Element(e) if e.name == segment))
        {
            Some(idx) => idx,
            None => {
                current.children.push(XMLNode::Element(Element::new(segment)));
                current.children.len() - 1
            }
        };
        current = match &mut current.children[idx] {
            XMLNode::Element(e) => e,
            _ => return,
        };
    }
    set_text(current, value);
}

/// Replace all children of `el` with a single text node
pub(crate) fn set_text(el: &mut Element, value: &str) {
    el.children.clear();
    if !value.is_empty() {
        el.children.push(XMLNode::Text(value.to_string()));
    }
}

pub(crate) fn text_element(name: &str, value: &str) -> Element {
    let mut el = Element::new(name);
    set_text(&mut el, value);
    el
}

/// Direct element children, in document order
pub(crate) fn child_elements(el: &Element) -> impl Iterator<Item = &Element> {
    el.children.iter().filter_map(|n| n.as_element())
}

/// KeePass stores UUIDs as base64 of the 16 raw bytes
pub(crate) fn encode_uuid(id: &Uuid) -> String {
    STANDARD.encode(id.as_bytes())
}

pub(crate) fn decode_uuid(text: &str) -> Option<Uuid> {
    let bytes = STANDARD.decode(text.trim()).ok()?;
    Uuid::from_slice(&bytes).ok()
}

pub(crate) fn parse_bool(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("true")
}

pub(crate) fn is_protected(el: &Element) -> bool {
    el.attributes.get("Protected").map_or(false, |v| parse_bool(v))
}

/// Every descendant of `el` flagged `Protected="True"`, depth-first in document order
pub(crate) fn for_each_protected_element(
    el: &mut Element,
    f: &mut dyn FnMut(&mut Element) -> KdbxResult<()>,
) -> KdbxResult<()> {
    for node in &mut el.children {
        if let XMLNode::Element(child) = node {
            if is_protected(child) {
                f(child)?;
            } else {
                for_each_protected_element(child, f)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_read_paths() {
        let mut group = Element::new("Group");
        set_text_at(&mut group, "Times/CreationTime", "2024-01-01T00:00:00Z");
        set_text_at(&mut group, "Times/Expires", "False");
        set_text_at(&mut group, "Notes", "");

        assert_eq!(child_elements(&group).count(), 2);
        assert_eq!(text_at(&group, "Times/Expires").as_deref(), Some("False"));
        assert_eq!(text_at(&group, "Notes").as_deref(), Some(""));
        assert_eq!(text_at(&group, "Name"), None);

        set_text_at(&mut group, "Times/Expires", "True");
        let times = group.get_child("Times").unwrap();
        assert_eq!(child_elements(times).count(), 2);
        assert!(parse_bool(&text_at(&group, "Times/Expires").unwrap()));
    }

    #[test]
    fn test_uuid_encoding() {
        let id = Uuid::new_v4();
        let encoded = encode_uuid(&id);
        assert_eq!(encoded.len(), 24);
        assert_eq!(decode_uuid(&encoded), Some(id));
        assert_eq!(decode_uuid("not base64!"), None);
    }

    #[test]
    fn test_protected_elements_in_document_order() {
        let xml = r#"<Meta><Binaries>
            <Binary ID="0" Protected="True">AAA=</Binary>
            <Binary ID="1">BBB=</Binary>
            <Binary ID="2" Protected="true">CCC=</Binary>
        </Binaries><Name Protected="False">x</Name></Meta>"#;
        let mut meta = Element::parse(xml.as_bytes()).unwrap();

        let mut seen = Vec::new();
        for_each_protected_element(&mut meta, &mut |e| {
            seen.push(e.attributes["ID"].clone());
            set_text(e, "");
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, vec!["0", "2"]);
        assert_eq!(text_at(&meta, "Binaries/Binary").as_deref(), Some(""));
    }
}
