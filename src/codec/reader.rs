//! Document reader
//!
//! Protected values are bound to the load keystream in canonical order:
//! `Meta` first, then per group its own protected elements, its entries (each
//! entry's `String` values, its other protected elements such as binaries,
//! then its history), then its subgroups. The running offset is the sum of the
//! decoded lengths of all protected values before the current one, so no
//! cipher work happens here.
//!
//! Protected elements outside `String` values keep their place in the element
//! tree with the text cleared; the bound value lives next to the tree.

use std::sync::{Arc, Weak};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use xmltree::{Element, XMLNode};

use crate::config::DatabaseConfig;
use crate::crypto::{InnerStreamKey, SharedKeystream};
use crate::error::{KdbxError, KdbxResult};
use crate::protected::ProtectedField;
use crate::tree::element::{decode_uuid, for_each_protected_element, parse_bool, set_text, text_at};
use crate::tree::times::parse_time;
use crate::tree::{
    Database, DatabaseState, DeletedObject, EntryRecord, EntrySlot, Group, GroupInner, Property,
};

/// Assigns sequential offsets on the load keystream
struct OffsetBinder {
    keystream: SharedKeystream,
    offset: u64,
    bound: usize,
    groups: usize,
    entries: usize,
}

impl OffsetBinder {
    fn new(keystream: SharedKeystream) -> Self {
        Self {
            keystream,
            offset: 0,
            bound: 0,
            groups: 0,
            entries: 0,
        }
    }

    fn bind(&mut self, encoded: &str) -> KdbxResult<ProtectedField> {
        let ciphertext = STANDARD.decode(encoded.trim())?;
        let len = ciphertext.len() as u64;
        let field = ProtectedField::bound(ciphertext, self.offset, self.keystream.clone());
        self.offset += len;
        self.bound += 1;
        Ok(field)
    }

    /// Bind every `Protected="True"` element under `el`, clearing its text
    fn bind_masked(&mut self, el: &mut Element) -> KdbxResult<Vec<ProtectedField>> {
        let mut masked = Vec::new();
        for_each_protected_element(el, &mut |child| {
            let text = child.get_text().map(|t| t.into_owned()).unwrap_or_default();
            masked.push(self.bind(&text)?);
            set_text(child, "");
            Ok(())
        })?;
        Ok(masked)
    }
}

/// Parse a `<KeePassFile>` document
pub fn read_document(
    xml: &[u8],
    stream_key: &InnerStreamKey,
    config: DatabaseConfig,
) -> KdbxResult<Database> {
    let doc = Element::parse(xml).map_err(|e| KdbxError::Xml(e.to_string()))?;
    if doc.name != "KeePassFile" {
        return Err(KdbxError::MissingElement("KeePassFile".into()));
    }

    let mut meta = doc
        .get_child("Meta")
        .cloned()
        .unwrap_or_else(|| Element::new("Meta"));
    let root_el = doc
        .get_child("Root")
        .ok_or_else(|| KdbxError::MissingElement("Root".into()))?;
    let group_el = root_el
        .get_child("Group")
        .ok_or_else(|| KdbxError::MissingElement("Root/Group".into()))?;

    let state = Arc::new(DatabaseState::new(config)?);
    let mut binder = OffsetBinder::new(stream_key.keystream()?);

    // Meta precedes Root in the document
    let meta_masked = binder.bind_masked(&mut meta)?;
    let root = read_group(group_el, &state, Weak::new(), &mut binder)?;
    if let Some(deleted) = root_el.get_child("DeletedObjects") {
        state.set_deleted(read_deleted(deleted));
    }

    tracing::info!(
        "Loaded document ({}): {} groups, {} entries, {} protected values ({} keystream bytes)",
        stream_key.algorithm().name(),
        binder.groups,
        binder.entries,
        binder.bound,
        binder.offset
    );

    Ok(Database::from_parts(state, root, meta, meta_masked))
}

/// Copy of `el` without children
pub(crate) fn shell(el: &Element) -> Element {
    let mut out = Element::new(&el.name);
    out.prefix = el.prefix.clone();
    out.namespace = el.namespace.clone();
    out.namespaces = el.namespaces.clone();
    out.attributes = el.attributes.clone();
    out
}

fn read_group(
    el: &Element,
    state: &Arc<DatabaseState>,
    parent: Weak<GroupInner>,
    binder: &mut OffsetBinder,
) -> KdbxResult<Group> {
    binder.groups += 1;

    let mut head = shell(el);
    let mut entries = Vec::new();
    let mut subgroups = Vec::new();

    for node in &el.children {
        match node {
            XMLNode::Element(child) if child.name == "Entry" => entries.push(child),
            XMLNode::Element(child) if child.name == "Group" => subgroups.push(child),
            other => head.children.push(other.clone()),
        }
    }

    // own elements, then entries, then subgroups
    let masked = binder.bind_masked(&mut head)?;
    let records = entries
        .into_iter()
        .map(|child| read_entry(child, state, binder, true))
        .collect::<KdbxResult<Vec<_>>>()?;

    let group = Group::from_parts(state, parent, head, masked, EntrySlot::from_records(records));
    for child in subgroups {
        let loaded = read_group(child, state, Arc::downgrade(&group.inner), binder)?;
        group.push_loaded_child(loaded);
    }

    Ok(group)
}

fn read_entry(
    el: &Element,
    state: &Arc<DatabaseState>,
    binder: &mut OffsetBinder,
    with_history: bool,
) -> KdbxResult<EntryRecord> {
    binder.entries += 1;

    let mut head = shell(el);
    let mut strings_at = None;
    let mut properties = Vec::new();
    let mut history_el = None;

    for node in &el.children {
        match node {
            XMLNode::Element(child) if child.name == "String" => {
                strings_at.get_or_insert(head.children.len());
                properties.push(read_property(child, state, binder)?);
            }
            XMLNode::Element(child) if child.name == "History" && with_history => {
                history_el = Some(child);
            }
            other => head.children.push(other.clone()),
        }
    }

    // other protected elements after the strings, history last
    let masked = binder.bind_masked(&mut head)?;
    let mut history = Vec::new();
    if let Some(history_el) = history_el {
        for older in history_el.children.iter().filter_map(XMLNode::as_element) {
            if older.name == "Entry" {
                history.push(read_entry(older, state, binder, false)?);
            }
        }
    }

    let strings_at = strings_at.unwrap_or(head.children.len());
    Ok(EntryRecord {
        head,
        strings_at,
        properties,
        masked,
        history,
    })
}

fn read_property(
    el: &Element,
    state: &Arc<DatabaseState>,
    binder: &mut OffsetBinder,
) -> KdbxResult<Property> {
    let name = text_at(el, "Key").ok_or_else(|| KdbxError::MissingElement("String/Key".into()))?;

    let Some(value) = el.get_child("Value") else {
        return Ok(Property::new(name, ProtectedField::plain("")));
    };
    let text = value.get_text().map(|t| t.into_owned()).unwrap_or_default();
    let flag = |attr: &str| value.attributes.get(attr).map_or(false, |v| parse_bool(v));

    let content = if flag("Protected") {
        binder.bind(&text)?
    } else if flag("ProtectInMemory") {
        ProtectedField::pending(&text, state.ephemeral())?
    } else {
        ProtectedField::plain(text)
    };
    Ok(Property::new(name, content))
}

fn read_deleted(el: &Element) -> Vec<DeletedObject> {
    el.children
        .iter()
        .filter_map(XMLNode::as_element)
        .filter(|e| e.name == "DeletedObject")
        .filter_map(|e| {
            let uuid = text_at(e, "UUID").and_then(|t| decode_uuid(&t));
            let deleted_at = text_at(e, "DeletionTime").and_then(|t| parse_time(&t));
            match (uuid, deleted_at) {
                (Some(uuid), Some(deleted_at)) => Some(DeletedObject { uuid, deleted_at }),
                _ => {
                    tracing::warn!("Skipping malformed DeletedObject");
                    None
                }
            }
        })
        .collect()
}
