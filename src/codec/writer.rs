//! Document writer
//!
//! Every save draws a fresh inner stream key and re-encrypts every protected
//! value under it, in the same canonical order the reader binds them. The
//! re-keyed fields are staged while the whole document is built and only
//! written back into the tree once serialization succeeded and nothing changed
//! in the meantime. The document lock is held exclusively for the whole save,
//! and the commit still checks every field's binding before writing any.

use std::fmt;

use xmltree::{Element, EmitterConfig, XMLNode};

use crate::crypto::{InnerStreamKey, Keystream, SharedKeystream};
use crate::error::{KdbxError, KdbxResult};
use crate::protected::ProtectedField;
use crate::tree::element::{encode_uuid, for_each_protected_element, set_text, set_text_at, text_element};
use crate::tree::times::format_time;
use crate::tree::{Database, EntryRecord, Group};

/// Output of one save
pub struct SavedDocument {
    /// Serialized `<KeePassFile>`
    pub xml: Vec<u8>,
    /// Key for the envelope's inner random stream header field
    pub stream_key: InnerStreamKey,
    /// Number of protected values written
    pub protected_fields: usize,
}

impl fmt::Debug for SavedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedDocument")
            .field("bytes", &self.xml.len())
            .field("stream_key", &self.stream_key)
            .field("protected_fields", &self.protected_fields)
            .finish()
    }
}

/// A re-keyed field and the binding it replaces
struct StagedField {
    source: Option<(u64, SharedKeystream)>,
    rekeyed: ProtectedField,
}

impl StagedField {
    fn replaces(&self, field: &ProtectedField) -> bool {
        match (&self.source, field.binding()) {
            (Some((offset, keystream)), Some((current, handle))) => {
                *offset == current && keystream.ptr_eq(handle)
            }
            _ => false,
        }
    }
}

/// Re-keying state of one save pass; holds the fresh keystream exclusively
struct RekeyPass<'a> {
    target: &'a mut dyn Keystream,
    handle: &'a SharedKeystream,
    staged: Vec<StagedField>,
}

impl RekeyPass<'_> {
    fn rekey(&mut self, field: &ProtectedField) -> KdbxResult<String> {
        let rekeyed = field.rekey(self.target, self.handle)?;
        let encoded = rekeyed.encode_base64()?;
        self.staged.push(StagedField {
            source: field.binding().map(|(offset, ks)| (offset, ks.clone())),
            rekeyed,
        });
        Ok(encoded)
    }

    /// Re-key `fields` into the protected elements under `el`, in document order
    fn fill_masked(&mut self, el: &mut Element, fields: &[ProtectedField]) -> KdbxResult<()> {
        let mut remaining = fields.iter();
        for_each_protected_element(el, &mut |child| {
            let field = remaining.next().ok_or_else(|| {
                KdbxError::InvariantViolation(format!("protected <{}> has no bound value", child.name))
            })?;
            let encoded = self.rekey(field)?;
            set_text(child, &encoded);
            Ok(())
        })?;

        if remaining.next().is_some() {
            return Err(KdbxError::InvariantViolation(format!(
                "<{}> holds fewer protected elements than bound values",
                el.name
            )));
        }
        Ok(())
    }
}

/// Serialized document plus the fields waiting to be committed
struct Staged {
    xml: Vec<u8>,
    fields: Vec<StagedField>,
}

/// Serialize `db` under a fresh inner stream
pub fn write_document(db: &Database) -> KdbxResult<SavedDocument> {
    let _exclusive = db.state.exclusive();
    let generation = db.state.generation();
    let stream_key = InnerStreamKey::generate(db.state.config.stream_algorithm);
    let fresh = stream_key.keystream()?;

    let staged = serialize(db, &fresh).map_err(|e| {
        tracing::warn!("Save aborted, tree left unchanged: {}", e);
        e
    })?;
    let protected_fields = staged.fields.len();
    commit(db, generation, staged.fields)?;

    set_text_at(&mut db.meta.write().element, "Generator", &db.state.config.generator);
    tracing::info!(
        "Saved document ({}): {} protected values re-keyed, {} bytes",
        stream_key.algorithm().name(),
        protected_fields,
        staged.xml.len()
    );

    Ok(SavedDocument {
        xml: staged.xml,
        stream_key,
        protected_fields,
    })
}

fn serialize(db: &Database, fresh: &SharedKeystream) -> KdbxResult<Staged> {
    let mut cipher = fresh.lock();
    let mut pass = RekeyPass {
        target: &mut **cipher,
        handle: fresh,
        staged: Vec::new(),
    };

    let mut meta = {
        let block = db.meta.read();
        let mut el = block.element.clone();
        pass.fill_masked(&mut el, &block.masked)?;
        el
    };
    set_text_at(&mut meta, "Generator", &db.state.config.generator);

    let mut root = Element::new("Root");
    root.children
        .push(XMLNode::Element(write_group(&db.root, &mut pass)?));
    root.children.push(XMLNode::Element(write_deleted(db)));

    let mut doc = Element::new("KeePassFile");
    doc.children.push(XMLNode::Element(meta));
    doc.children.push(XMLNode::Element(root));

    let mut xml = Vec::new();
    let config = EmitterConfig::new().perform_indent(db.state.config.indent_xml);
    doc.write_with_config(&mut xml, config)
        .map_err(|e| KdbxError::Xml(e.to_string()))?;

    Ok(Staged {
        xml,
        fields: pass.staged,
    })
}

/// Write the staged fields back in canonical order, or nothing at all
fn commit(db: &Database, generation: u64, fields: Vec<StagedField>) -> KdbxResult<()> {
    if db.state.generation() != generation {
        tracing::warn!("Document changed during save; discarding {} staged values", fields.len());
        return Err(KdbxError::ConcurrentModification);
    }

    // every field must still carry the binding it was re-keyed from
    let mut visited = 0usize;
    let mut matched = true;
    db.for_each_protected_mut(&mut |field| {
        matched &= fields.get(visited).map_or(false, |staged| staged.replaces(field));
        visited += 1;
    });
    if !matched || visited != fields.len() {
        tracing::warn!(
            "Protected values changed during save ({} staged, {} in tree); nothing committed",
            fields.len(),
            visited
        );
        return Err(KdbxError::ConcurrentModification);
    }

    let mut staged = fields.into_iter();
    db.for_each_protected_mut(&mut |field| {
        if let Some(next) = staged.next() {
            *field = next.rekeyed;
        }
    });
    Ok(())
}

fn write_group(group: &Group, pass: &mut RekeyPass<'_>) -> KdbxResult<Element> {
    let children = {
        let state = group.inner.state.read();
        let mut el = state.head.clone();
        pass.fill_masked(&mut el, &state.masked)?;

        if state.entries.is_materialized() {
            for entry in state.entries.live() {
                let record = entry.inner.record.read();
                el.children.push(XMLNode::Element(write_entry(&record, pass)?));
            }
        } else {
            for record in state.entries.records() {
                el.children.push(XMLNode::Element(write_entry(record, pass)?));
            }
        }
        (el, state.groups.clone())
    };

    let (mut el, subgroups) = children;
    for child in &subgroups {
        el.children.push(XMLNode::Element(write_group(child, pass)?));
    }
    Ok(el)
}

fn write_entry(record: &EntryRecord, pass: &mut RekeyPass<'_>) -> KdbxResult<Element> {
    let mut strings = Vec::with_capacity(record.properties.len());
    for property in &record.properties {
        let mut value = Element::new("Value");
        if property.content.is_protected() {
            let encoded = pass.rekey(&property.content)?;
            value.attributes.insert("Protected".into(), "True".into());
            value.children.push(XMLNode::Text(encoded));
        } else {
            let text = property.content.text()?;
            if !text.is_empty() {
                value.children.push(XMLNode::Text(text.to_string()));
            }
        }

        let mut string = Element::new("String");
        string
            .children
            .push(XMLNode::Element(text_element("Key", &property.name)));
        string.children.push(XMLNode::Element(value));
        strings.push(XMLNode::Element(string));
    }

    // binaries and other protected head elements follow the strings
    let mut el = record.head.clone();
    pass.fill_masked(&mut el, &record.masked)?;
    let after = el.children.split_off(record.strings_at.min(el.children.len()));
    el.children.extend(strings);
    el.children.extend(after);

    if !record.history.is_empty() {
        let mut history = Element::new("History");
        for older in &record.history {
            history
                .children
                .push(XMLNode::Element(write_entry(older, pass)?));
        }
        el.children.push(XMLNode::Element(history));
    }

    Ok(el)
}

fn write_deleted(db: &Database) -> Element {
    let mut el = Element::new("DeletedObjects");
    for deleted in db.deleted_objects() {
        let mut object = Element::new("DeletedObject");
        object
            .children
            .push(XMLNode::Element(text_element("UUID", &encode_uuid(&deleted.uuid))));
        object.children.push(XMLNode::Element(text_element(
            "DeletionTime",
            &format_time(deleted.deleted_at),
        )));
        el.children.push(XMLNode::Element(object));
    }
    el
}
