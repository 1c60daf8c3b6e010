//! ALFA KDBX - Entries
//!
//! An entry is an ordered list of named properties plus a head element that
//! keeps everything else the document carries for it (UUID, Times, AutoType,
//! binaries, ...). Older versions live in `history`.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::RwLock;
use secrecy::ExposeSecret;
use uuid::Uuid;
use xmltree::Element;
use zeroize::Zeroizing;

use super::database::DatabaseState;
use super::defaults::{apply_defaults, mandatory_entry_defaults};
use super::element::{decode_uuid, encode_uuid, set_text_at, text_at};
use super::group::{Group, GroupInner};
use super::times::{self, Times, LAST_MODIFICATION_TIME, LOCATION_CHANGED};
use crate::error::KdbxResult;
use crate::protected::{ProtectedField, ProtectedSecret, SecretValue};

/// Standard property names
pub const TITLE: &str = "Title";
pub const USER_NAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

/// Named value owned by exactly one entry
#[derive(Debug, Clone)]
pub struct Property {
    pub(crate) name: String,
    pub(crate) content: ProtectedField,
}

impl Property {
    pub(crate) fn new(name: impl Into<String>, content: ProtectedField) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> &ProtectedField {
        &self.content
    }
}

/// Entry data as stored in the document
#[derive(Debug, Clone)]
pub(crate) struct EntryRecord {
    /// `<Entry>` without its `String` and `History` children
    pub(crate) head: Element,
    /// Index in `head.children` where the `String` elements belong
    pub(crate) strings_at: usize,
    pub(crate) properties: Vec<Property>,
    /// Values of `Protected="True"` elements left in `head` (binaries), in document order
    pub(crate) masked: Vec<ProtectedField>,
    pub(crate) history: Vec<EntryRecord>,
}

impl EntryRecord {
    pub(crate) fn new() -> Self {
        let mut head = Element::new("Entry");
        apply_defaults(&mut head, &mandatory_entry_defaults(), Utc::now());
        let strings_at = head.children.len();
        Self {
            head,
            strings_at,
            properties: Vec::new(),
            masked: Vec::new(),
            history: Vec::new(),
        }
    }

    pub(crate) fn uuid(&self) -> Option<Uuid> {
        text_at(&self.head, "UUID").and_then(|t| decode_uuid(&t))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Copy without history, as kept inside `<History>`
    fn snapshot(&self) -> Self {
        Self {
            head: self.head.clone(),
            strings_at: self.strings_at,
            properties: self.properties.clone(),
            masked: self.masked.clone(),
            history: Vec::new(),
        }
    }

    /// Own protected properties in order, then masked head values, then history entries
    pub(crate) fn for_each_protected_mut(&mut self, f: &mut dyn FnMut(&mut ProtectedField)) {
        for property in &mut self.properties {
            if property.content.is_protected() {
                f(&mut property.content);
            }
        }
        for field in &mut self.masked {
            f(field);
        }
        for older in &mut self.history {
            older.for_each_protected_mut(f);
        }
    }
}

/// Handle to a live entry
#[derive(Clone)]
pub struct Entry {
    pub(crate) inner: Arc<EntryInner>,
}

pub(crate) struct EntryInner {
    id: Uuid,
    db: RwLock<Arc<DatabaseState>>,
    owner: RwLock<Weak<GroupInner>>,
    pub(crate) record: RwLock<EntryRecord>,
}

impl Entry {
    // ═══════════════════════════════════════════════════════════════════════
    // CONSTRUCTION
    // ═══════════════════════════════════════════════════════════════════════

    /// Fresh detached entry with default fields and a title
    pub(crate) fn create(db: &Arc<DatabaseState>, title: &str) -> KdbxResult<Self> {
        db.ensure_writable()?;
        let mut record = EntryRecord::new();
        if !title.is_empty() {
            record
                .properties
                .push(Property::new(TITLE, ProtectedField::plain(title)));
        }
        Ok(Self::from_record(record, db, Weak::new()))
    }

    pub(crate) fn from_record(
        mut record: EntryRecord,
        db: &Arc<DatabaseState>,
        owner: Weak<GroupInner>,
    ) -> Self {
        let id = match record.uuid() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                set_text_at(&mut record.head, "UUID", &encode_uuid(&id));
                id
            }
        };
        Self {
            inner: Arc::new(EntryInner {
                id,
                db: RwLock::new(db.clone()),
                owner: RwLock::new(owner),
                record: RwLock::new(record),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OWNERSHIP
    // ═══════════════════════════════════════════════════════════════════════

    /// Group that currently owns this entry
    pub fn group(&self) -> Option<Group> {
        self.inner.owner.read().upgrade().map(|inner| Group { inner })
    }

    pub(crate) fn database(&self) -> Arc<DatabaseState> {
        self.inner.db.read().clone()
    }

    pub(crate) fn attach(&self, group: &Group) {
        *self.inner.owner.write() = Arc::downgrade(&group.inner);
        *self.inner.db.write() = group.inner.db.clone();
        times::touch(&mut self.inner.record.write().head, LOCATION_CHANGED);
    }

    pub(crate) fn detach(&self) {
        *self.inner.owner.write() = Weak::new();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PLAIN PROPERTIES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn title(&self) -> KdbxResult<Option<String>> {
        self.get_plain(TITLE)
    }

    pub fn user_name(&self) -> KdbxResult<Option<String>> {
        self.get_plain(USER_NAME)
    }

    /// Raw text of a plain property; protected properties refuse
    pub fn get_plain(&self, name: &str) -> KdbxResult<Option<String>> {
        let record = self.inner.record.read();
        match record.property(name) {
            Some(property) => Ok(Some(property.content.text()?.to_owned())),
            None => Ok(None),
        }
    }

    /// Set a plain property. Empty and absent are the same value; writing the
    /// current value changes nothing. A protected property stays protected.
    pub fn set_plain(&self, name: &str, value: &str) -> KdbxResult<()> {
        let db = self.database();
        let _edit = db.edit();
        db.ensure_writable()?;

        let mut record = self.inner.record.write();
        let current = match record.property(name) {
            Some(property) => Some(property.content.decrypt()?),
            None => None,
        };
        if current.as_deref().map(String::as_str).unwrap_or("") == value {
            return Ok(());
        }

        match record.position(name) {
            Some(idx) if value.is_empty() => {
                record.properties.remove(idx);
            }
            Some(idx) => {
                let content = &mut record.properties[idx].content;
                *content = if content.is_protected() {
                    ProtectedField::pending(value, db.ephemeral())?
                } else {
                    ProtectedField::plain(value)
                };
            }
            None => record
                .properties
                .push(Property::new(name, ProtectedField::plain(value))),
        }

        times::touch(&mut record.head, LAST_MODIFICATION_TIME);
        db.mark_dirty();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SECRETS
    // ═══════════════════════════════════════════════════════════════════════

    /// The password
    pub fn get_secret(&self) -> KdbxResult<Option<ProtectedSecret>> {
        self.get_property_secret(PASSWORD)
    }

    /// Set the password; `None` removes the property
    pub fn set_secret(&self, value: Option<&dyn SecretValue>) -> KdbxResult<()> {
        self.set_property_secret(PASSWORD, value)
    }

    /// Any property as a secret. A plain value is promoted in place to a
    /// protected one first, unless the database is read-only or configured
    /// not to.
    pub fn get_property_secret(&self, name: &str) -> KdbxResult<Option<ProtectedSecret>> {
        let db = self.database();
        let _edit = db.edit();
        let mut record = self.inner.record.write();
        let Some(idx) = record.position(name) else {
            return Ok(None);
        };

        let content = &mut record.properties[idx].content;
        if !content.is_protected() && db.config.protect_on_read && !db.config.read_only {
            let text = Zeroizing::new(content.text()?.to_owned());
            *content = ProtectedField::pending(&text, db.ephemeral())?;
            db.mark_dirty();
            tracing::debug!("Promoted plain property '{}' of entry {} to protected", name, self.inner.id);
        }

        Ok(Some(ProtectedSecret::new(content.clone())))
    }

    pub fn set_property_secret(&self, name: &str, value: Option<&dyn SecretValue>) -> KdbxResult<()> {
        let db = self.database();
        let _edit = db.edit();
        db.ensure_writable()?;

        let Some(value) = value else {
            let mut record = self.inner.record.write();
            if let Some(idx) = record.position(name) {
                record.properties.remove(idx);
                times::touch(&mut record.head, LAST_MODIFICATION_TIME);
                db.mark_dirty();
            }
            return Ok(());
        };

        // resolve the value before taking our own lock
        let secret = value.get(true)?;
        let field = ProtectedField::pending(secret.expose_secret(), db.ephemeral())?;

        let mut record = self.inner.record.write();
        let changed = match record.position(name) {
            Some(idx) => {
                let previous = record.properties[idx].content.decrypt().ok();
                record.properties[idx].content = field;
                previous.map_or(true, |p| p.as_str() != secret.expose_secret())
            }
            None => {
                record.properties.push(Property::new(name, field));
                true
            }
        };

        if changed {
            times::touch(&mut record.head, LAST_MODIFICATION_TIME);
            db.mark_dirty();
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INSPECTION
    // ═══════════════════════════════════════════════════════════════════════

    /// Current field of a property
    pub fn field(&self, name: &str) -> Option<ProtectedField> {
        self.inner.record.read().property(name).map(|p| p.content.clone())
    }

    pub fn property_names(&self) -> Vec<String> {
        self.inner
            .record
            .read()
            .properties
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn times(&self) -> Times {
        Times::read(&self.inner.record.read().head)
    }

    /// Bump usage count and access time
    pub fn touch_access(&self) -> KdbxResult<()> {
        let db = self.database();
        let _edit = db.edit();
        db.ensure_writable()?;
        times::record_access(&mut self.inner.record.write().head);
        db.mark_dirty();
        Ok(())
    }

    pub fn history_len(&self) -> usize {
        self.inner.record.read().history.len()
    }

    /// Push a copy of the current state into `<History>`
    pub fn backup_to_history(&self) -> KdbxResult<()> {
        let db = self.database();
        let _edit = db.edit();
        db.ensure_writable()?;
        let mut record = self.inner.record.write();
        let snapshot = record.snapshot();
        record.history.push(snapshot);
        db.mark_dirty();
        Ok(())
    }

    /// Property text whether protected or not, without promotion
    pub(crate) fn property_text(&self, name: &str) -> KdbxResult<Option<Zeroizing<String>>> {
        let record = self.inner.record.read();
        record.property(name).map(|p| p.content.decrypt()).transpose()
    }

    /// Title and (when given) user name match
    pub(crate) fn matches(&self, title: &str, user_name: Option<&str>) -> KdbxResult<bool> {
        let entry_title = self.property_text(TITLE)?;
        if entry_title.as_deref().map(String::as_str).unwrap_or("") != title {
            return Ok(false);
        }
        match user_name {
            None => Ok(true),
            Some(wanted) => {
                let actual = self.property_text(USER_NAME)?;
                Ok(actual.as_deref().map(String::as_str).unwrap_or("") == wanted)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn replace_field(&self, name: &str, content: ProtectedField) {
        let mut record = self.inner.record.write();
        match record.position(name) {
            Some(idx) => record.properties[idx].content = content,
            None => record.properties.push(Property::new(name, content)),
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entry {}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("uuid", &self.inner.id)
            .field("properties", &self.property_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KdbxError;
    use crate::tree::Database;

    fn entry() -> (Database, Entry) {
        let db = Database::new().unwrap();
        let entry = db.root_group().get_or_create_entry("github", Some("alice")).unwrap();
        db.set_dirty(false);
        (db, entry)
    }

    #[test]
    fn test_set_plain_noop_keeps_dirty_and_modified() {
        let (db, entry) = entry();
        let modified = text_at(&entry.inner.record.read().head, LAST_MODIFICATION_TIME);

        entry.set_plain(TITLE, "github").unwrap();

        assert!(!db.is_dirty());
        assert_eq!(
            text_at(&entry.inner.record.read().head, LAST_MODIFICATION_TIME),
            modified
        );
    }

    #[test]
    fn test_set_plain_empty_equals_absent() {
        let (db, entry) = entry();

        entry.set_plain(URL, "").unwrap();
        assert!(!db.is_dirty());
        assert!(entry.get_plain(URL).unwrap().is_none());

        entry.set_plain(URL, "https://github.com").unwrap();
        assert!(db.is_dirty());
        assert_eq!(entry.get_plain(URL).unwrap().as_deref(), Some("https://github.com"));
    }

    #[test]
    fn test_set_plain_empty_removes_property() {
        let (db, entry) = entry();
        entry.set_plain(URL, "x").unwrap();
        db.set_dirty(false);

        entry.set_plain(URL, "").unwrap();

        assert!(db.is_dirty());
        assert!(entry.get_plain(URL).unwrap().is_none());
        assert_eq!(entry.property_names(), vec![TITLE.to_string(), USER_NAME.to_string()]);

        // already absent
        db.set_dirty(false);
        entry.set_plain(URL, "").unwrap();
        assert!(!db.is_dirty());
    }

    #[test]
    fn test_secret_set_and_get() {
        let (db, entry) = entry();

        entry.set_secret(Some(&"hunter2")).unwrap();
        assert!(db.is_dirty());
        assert!(matches!(entry.field(PASSWORD), Some(ProtectedField::Pending { .. })));

        let secret = entry.get_secret().unwrap().unwrap();
        assert_eq!(secret.get(false).unwrap().expose_secret(), "hunter2");

        // raw access refused
        assert!(matches!(entry.get_plain(PASSWORD), Err(KdbxError::IllegalAccess(_))));
    }

    #[test]
    fn test_same_secret_does_not_dirty() {
        let (db, entry) = entry();
        entry.set_secret(Some(&"hunter2")).unwrap();
        db.set_dirty(false);

        entry.set_secret(Some(&"hunter2")).unwrap();
        assert!(!db.is_dirty());

        entry.set_secret(Some(&"hunter3")).unwrap();
        assert!(db.is_dirty());
    }

    #[test]
    fn test_clear_secret_removes_property() {
        let (db, entry) = entry();

        entry.set_secret(None).unwrap();
        assert!(!db.is_dirty());

        entry.set_secret(Some(&"x")).unwrap();
        db.set_dirty(false);
        entry.set_secret(None).unwrap();

        assert!(db.is_dirty());
        assert!(entry.get_secret().unwrap().is_none());
        assert!(!entry.property_names().contains(&PASSWORD.to_string()));
    }

    #[test]
    fn test_plain_promoted_on_read() {
        let (db, entry) = entry();
        entry.set_plain(NOTES, "pin 1234").unwrap();
        db.set_dirty(false);

        let secret = entry.get_property_secret(NOTES).unwrap().unwrap();
        assert!(secret.is_protected());
        assert!(db.is_dirty());
        assert!(matches!(entry.field(NOTES), Some(ProtectedField::Pending { .. })));
        assert_eq!(secret.get(true).unwrap().expose_secret(), "pin 1234");

        // protected from now on; plain writes keep it masked
        entry.set_plain(NOTES, "pin 5678").unwrap();
        assert!(entry.field(NOTES).unwrap().is_protected());
    }

    #[test]
    fn test_history_snapshot() {
        let (_db, entry) = entry();
        entry.set_secret(Some(&"old")).unwrap();
        entry.backup_to_history().unwrap();
        entry.set_secret(Some(&"new")).unwrap();

        assert_eq!(entry.history_len(), 1);
        let record = entry.inner.record.read();
        let old = record.history[0].property(PASSWORD).unwrap();
        assert_eq!(old.content.decrypt().unwrap().as_str(), "old");
    }

    #[test]
    fn test_touch_access() {
        let (db, entry) = entry();
        entry.touch_access().unwrap();
        entry.touch_access().unwrap();

        assert_eq!(entry.times().usage_count, 2);
        assert!(db.is_dirty());
    }
}
