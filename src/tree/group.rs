//! ALFA KDBX - Groups
//!
//! A group owns its child groups and its entries. Entries loaded from a
//! document stay as records until the entry list is first asked for; the
//! `materialized` flag guards that one-time conversion.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;
use xmltree::Element;

use super::database::DatabaseState;
use super::defaults::{apply_defaults, mandatory_group_defaults};
use super::element::{decode_uuid, set_text_at, text_at};
use super::entry::{Entry, EntryRecord, USER_NAME};
use super::times::{self, Times, LAST_MODIFICATION_TIME, LOCATION_CHANGED};
use crate::error::{KdbxError, KdbxResult};
use crate::protected::ProtectedField;

/// Entry list of a group, materialized on first access
pub(crate) struct EntrySlot {
    materialized: bool,
    records: Vec<EntryRecord>,
    live: Vec<Entry>,
}

impl EntrySlot {
    pub(crate) fn from_records(records: Vec<EntryRecord>) -> Self {
        Self {
            materialized: false,
            records,
            live: Vec::new(),
        }
    }

    fn empty() -> Self {
        Self {
            materialized: true,
            records: Vec::new(),
            live: Vec::new(),
        }
    }

    pub(crate) fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Records not yet turned into entries
    pub(crate) fn records(&self) -> &[EntryRecord] {
        &self.records
    }

    pub(crate) fn live(&self) -> &[Entry] {
        &self.live
    }
}

pub(crate) struct GroupState {
    /// `<Group>` without its `Entry` and `Group` children
    pub(crate) head: Element,
    /// Values of `Protected="True"` elements left in `head`, in document order
    pub(crate) masked: Vec<ProtectedField>,
    pub(crate) entries: EntrySlot,
    pub(crate) groups: Vec<Group>,
}

pub(crate) struct GroupInner {
    pub(crate) db: Arc<DatabaseState>,
    parent: RwLock<Weak<GroupInner>>,
    pub(crate) state: RwLock<GroupState>,
}

/// Handle to a group
#[derive(Clone)]
pub struct Group {
    pub(crate) inner: Arc<GroupInner>,
}

impl Group {
    // ═══════════════════════════════════════════════════════════════════════
    // CONSTRUCTION
    // ═══════════════════════════════════════════════════════════════════════

    /// New group element with every mandatory default and the given name
    pub(crate) fn build(db: &Arc<DatabaseState>, parent: Weak<GroupInner>, name: &str) -> Self {
        let mut head = Element::new("Group");
        apply_defaults(&mut head, &mandatory_group_defaults(), Utc::now());
        set_text_at(&mut head, "Name", name);
        Self::from_parts(db, parent, head, Vec::new(), EntrySlot::empty())
    }

    pub(crate) fn from_parts(
        db: &Arc<DatabaseState>,
        parent: Weak<GroupInner>,
        head: Element,
        masked: Vec<ProtectedField>,
        entries: EntrySlot,
    ) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                db: db.clone(),
                parent: RwLock::new(parent),
                state: RwLock::new(GroupState {
                    head,
                    masked,
                    entries,
                    groups: Vec::new(),
                }),
            }),
        }
    }

    /// Append a child while a document is being read
    pub(crate) fn push_loaded_child(&self, child: Group) {
        self.inner.state.write().groups.push(child);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PROPERTIES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn uuid(&self) -> Option<Uuid> {
        text_at(&self.inner.state.read().head, "UUID").and_then(|t| decode_uuid(&t))
    }

    pub fn name(&self) -> String {
        text_at(&self.inner.state.read().head, "Name").unwrap_or_default()
    }

    pub fn notes(&self) -> String {
        text_at(&self.inner.state.read().head, "Notes").unwrap_or_default()
    }

    pub fn times(&self) -> Times {
        Times::read(&self.inner.state.read().head)
    }

    /// Rename; the new name must be free among the siblings
    pub fn set_name(&self, name: &str) -> KdbxResult<()> {
        let _edit = self.inner.db.edit();
        self.inner.db.ensure_writable()?;
        if self.name() == name {
            return Ok(());
        }
        if let Some(parent) = self.parent() {
            parent.check_name_free(name, Some(self))?;
        }

        let mut state = self.inner.state.write();
        set_text_at(&mut state.head, "Name", name);
        times::touch(&mut state.head, LAST_MODIFICATION_TIME);
        self.inner.db.mark_dirty();
        Ok(())
    }

    pub fn parent(&self) -> Option<Group> {
        self.inner.parent.read().upgrade().map(|inner| Group { inner })
    }

    pub fn is_root(&self) -> bool {
        self.inner.db.is_root(&self.inner)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CHILD GROUPS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn groups(&self) -> Vec<Group> {
        self.inner.state.read().groups.clone()
    }

    pub fn get_group(&self, name: &str) -> Option<Group> {
        self.groups().into_iter().find(|g| g.name() == name)
    }

    /// Precondition for `create_subgroup`; has no side effects
    pub fn check_create_subgroup(&self, name: &str) -> KdbxResult<()> {
        self.inner.db.ensure_writable()?;
        self.check_name_free(name, None)
    }

    /// Build, populate defaults, check the root invariant, attach
    pub fn create_subgroup(&self, name: &str) -> KdbxResult<Group> {
        let _edit = self.inner.db.edit();
        self.check_create_subgroup(name)?;

        let group = Group::build(&self.inner.db, Arc::downgrade(&self.inner), name);
        if group.is_root() {
            tracing::error!("Newly created group '{}' resolved to the root group", name);
            return Err(KdbxError::InvariantViolation(format!(
                "new group '{}' is identical to the root group",
                name
            )));
        }

        self.inner.state.write().groups.push(group.clone());
        self.inner.db.mark_dirty();
        tracing::debug!("Created group '{}' under '{}'", name, self.name());
        Ok(group)
    }

    pub fn get_or_create_group(&self, name: &str) -> KdbxResult<Group> {
        match self.get_group(name) {
            Some(group) => Ok(group),
            None => self.create_subgroup(name),
        }
    }

    /// Precondition for `add_group`; has no side effects
    pub fn check_add_group(&self, child: &Group) -> KdbxResult<()> {
        self.inner.db.ensure_writable()?;
        if !Arc::ptr_eq(&self.inner.db, &child.inner.db) {
            return Err(KdbxError::ForeignDatabase);
        }
        if child.is_root() {
            return Err(KdbxError::RootNotMovable);
        }

        let mut cursor = Some(self.clone());
        while let Some(group) = cursor {
            if group == *child {
                return Err(KdbxError::WouldCycle(child.name()));
            }
            cursor = group.parent();
        }

        self.check_name_free(&child.name(), Some(child))
    }

    /// Move `child` (and its subtree) under this group
    pub fn add_group(&self, child: &Group) -> KdbxResult<()> {
        let _edit = self.inner.db.edit();
        self.check_add_group(child)?;

        if let Some(previous) = child.parent() {
            if previous == *self {
                return Ok(());
            }
            previous.inner.state.write().groups.retain(|g| g != child);
        }

        self.inner.state.write().groups.push(child.clone());
        *child.inner.parent.write() = Arc::downgrade(&self.inner);
        times::touch(&mut child.inner.state.write().head, LOCATION_CHANGED);
        self.inner.db.mark_dirty();
        tracing::debug!("Moved group '{}' under '{}'", child.name(), self.name());
        Ok(())
    }

    /// Detach a child group; records the whole subtree as deleted
    pub fn remove_group(&self, name: &str) -> KdbxResult<Option<Group>> {
        let _edit = self.inner.db.edit();
        self.inner.db.ensure_writable()?;

        let Some(removed) = self.get_group(name) else {
            return Ok(None);
        };
        self.inner.state.write().groups.retain(|g| *g != removed);
        *removed.inner.parent.write() = Weak::new();

        let mut deleted = Vec::new();
        removed.collect_uuids(&mut deleted);
        self.inner.db.record_deletions(deleted);
        self.inner.db.mark_dirty();
        Ok(Some(removed))
    }

    fn check_name_free(&self, name: &str, except: Option<&Group>) -> KdbxResult<()> {
        let taken = self
            .groups()
            .into_iter()
            .filter(|g| except.map_or(true, |e| g != e))
            .any(|g| g.name() == name);
        if taken {
            return Err(KdbxError::NameCollision(name.to_string()));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENTRIES
    // ═══════════════════════════════════════════════════════════════════════

    /// Turn loaded records into live entries, once
    fn materialize(&self) {
        if self.inner.state.read().entries.materialized {
            return;
        }

        let mut state = self.inner.state.write();
        if state.entries.materialized {
            return;
        }
        let owner = Arc::downgrade(&self.inner);
        let records = std::mem::take(&mut state.entries.records);
        state.entries.live = records
            .into_iter()
            .map(|record| Entry::from_record(record, &self.inner.db, owner.clone()))
            .collect();
        state.entries.materialized = true;
        tracing::trace!("Materialized {} entries", state.entries.live.len());
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.materialize();
        self.inner.state.read().entries.live.clone()
    }

    pub fn entry_count(&self) -> usize {
        let state = self.inner.state.read();
        if state.entries.materialized {
            state.entries.live.len()
        } else {
            state.entries.records.len()
        }
    }

    /// First entry with this title and, when given, this user name
    pub fn find_entry(&self, title: &str, user_name: Option<&str>) -> KdbxResult<Option<Entry>> {
        for entry in self.entries() {
            if entry.matches(title, user_name)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn get_or_create_entry(&self, title: &str, user_name: Option<&str>) -> KdbxResult<Entry> {
        if let Some(entry) = self.find_entry(title, user_name)? {
            return Ok(entry);
        }

        let entry = Entry::create(&self.inner.db, title)?;
        if let Some(user_name) = user_name {
            entry.set_plain(USER_NAME, user_name)?;
        }
        self.add_entry(&entry)?;
        Ok(entry)
    }

    /// Take ownership of `entry`, detaching it from its previous group first
    pub fn add_entry(&self, entry: &Entry) -> KdbxResult<()> {
        let _edit = self.inner.db.edit();
        self.inner.db.ensure_writable()?;

        if let Some(previous) = entry.group() {
            if previous == *self {
                return Ok(());
            }
            previous.remove_entry(entry)?;
        }

        self.materialize();
        self.inner.state.write().entries.live.push(entry.clone());
        entry.attach(self);
        self.inner.db.mark_dirty();
        tracing::debug!("Entry {} added to group '{}'", entry.uuid(), self.name());
        Ok(())
    }

    /// Detach `entry` if this group owns it
    pub fn remove_entry(&self, entry: &Entry) -> KdbxResult<bool> {
        let _edit = self.inner.db.edit();
        self.inner.db.ensure_writable()?;
        self.materialize();

        let removed = {
            let mut state = self.inner.state.write();
            let before = state.entries.live.len();
            state.entries.live.retain(|e| e != entry);
            before != state.entries.live.len()
        };

        if removed {
            entry.detach();
            self.inner.db.mark_dirty();
        }
        Ok(removed)
    }

    /// Remove and record the entry as deleted
    pub fn delete_entry(&self, entry: &Entry) -> KdbxResult<bool> {
        let _edit = self.inner.db.edit();
        let removed = self.remove_entry(entry)?;
        if removed {
            self.inner.db.record_deletions([entry.uuid()]);
        }
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRAVERSAL
    // ═══════════════════════════════════════════════════════════════════════

    /// Protected fields in canonical order: the group's own masked elements,
    /// its entries (with their history), then subgroups
    pub(crate) fn for_each_protected_mut(&self, f: &mut dyn FnMut(&mut ProtectedField)) {
        let groups = {
            let mut state = self.inner.state.write();
            for field in &mut state.masked {
                f(field);
            }
            if state.entries.materialized {
                for entry in &state.entries.live {
                    entry.inner.record.write().for_each_protected_mut(f);
                }
            } else {
                for record in &mut state.entries.records {
                    record.for_each_protected_mut(f);
                }
            }
            state.groups.clone()
        };

        for group in groups {
            group.for_each_protected_mut(f);
        }
    }

    /// Depth-first search by UUID
    pub(crate) fn find_entry_by_uuid(&self, id: Uuid) -> Option<Entry> {
        if let Some(entry) = self.entries().into_iter().find(|e| e.uuid() == id) {
            return Some(entry);
        }
        self.groups()
            .into_iter()
            .find_map(|group| group.find_entry_by_uuid(id))
    }

    fn collect_uuids(&self, out: &mut Vec<Uuid>) {
        if let Some(id) = self.uuid() {
            out.push(id);
        }
        {
            let state = self.inner.state.read();
            out.extend(state.entries.live.iter().map(Entry::uuid));
            out.extend(state.entries.records.iter().filter_map(EntryRecord::uuid));
        }
        for group in self.groups() {
            group.collect_uuids(out);
        }
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Group {}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name())
            .field("entries", &self.entry_count())
            .field("groups", &self.inner.state.read().groups.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::entry::{PASSWORD, TITLE};
    use crate::tree::Database;
    use secrecy::ExposeSecret;
    use crate::protected::SecretValue;

    #[test]
    fn test_create_subgroup_defaults() {
        let db = Database::new().unwrap();
        let root = db.root_group();
        db.set_dirty(false);

        let email = root.create_subgroup("Email").unwrap();

        assert!(db.is_dirty());
        assert_eq!(email.name(), "Email");
        assert_eq!(email.notes(), "");
        assert!(email.uuid().is_some());
        assert_ne!(email.uuid(), root.uuid());
        assert_eq!(email.parent(), Some(root.clone()));
        assert!(!email.is_root());
        assert!(email.times().created.is_some());
        assert!(!email.times().expires);
    }

    #[test]
    fn test_name_collision_is_precondition() {
        let db = Database::new().unwrap();
        let root = db.root_group();
        root.create_subgroup("Email").unwrap();
        db.set_dirty(false);

        let err = root.check_create_subgroup("Email").unwrap_err();
        assert!(err.is_precondition());
        // check alone changes nothing
        assert!(!db.is_dirty());
        assert_eq!(root.groups().len(), 1);

        assert!(matches!(
            root.create_subgroup("Email"),
            Err(KdbxError::NameCollision(_))
        ));
        assert_eq!(root.groups().len(), 1);
    }

    #[test]
    fn test_root_cannot_become_child() {
        let db = Database::new().unwrap();
        let root = db.root_group();
        let child = root.create_subgroup("Child").unwrap();

        assert!(matches!(child.add_group(&root), Err(KdbxError::RootNotMovable)));
    }

    #[test]
    fn test_no_cycles() {
        let db = Database::new().unwrap();
        let root = db.root_group();
        let a = root.create_subgroup("A").unwrap();
        let b = a.create_subgroup("B").unwrap();

        assert!(matches!(b.add_group(&a), Err(KdbxError::WouldCycle(_))));
        assert!(matches!(a.add_group(&a), Err(KdbxError::WouldCycle(_))));

        // moving sideways is fine
        let c = root.create_subgroup("C").unwrap();
        c.add_group(&b).unwrap();
        assert_eq!(b.parent(), Some(c.clone()));
        assert!(a.groups().is_empty());
    }

    #[test]
    fn test_move_entry_between_databases() {
        let db_a = Database::new().unwrap();
        let db_b = Database::new().unwrap();
        let a = db_a.root_group();
        let b = db_b.root_group();

        let entry = a.get_or_create_entry("github", Some("alice")).unwrap();
        entry.set_secret(Some(&"hunter2")).unwrap();
        db_a.set_dirty(false);
        db_b.set_dirty(false);

        b.add_entry(&entry).unwrap();

        assert!(!a.entries().contains(&entry));
        assert!(b.entries().contains(&entry));
        assert_eq!(entry.group(), Some(b.clone()));
        assert!(db_a.is_dirty());
        assert!(db_b.is_dirty());

        let secret = entry.get_secret().unwrap().unwrap();
        assert_eq!(secret.get(false).unwrap().expose_secret(), "hunter2");
    }

    #[test]
    fn test_get_or_create_entry_matching() {
        let db = Database::new().unwrap();
        let root = db.root_group();

        let alice = root.get_or_create_entry("github", Some("alice")).unwrap();
        let again = root.get_or_create_entry("github", Some("alice")).unwrap();
        let any = root.get_or_create_entry("github", None).unwrap();
        let bob = root.get_or_create_entry("github", Some("bob")).unwrap();

        assert_eq!(alice, again);
        assert_eq!(alice, any);
        assert_ne!(alice, bob);
        assert_eq!(root.entries().len(), 2);
        assert_eq!(bob.user_name().unwrap().as_deref(), Some("bob"));
        assert_eq!(bob.title().unwrap().as_deref(), Some("github"));
    }

    #[test]
    fn test_remove_and_delete_entry() {
        let db = Database::new().unwrap();
        let root = db.root_group();
        let entry = root.get_or_create_entry("temp", None).unwrap();
        entry.replace_field(PASSWORD, ProtectedField::plain("x"));

        assert!(root.remove_entry(&entry).unwrap());
        assert!(entry.group().is_none());
        assert!(!root.remove_entry(&entry).unwrap());
        assert!(db.deleted_objects().is_empty());

        root.add_entry(&entry).unwrap();
        assert!(root.delete_entry(&entry).unwrap());
        let deleted = db.deleted_objects();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].uuid, entry.uuid());
    }

    #[test]
    fn test_remove_group_records_subtree() {
        let db = Database::new().unwrap();
        let root = db.root_group();
        let work = root.create_subgroup("Work").unwrap();
        work.create_subgroup("Servers").unwrap();
        work.get_or_create_entry("vpn", None).unwrap();

        let removed = root.remove_group("Work").unwrap().unwrap();
        assert!(removed.parent().is_none());
        assert!(root.get_group("Work").is_none());
        assert_eq!(db.deleted_objects().len(), 3);
        assert!(root.remove_group("Work").unwrap().is_none());
    }

    #[test]
    fn test_read_only_rejects_mutations() {
        let db = Database::with_config(crate::config::DatabaseConfig::read_only()).unwrap();
        let root = db.root_group();

        assert!(matches!(root.create_subgroup("X"), Err(KdbxError::ReadOnly)));
        assert!(matches!(db.create_entry("X"), Err(KdbxError::ReadOnly)));
        assert!(matches!(root.get_or_create_entry(TITLE, None), Err(KdbxError::ReadOnly)));
        assert!(!db.is_dirty());
    }

    #[test]
    fn test_rename_checks_siblings() {
        let db = Database::new().unwrap();
        let root = db.root_group();
        let a = root.create_subgroup("A").unwrap();
        root.create_subgroup("B").unwrap();

        assert!(matches!(a.set_name("B"), Err(KdbxError::NameCollision(_))));
        a.set_name("C").unwrap();
        assert_eq!(root.get_group("C"), Some(a));
    }
}
