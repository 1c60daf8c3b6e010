//! ALFA KDBX - Database
//!
//! Owns the root group, the `Meta` block and the shared state every group and
//! entry points back to: configuration, the dirty flag, a generation counter
//! the writer uses to detect concurrent edits, and the ephemeral keystream that
//! masks values set since the last load or save.
//!
//! Lock order: document lock, then group state, then entry record, then the
//! keystream mutex. Mutators hold the document lock shared; a save holds it
//! exclusively from serialization through commit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;
use xmltree::Element;

use super::element::{set_text_at, text_at};
use super::entry::Entry;
use super::group::{Group, GroupInner};
use crate::codec::{self, SavedDocument};
use crate::config::DatabaseConfig;
use crate::crypto::{InnerStreamAlgorithm, InnerStreamKey, SharedKeystream};
use crate::error::{KdbxError, KdbxResult};
use crate::protected::ProtectedField;

/// Record of a removed group or entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deleted_at: DateTime<Utc>,
}

/// State shared by every node of one database
pub(crate) struct DatabaseState {
    pub(crate) config: DatabaseConfig,
    dirty: AtomicBool,
    generation: AtomicU64,
    ephemeral: SharedKeystream,
    root: RwLock<Weak<GroupInner>>,
    deleted: Mutex<Vec<DeletedObject>>,
    document: RwLock<()>,
}

impl DatabaseState {
    pub(crate) fn new(config: DatabaseConfig) -> KdbxResult<Self> {
        // values set in memory are masked under a private random stream
        let ephemeral = InnerStreamKey::generate(InnerStreamAlgorithm::ChaCha20).keystream()?;
        Ok(Self {
            config,
            dirty: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            ephemeral,
            root: RwLock::new(Weak::new()),
            deleted: Mutex::new(Vec::new()),
            document: RwLock::new(()),
        })
    }

    /// Shared hold for one mutation; nested mutator calls may re-enter
    pub(crate) fn edit(&self) -> RwLockReadGuard<'_, ()> {
        self.document.read_recursive()
    }

    /// Exclusive hold for a save
    pub(crate) fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.document.write()
    }

    pub(crate) fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Bumped by every mutation
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_writable(&self) -> KdbxResult<()> {
        if self.config.read_only {
            return Err(KdbxError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn ephemeral(&self) -> &SharedKeystream {
        &self.ephemeral
    }

    pub(crate) fn set_root(&self, root: &Group) {
        *self.root.write() = Arc::downgrade(&root.inner);
    }

    pub(crate) fn is_root(&self, group: &Arc<GroupInner>) -> bool {
        std::ptr::eq(self.root.read().as_ptr(), Arc::as_ptr(group))
    }

    pub(crate) fn record_deletions(&self, uuids: impl IntoIterator<Item = Uuid>) {
        let now = Utc::now();
        self.deleted.lock().extend(uuids.into_iter().map(|uuid| DeletedObject {
            uuid,
            deleted_at: now,
        }));
    }

    pub(crate) fn deleted(&self) -> Vec<DeletedObject> {
        self.deleted.lock().clone()
    }

    pub(crate) fn set_deleted(&self, deleted: Vec<DeletedObject>) {
        *self.deleted.lock() = deleted;
    }
}

/// `<Meta>` block of the document
pub(crate) struct Meta {
    pub(crate) element: Element,
    /// Values of `Protected="True"` elements left in `element`, in document order
    pub(crate) masked: Vec<ProtectedField>,
}

/// In-memory KDBX inner document
pub struct Database {
    pub(crate) state: Arc<DatabaseState>,
    pub(crate) root: Group,
    pub(crate) meta: RwLock<Meta>,
}

impl Database {
    // ═══════════════════════════════════════════════════════════════════════
    // CONSTRUCTION
    // ═══════════════════════════════════════════════════════════════════════

    /// Empty database with a fresh root group
    pub fn new() -> KdbxResult<Self> {
        Self::with_config(DatabaseConfig::default())
    }

    pub fn with_config(config: DatabaseConfig) -> KdbxResult<Self> {
        let mut meta = Element::new("Meta");
        set_text_at(&mut meta, "Generator", &config.generator);
        set_text_at(&mut meta, "DatabaseName", "");
        set_text_at(&mut meta, "MemoryProtection/ProtectTitle", "False");
        set_text_at(&mut meta, "MemoryProtection/ProtectUserName", "False");
        set_text_at(&mut meta, "MemoryProtection/ProtectPassword", "True");
        set_text_at(&mut meta, "MemoryProtection/ProtectURL", "False");
        set_text_at(&mut meta, "MemoryProtection/ProtectNotes", "False");

        let state = Arc::new(DatabaseState::new(config)?);
        let root = Group::build(&state, Weak::new(), &state.config.root_group_name);
        let db = Self::from_parts(state, root, meta, Vec::new());
        tracing::info!("Created new database with root group '{}'", db.root.name());
        Ok(db)
    }

    pub(crate) fn from_parts(
        state: Arc<DatabaseState>,
        root: Group,
        meta: Element,
        masked: Vec<ProtectedField>,
    ) -> Self {
        state.set_root(&root);
        Self {
            state,
            root,
            meta: RwLock::new(Meta {
                element: meta,
                masked,
            }),
        }
    }

    /// Parse an inner XML document whose protected values are masked under `stream_key`
    pub fn load(xml: &[u8], stream_key: &InnerStreamKey) -> KdbxResult<Self> {
        Self::load_with_config(xml, stream_key, DatabaseConfig::default())
    }

    pub fn load_with_config(
        xml: &[u8],
        stream_key: &InnerStreamKey,
        config: DatabaseConfig,
    ) -> KdbxResult<Self> {
        codec::read_document(xml, stream_key, config)
    }

    /// Serialize, re-keying every protected value under a fresh inner stream.
    ///
    /// The dirty flag is left alone; clear it once the envelope is written.
    pub fn save(&self) -> KdbxResult<SavedDocument> {
        codec::write_document(self)
    }

    /// Every protected field in document order: `Meta` first, then the tree
    pub(crate) fn for_each_protected_mut(&self, f: &mut dyn FnMut(&mut ProtectedField)) {
        for field in &mut self.meta.write().masked {
            f(field);
        }
        self.root.for_each_protected_mut(f);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TREE
    // ═══════════════════════════════════════════════════════════════════════

    pub fn root_group(&self) -> Group {
        self.root.clone()
    }

    /// Detached entry; it joins the tree (and dirties it) once added to a group
    pub fn create_entry(&self, title: &str) -> KdbxResult<Entry> {
        Entry::create(&self.state, title)
    }

    /// Depth-first search from the root
    pub fn find_entry_by_uuid(&self, id: Uuid) -> Option<Entry> {
        self.root.find_entry_by_uuid(id)
    }

    pub fn deleted_objects(&self) -> Vec<DeletedObject> {
        self.state.deleted()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATE & META
    // ═══════════════════════════════════════════════════════════════════════

    pub fn is_dirty(&self) -> bool {
        self.state.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.state.dirty.store(dirty, Ordering::SeqCst);
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.state.config
    }

    pub fn is_read_only(&self) -> bool {
        self.state.config.read_only
    }

    /// Application that last wrote the document
    pub fn generator(&self) -> Option<String> {
        text_at(&self.meta.read().element, "Generator")
    }

    pub fn database_name(&self) -> String {
        text_at(&self.meta.read().element, "DatabaseName").unwrap_or_default()
    }

    pub fn set_database_name(&self, name: &str) -> KdbxResult<()> {
        let _edit = self.state.edit();
        self.state.ensure_writable()?;
        if self.database_name() == name {
            return Ok(());
        }

        let mut meta = self.meta.write();
        set_text_at(&mut meta.element, "DatabaseName", name);
        set_text_at(&mut meta.element, "DatabaseNameChanged", &super::times::format_time(Utc::now()));
        self.state.mark_dirty();
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.database_name())
            .field("root", &self.root)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_database() {
        let db = Database::new().unwrap();
        let root = db.root_group();

        assert!(!db.is_dirty());
        assert!(root.is_root());
        assert!(root.parent().is_none());
        assert_eq!(root.name(), "Root");
        assert!(root.uuid().is_some());
        assert!(db.generator().unwrap().starts_with("alfa-kdbx"));
    }

    #[test]
    fn test_root_name_from_config() {
        let config = DatabaseConfig {
            root_group_name: "Vault".into(),
            ..Default::default()
        };
        let db = Database::with_config(config).unwrap();
        assert_eq!(db.root_group().name(), "Vault");
    }

    #[test]
    fn test_create_entry_is_detached() {
        let db = Database::new().unwrap();
        let entry = db.create_entry("github").unwrap();

        assert!(entry.group().is_none());
        assert!(!db.is_dirty());
        assert!(db.find_entry_by_uuid(entry.uuid()).is_none());

        db.root_group().add_entry(&entry).unwrap();
        assert!(db.is_dirty());
        assert_eq!(db.find_entry_by_uuid(entry.uuid()), Some(entry));
    }

    #[test]
    fn test_dirty_only_cleared_explicitly() {
        let db = Database::new().unwrap();
        db.root_group().create_subgroup("A").unwrap();
        assert!(db.is_dirty());

        db.save().unwrap();
        assert!(db.is_dirty());

        db.set_dirty(false);
        assert!(!db.is_dirty());
    }

    #[test]
    fn test_generation_counts_mutations() {
        let db = Database::new().unwrap();
        let before = db.state.generation();

        db.root_group().create_subgroup("A").unwrap();
        db.set_dirty(false);
        assert!(db.state.generation() > before);
    }

    #[test]
    fn test_database_name() {
        let db = Database::new().unwrap();
        db.set_database_name("Personal").unwrap();
        assert_eq!(db.database_name(), "Personal");
        assert!(db.is_dirty());

        db.set_dirty(false);
        db.set_database_name("Personal").unwrap();
        assert!(!db.is_dirty());
    }

    #[test]
    fn test_find_nested_entry() {
        let db = Database::new().unwrap();
        let deep = db
            .root_group()
            .create_subgroup("a")
            .unwrap()
            .create_subgroup("b")
            .unwrap();
        let entry = deep.get_or_create_entry("nested", None).unwrap();

        assert_eq!(db.find_entry_by_uuid(entry.uuid()), Some(entry));
        assert!(db.find_entry_by_uuid(Uuid::new_v4()).is_none());
    }
}
