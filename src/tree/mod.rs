//! Document tree: database, groups, entries

mod database;
mod defaults;
pub(crate) mod element;
mod entry;
mod group;
pub mod times;

pub use database::{Database, DeletedObject};
pub use defaults::{mandatory_entry_defaults, mandatory_group_defaults, DefaultValue};
pub use entry::{Entry, Property, NOTES, PASSWORD, TITLE, URL, USER_NAME};
pub use group::Group;
pub use times::Times;

pub(crate) use database::DatabaseState;
pub(crate) use entry::EntryRecord;
pub(crate) use group::{EntrySlot, GroupInner};
