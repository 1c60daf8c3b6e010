//! KDBX inner XML codec
//!
//! Reads a `<KeePassFile>` document into a [`Database`](crate::tree::Database)
//! and writes it back out. The outer envelope (header, key derivation, block
//! encryption, compression) is the caller's concern: it hands in the inner
//! stream key on load and receives the fresh one with every save.

mod reader;
mod writer;

pub use reader::read_document;
pub use writer::{write_document, SavedDocument};
