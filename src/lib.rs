//! # ALFA KDBX
//!
//! In-memory KeePass (KDBX) inner document with stream-masked secrets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        ALFA KDBX                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │   READER    │  │    TREE     │  │     WRITER       │  │
//! │  │ offsets in  │→ │ Database    │→ │ fresh key, rekey │  │
//! │  │ doc order   │  │ Group/Entry │  │ stage + commit   │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘  │
//! │         │                │                   │            │
//! │  ┌──────┴────────────────┴───────────────────┴─────────┐  │
//! │  │   PROTECTED FIELDS: Bound / Pending / Plain          │  │
//! │  │   ChaCha20 (id 3) / Salsa20 (id 2) seekable streams  │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Protected values are only ever held XOR-masked under a keystream
//! - Every save re-keys every protected value under a fresh random stream key
//! - Plaintext is returned as `SecretString` and intermediate buffers are zeroized
//! - The outer envelope (header, KDF, block cipher, gzip) is out of scope

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protected;
pub mod tree;

pub use codec::SavedDocument;
pub use config::DatabaseConfig;
pub use crypto::{InnerStreamAlgorithm, InnerStreamKey, Keystream, SharedKeystream};
pub use error::{KdbxError, KdbxResult};
pub use protected::{ProtectedField, ProtectedSecret, SecretValue};
pub use tree::{Database, DeletedObject, Entry, Group, Property, Times};

/// ALFA KDBX version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
