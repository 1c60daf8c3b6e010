//! Database configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::InnerStreamAlgorithm;
use crate::error::KdbxResult;

/// Behaviour knobs for a loaded or created database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Stamped into `Meta/Generator` on every save
    pub generator: String,
    /// Name of the root group of new databases
    pub root_group_name: String,
    /// Inner stream used for the fresh keystream of each save
    pub stream_algorithm: InnerStreamAlgorithm,
    /// Reject every tree and content mutation
    pub read_only: bool,
    /// Promote plain values to protected ones the first time they are read as secrets
    pub protect_on_read: bool,
    /// Indent the serialized document
    pub indent_xml: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            generator: format!("alfa-kdbx {}", crate::VERSION),
            root_group_name: "Root".into(),
            stream_algorithm: InnerStreamAlgorithm::ChaCha20,
            read_only: false,
            protect_on_read: true,
            indent_xml: false,
        }
    }
}

impl DatabaseConfig {
    /// Config for inspecting a document without touching it
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing keys fall back to defaults
    pub fn load<P: AsRef<Path>>(path: P) -> KdbxResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> KdbxResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
