//! ALFA KDBX - Error Types

use thiserror::Error;

/// Result type for document operations
pub type KdbxResult<T> = Result<T, KdbxError>;

/// Document error types
#[derive(Error, Debug)]
pub enum KdbxError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Illegal access: {0}")]
    IllegalAccess(String),

    #[error("Invalid inner stream key: {0}")]
    InvalidKey(String),

    #[error("Unknown inner stream algorithm id: {0}")]
    UnknownStreamAlgorithm(u32),

    #[error("Keystream failure: {0}")]
    Keystream(String),

    // ═══════════════════════════════════════════════════════════════
    // TREE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Name already in use: {0}")]
    NameCollision(String),

    #[error("Database is read-only")]
    ReadOnly,

    #[error("The root group cannot become a child group")]
    RootNotMovable,

    #[error("Moving group '{0}' would create a cycle")]
    WouldCycle(String),

    #[error("Group belongs to another database")]
    ForeignDatabase,

    // ═══════════════════════════════════════════════════════════════
    // DOCUMENT ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Missing element: {0}")]
    MissingElement(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Document changed while it was being saved")]
    ConcurrentModification,

    #[error("Invalid config: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KdbxError {
    /// Internal invariant broken; the document must not be used further
    pub fn is_fatal(&self) -> bool {
        matches!(self, KdbxError::InvariantViolation(_))
    }

    /// Raised by a precondition check before any mutation happened
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            KdbxError::NameCollision(_)
                | KdbxError::ReadOnly
                | KdbxError::RootNotMovable
                | KdbxError::WouldCycle(_)
                | KdbxError::ForeignDatabase
        )
    }

    /// Caller may fix the input and try again
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }
}

impl From<base64::DecodeError> for KdbxError {
    fn from(e: base64::DecodeError) -> Self {
        KdbxError::Decode(format!("invalid base64: {}", e))
    }
}

impl From<std::str::Utf8Error> for KdbxError {
    fn from(e: std::str::Utf8Error) -> Self {
        KdbxError::Decode(format!("invalid UTF-8: {}", e))
    }
}
