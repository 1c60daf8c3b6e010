//! Protected field values
//!
//! A protected value never sits in the object graph as plaintext. It is stored
//! as ciphertext plus the offset at which a keystream masked it:
//!
//! - `Bound`   - loaded from a document, or produced by a completed save
//! - `Pending` - created in memory from a fresh secret, masked under the
//!               database's ephemeral keystream at construction time
//! - `Plain`   - legacy / unprotected text

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::crypto::{Keystream, SharedKeystream};
use crate::error::{KdbxError, KdbxResult};

/// Anything that can hand out a secret.
///
/// `clearable` signals that the caller promises to wipe the returned buffer
/// after use. Implementations backed by ciphertext always decrypt into a fresh
/// buffer, so the flag only matters for in-memory sources.
pub trait SecretValue {
    fn get(&self, clearable: bool) -> KdbxResult<SecretString>;
}

impl SecretValue for str {
    fn get(&self, _clearable: bool) -> KdbxResult<SecretString> {
        Ok(SecretString::from(self.to_owned()))
    }
}

impl SecretValue for String {
    fn get(&self, clearable: bool) -> KdbxResult<SecretString> {
        <str as SecretValue>::get(self, clearable)
    }
}

impl SecretValue for SecretString {
    fn get(&self, clearable: bool) -> KdbxResult<SecretString> {
        <str as SecretValue>::get(self.expose_secret(), clearable)
    }
}

impl<T: SecretValue + ?Sized> SecretValue for &T {
    fn get(&self, clearable: bool) -> KdbxResult<SecretString> {
        (**self).get(clearable)
    }
}

/// Field content, tagged by protection state
#[derive(Clone)]
pub enum ProtectedField {
    Bound {
        ciphertext: Vec<u8>,
        offset: u64,
        keystream: SharedKeystream,
    },
    Pending {
        ciphertext: Vec<u8>,
        offset: u64,
        keystream: SharedKeystream,
    },
    Plain(String),
}

impl ProtectedField {
    pub fn bound(ciphertext: Vec<u8>, offset: u64, keystream: SharedKeystream) -> Self {
        Self::Bound {
            ciphertext,
            offset,
            keystream,
        }
    }

    /// Mask `plaintext` right away at the keystream's current position
    pub fn pending(plaintext: &str, keystream: &SharedKeystream) -> KdbxResult<Self> {
        let (offset, ciphertext) = keystream.append(plaintext.as_bytes())?;
        Ok(Self::Pending {
            ciphertext,
            offset,
            keystream: keystream.clone(),
        })
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain(text.into())
    }

    /// Bound or Pending
    pub fn is_protected(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Bound { offset, .. } | Self::Pending { offset, .. } => Some(*offset),
            Self::Plain(_) => None,
        }
    }

    pub fn ciphertext(&self) -> Option<&[u8]> {
        match self {
            Self::Bound { ciphertext, .. } | Self::Pending { ciphertext, .. } => Some(ciphertext),
            Self::Plain(_) => None,
        }
    }

    /// Offset and keystream a protected field is masked under
    pub fn binding(&self) -> Option<(u64, &SharedKeystream)> {
        match self {
            Self::Bound {
                offset, keystream, ..
            }
            | Self::Pending {
                offset, keystream, ..
            } => Some((*offset, keystream)),
            Self::Plain(_) => None,
        }
    }

    /// Recover the raw bytes (protected binaries are not text)
    pub fn decrypt_bytes(&self) -> KdbxResult<Zeroizing<Vec<u8>>> {
        match self {
            Self::Bound {
                ciphertext,
                offset,
                keystream,
            }
            | Self::Pending {
                ciphertext,
                offset,
                keystream,
            } => keystream.transform_at(*offset, ciphertext),
            Self::Plain(text) => Ok(Zeroizing::new(text.as_bytes().to_vec())),
        }
    }

    /// Recover the text; Plain returns a copy
    pub fn decrypt(&self) -> KdbxResult<Zeroizing<String>> {
        if let Self::Plain(text) = self {
            return Ok(Zeroizing::new(text.clone()));
        }
        let plain = self.decrypt_bytes()?;
        let text = std::str::from_utf8(&plain)?;
        Ok(Zeroizing::new(text.to_owned()))
    }

    /// Raw text of a Plain field. Protected fields refuse.
    pub fn text(&self) -> KdbxResult<&str> {
        match self {
            Self::Plain(text) => Ok(text),
            Self::Bound { .. } => Err(KdbxError::IllegalAccess(
                "bound field has no raw text; use decrypt()".into(),
            )),
            Self::Pending { .. } => Err(KdbxError::IllegalAccess(
                "pending field has no raw text; use decrypt()".into(),
            )),
        }
    }

    /// Re-encrypt under `target`, whose exclusive lock the caller already holds.
    ///
    /// The new field is Bound to `handle` (the shared owner of `target`) at the
    /// position `target` was at on entry.
    pub fn rekey(&self, target: &mut dyn Keystream, handle: &SharedKeystream) -> KdbxResult<Self> {
        let (ciphertext, offset, keystream) = match self {
            Self::Bound {
                ciphertext,
                offset,
                keystream,
            }
            | Self::Pending {
                ciphertext,
                offset,
                keystream,
            } => (ciphertext, *offset, keystream),
            Self::Plain(_) => {
                return Err(KdbxError::IllegalAccess("plain field cannot be rekeyed".into()))
            }
        };

        if keystream.ptr_eq(handle) {
            return Err(KdbxError::Keystream(
                "rekey target is the keystream the field is already bound to".into(),
            ));
        }

        let new_offset = target.position();
        let mut buf = keystream.transform_at(offset, ciphertext)?;
        target.process(&mut buf)?;

        Ok(Self::Bound {
            ciphertext: buf.to_vec(),
            offset: new_offset,
            keystream: handle.clone(),
        })
    }

    /// Serialized form of a protected field
    pub fn encode_base64(&self) -> KdbxResult<String> {
        match self.ciphertext() {
            Some(ciphertext) => Ok(STANDARD.encode(ciphertext)),
            None => Err(KdbxError::IllegalAccess(
                "plain field has no protected encoding".into(),
            )),
        }
    }
}

impl fmt::Debug for ProtectedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound {
                ciphertext, offset, ..
            } => write!(f, "Bound(offset={}, len={})", offset, ciphertext.len()),
            Self::Pending {
                ciphertext, offset, ..
            } => write!(f, "Pending(offset={}, len={})", offset, ciphertext.len()),
            Self::Plain(text) => write!(f, "Plain(len={})", text.len()),
        }
    }
}

/// Secret handed out by an entry; decrypts on every `get`
#[derive(Clone)]
pub struct ProtectedSecret {
    field: ProtectedField,
}

impl ProtectedSecret {
    pub(crate) fn new(field: ProtectedField) -> Self {
        Self { field }
    }

    pub fn is_protected(&self) -> bool {
        self.field.is_protected()
    }
}

impl SecretValue for ProtectedSecret {
    fn get(&self, _clearable: bool) -> KdbxResult<SecretString> {
        let plain = self.field.decrypt()?;
        Ok(SecretString::from(plain.as_str().to_owned()))
    }
}

impl fmt::Debug for ProtectedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProtectedSecret([REDACTED])")
    }
}
