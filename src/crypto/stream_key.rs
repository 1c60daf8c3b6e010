//! Inner stream key material handed over by the outer KDBX envelope

use std::fmt;
use std::str::FromStr;

use chacha20::cipher::KeyIvInit;
use chacha20::ChaCha20;
use rand::RngCore;
use salsa20::Salsa20;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use super::keystream::{ChaCha20Keystream, Salsa20Keystream, SharedKeystream};
use crate::error::{KdbxError, KdbxResult};

/// Fixed Salsa20 IV mandated by KDBX 3.1
const SALSA20_IV: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Inner random stream algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InnerStreamAlgorithm {
    /// Salsa20 (header id 2)
    Salsa20,
    /// ChaCha20 (header id 3) - preferred
    ChaCha20,
}

impl Default for InnerStreamAlgorithm {
    fn default() -> Self {
        Self::ChaCha20
    }
}

impl InnerStreamAlgorithm {
    /// Header id as written by the envelope
    pub fn id(&self) -> u32 {
        match self {
            Self::Salsa20 => 2,
            Self::ChaCha20 => 3,
        }
    }

    pub fn from_id(id: u32) -> KdbxResult<Self> {
        match id {
            2 => Ok(Self::Salsa20),
            3 => Ok(Self::ChaCha20),
            other => Err(KdbxError::UnknownStreamAlgorithm(other)),
        }
    }

    /// Length of freshly generated keys
    pub fn key_len(&self) -> usize {
        match self {
            Self::Salsa20 => 32,
            Self::ChaCha20 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Salsa20 => "salsa20",
            Self::ChaCha20 => "chacha20",
        }
    }
}

impl FromStr for InnerStreamAlgorithm {
    type Err = KdbxError;

    fn from_str(s: &str) -> KdbxResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "salsa20" => Ok(Self::Salsa20),
            "chacha20" => Ok(Self::ChaCha20),
            other => Err(KdbxError::InvalidKey(format!("unknown algorithm '{}'", other))),
        }
    }
}

/// Protected stream key plus the algorithm it drives.
///
/// Every keystream built from the same key starts at offset 0 and yields
/// the same bytes, so a document can always be reopened with its key.
#[derive(Clone)]
pub struct InnerStreamKey {
    algorithm: InnerStreamAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl InnerStreamKey {
    pub fn new(algorithm: InnerStreamAlgorithm, key: Vec<u8>) -> KdbxResult<Self> {
        if key.is_empty() {
            return Err(KdbxError::InvalidKey("empty key".into()));
        }
        Ok(Self {
            algorithm,
            key: Zeroizing::new(key),
        })
    }

    /// Fresh random key
    pub fn generate(algorithm: InnerStreamAlgorithm) -> Self {
        let mut key = vec![0u8; algorithm.key_len()];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            algorithm,
            key: Zeroizing::new(key),
        }
    }

    pub fn algorithm(&self) -> InnerStreamAlgorithm {
        self.algorithm
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8] {
        &self.key
    }

    /// Build a keystream positioned at offset 0
    pub fn keystream(&self) -> KdbxResult<SharedKeystream> {
        match self.algorithm {
            InnerStreamAlgorithm::ChaCha20 => {
                let digest = Zeroizing::new(Sha512::digest(self.key.as_slice()).to_vec());
                let cipher = ChaCha20::new_from_slices(&digest[..32], &digest[32..44])
                    .map_err(|e| KdbxError::InvalidKey(e.to_string()))?;
                Ok(SharedKeystream::new(ChaCha20Keystream::new(cipher)))
            }
            InnerStreamAlgorithm::Salsa20 => {
                let digest = Zeroizing::new(Sha256::digest(self.key.as_slice()).to_vec());
                let cipher = Salsa20::new_from_slices(&digest, &SALSA20_IV)
                    .map_err(|e| KdbxError::InvalidKey(e.to_string()))?;
                Ok(SharedKeystream::new(Salsa20Keystream::new(cipher)))
            }
        }
    }

    /// `algorithm:hex` form used by key files
    pub fn to_encoded(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{}:{}", self.algorithm.name(), hex::encode(self.key.as_slice())))
    }
}

impl FromStr for InnerStreamKey {
    type Err = KdbxError;

    fn from_str(s: &str) -> KdbxResult<Self> {
        let (algorithm, key_hex) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| KdbxError::InvalidKey("expected 'algorithm:hex'".into()))?;
        let key = hex::decode(key_hex).map_err(|e| KdbxError::InvalidKey(e.to_string()))?;
        Self::new(algorithm.parse()?, key)
    }
}

impl fmt::Debug for InnerStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerStreamKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_ids() {
        assert_eq!(InnerStreamAlgorithm::from_id(2).unwrap(), InnerStreamAlgorithm::Salsa20);
        assert_eq!(InnerStreamAlgorithm::from_id(3).unwrap(), InnerStreamAlgorithm::ChaCha20);
        assert!(matches!(
            InnerStreamAlgorithm::from_id(1),
            Err(KdbxError::UnknownStreamAlgorithm(1))
        ));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = InnerStreamKey::generate(InnerStreamAlgorithm::ChaCha20);
        let b = InnerStreamKey::generate(InnerStreamAlgorithm::ChaCha20);
        assert_eq!(a.expose().len(), 64);
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn test_encoded_form() {
        let key = InnerStreamKey::generate(InnerStreamAlgorithm::Salsa20);
        let parsed: InnerStreamKey = key.to_encoded().parse().unwrap();

        assert_eq!(parsed.algorithm(), InnerStreamAlgorithm::Salsa20);
        assert_eq!(parsed.expose(), key.expose());
        assert!(!format!("{:?}", key).contains(&hex::encode(key.expose())));
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(InnerStreamKey::new(InnerStreamAlgorithm::ChaCha20, Vec::new()).is_err());
        assert!("chacha20".parse::<InnerStreamKey>().is_err());
        assert!("rc4:00ff".parse::<InnerStreamKey>().is_err());
        assert!("chacha20:zz".parse::<InnerStreamKey>().is_err());
    }
}
