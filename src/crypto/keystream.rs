//! Seekable keystream abstraction over ChaCha20 / Salsa20

use std::fmt;
use std::sync::Arc;

use chacha20::cipher::{StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use parking_lot::{Mutex, MutexGuard};
use salsa20::Salsa20;
use zeroize::Zeroizing;

use crate::error::{KdbxError, KdbxResult};

/// A seekable stream cipher.
///
/// `process` XORs the buffer in place starting at the current position and
/// advances the position by `buf.len()`. Two instances built from the same
/// key and IV produce identical bytes at identical offsets, which is what makes
/// "seek back and re-derive" a valid decryption.
pub trait Keystream: Send {
    /// Jump to an absolute byte offset
    fn seek(&mut self, pos: u64) -> KdbxResult<()>;

    /// Current byte offset
    fn position(&self) -> u64;

    /// Mask `buf` in place and advance
    fn process(&mut self, buf: &mut [u8]) -> KdbxResult<()>;
}

/// ChaCha20 (KDBX 4 inner stream)
pub struct ChaCha20Keystream {
    cipher: ChaCha20,
}

impl ChaCha20Keystream {
    pub fn new(cipher: ChaCha20) -> Self {
        Self { cipher }
    }
}

impl Keystream for ChaCha20Keystream {
    fn seek(&mut self, pos: u64) -> KdbxResult<()> {
        self.cipher
            .try_seek(pos)
            .map_err(|e| KdbxError::Keystream(format!("ChaCha20 seek to {} failed: {}", pos, e)))
    }

    fn position(&self) -> u64 {
        self.cipher.current_pos::<u64>()
    }

    fn process(&mut self, buf: &mut [u8]) -> KdbxResult<()> {
        self.cipher
            .try_apply_keystream(buf)
            .map_err(|e| KdbxError::Keystream(format!("ChaCha20 keystream exhausted: {}", e)))
    }
}

/// Salsa20 (KDBX 3.1 inner stream)
pub struct Salsa20Keystream {
    cipher: Salsa20,
}

impl Salsa20Keystream {
    pub fn new(cipher: Salsa20) -> Self {
        Self { cipher }
    }
}

impl Keystream for Salsa20Keystream {
    fn seek(&mut self, pos: u64) -> KdbxResult<()> {
        self.cipher
            .try_seek(pos)
            .map_err(|e| KdbxError::Keystream(format!("Salsa20 seek to {} failed: {}", pos, e)))
    }

    fn position(&self) -> u64 {
        self.cipher.current_pos::<u64>()
    }

    fn process(&mut self, buf: &mut [u8]) -> KdbxResult<()> {
        self.cipher
            .try_apply_keystream(buf)
            .map_err(|e| KdbxError::Keystream(format!("Salsa20 keystream exhausted: {}", e)))
    }
}

/// Keystream shared between every field bound to it.
///
/// The mutex is the "cipher-in-use" lock: seeking is stateful, so every
/// seek+process pair runs under one acquisition.
#[derive(Clone)]
pub struct SharedKeystream {
    inner: Arc<Mutex<Box<dyn Keystream>>>,
}

impl SharedKeystream {
    pub fn new<K: Keystream + 'static>(keystream: K) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(keystream))),
        }
    }

    /// Exclusive access for a sequence of operations
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Keystream>> {
        self.inner.lock()
    }

    /// Same underlying cipher instance
    pub fn ptr_eq(&self, other: &SharedKeystream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn position(&self) -> u64 {
        self.inner.lock().position()
    }

    /// Seek to `offset` and unmask a copy of `data`. The append position is
    /// restored afterwards so later masks never reuse keystream bytes.
    pub fn transform_at(&self, offset: u64, data: &[u8]) -> KdbxResult<Zeroizing<Vec<u8>>> {
        let mut buf = Zeroizing::new(data.to_vec());
        let mut cipher = self.inner.lock();
        let resume = cipher.position();
        cipher.seek(offset)?;
        cipher.process(&mut buf)?;
        cipher.seek(resume)?;
        Ok(buf)
    }

    /// Mask a copy of `data` at the current position; returns `(offset, masked)`
    pub fn append(&self, data: &[u8]) -> KdbxResult<(u64, Vec<u8>)> {
        let mut cipher = self.inner.lock();
        let offset = cipher.position();
        let mut buf = data.to_vec();
        cipher.process(&mut buf)?;
        Ok((offset, buf))
    }
}

impl fmt::Debug for SharedKeystream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeystream")
            .field("instance", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{InnerStreamAlgorithm, InnerStreamKey};

    fn key(byte: u8, algorithm: InnerStreamAlgorithm) -> InnerStreamKey {
        InnerStreamKey::new(algorithm, vec![byte; algorithm.key_len()]).unwrap()
    }

    #[test]
    fn test_same_key_same_bytes() {
        for algorithm in [InnerStreamAlgorithm::ChaCha20, InnerStreamAlgorithm::Salsa20] {
            let a = key(7, algorithm).keystream().unwrap();
            let b = key(7, algorithm).keystream().unwrap();

            let (off_a, ct_a) = a.append(b"correct horse").unwrap();
            let (off_b, ct_b) = b.append(b"correct horse").unwrap();

            assert_eq!(off_a, 0);
            assert_eq!(off_b, 0);
            assert_eq!(ct_a, ct_b);
            assert_ne!(ct_a, b"correct horse".to_vec());
        }
    }

    #[test]
    fn test_seek_back_reproduces() {
        let ks = key(1, InnerStreamAlgorithm::ChaCha20).keystream().unwrap();

        let (first_off, first) = ks.append(b"first").unwrap();
        let (second_off, second) = ks.append(b"second value").unwrap();
        assert_eq!(second_off, first_off + 5);
        assert_eq!(ks.position(), 5 + 12);

        // out of order reads
        let plain2 = ks.transform_at(second_off, &second).unwrap();
        let plain1 = ks.transform_at(first_off, &first).unwrap();
        assert_eq!(plain1.as_slice(), b"first");
        assert_eq!(plain2.as_slice(), b"second value");

        // reads do not move the append position
        assert_eq!(ks.position(), 17);
        let (third_off, _) = ks.append(b"x").unwrap();
        assert_eq!(third_off, 17);
    }

    #[test]
    fn test_algorithms_differ() {
        let chacha = key(3, InnerStreamAlgorithm::ChaCha20).keystream().unwrap();
        let salsa = key(3, InnerStreamAlgorithm::Salsa20).keystream().unwrap();

        let (_, a) = chacha.append(&[0u8; 32]).unwrap();
        let (_, b) = salsa.append(&[0u8; 32]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ptr_eq() {
        let a = key(1, InnerStreamAlgorithm::ChaCha20).keystream().unwrap();
        let b = key(1, InnerStreamAlgorithm::ChaCha20).keystream().unwrap();
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }
}
