//! AES-GCM record sealing with counter nonces.
//!
//! A sealed record is `nonce(12) || ciphertext || tag(16)`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use anyhow::{Result, anyhow, bail};
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const NONCE_SIZE: usize = 12;
pub(crate) const TAG_SIZE: usize = 16;
const PREFIX_SIZE: usize = 4;

enum Engine {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

/// Nonces are a random per-instance prefix followed by a big-endian counter,
/// so one key never sees the same nonce twice within an instance.
struct NonceSequence {
    prefix: [u8; PREFIX_SIZE],
    counter: AtomicU64,
}

impl NonceSequence {
    fn random() -> Self {
        let mut prefix = [0u8; PREFIX_SIZE];
        rand::thread_rng().fill_bytes(&mut prefix);
        NonceSequence {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    fn next(&self) -> Result<[u8; NONCE_SIZE]> {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        if count == u64::MAX {
            bail!("nonce space exhausted, connection must be re-keyed");
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..PREFIX_SIZE].copy_from_slice(&self.prefix);
        nonce[PREFIX_SIZE..].copy_from_slice(&count.to_be_bytes());
        Ok(nonce)
    }
}

/// Receive-side view of a peer's nonce sequence. Each authenticated record
/// must carry the peer's prefix and the next counter value, which rejects
/// replayed, reordered and dropped records.
#[derive(Debug, Default)]
pub(crate) struct NonceWindow {
    prefix: Option<[u8; PREFIX_SIZE]>,
    next: u64,
}

impl NonceWindow {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accepts the nonce of `record` if it is the next one in sequence.
    pub(crate) fn accept(&mut self, record: &[u8]) -> Result<()> {
        if record.len() < NONCE_SIZE {
            bail!("record of {} bytes carries no nonce", record.len());
        }
        let mut prefix = [0u8; PREFIX_SIZE];
        prefix.copy_from_slice(&record[..PREFIX_SIZE]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&record[PREFIX_SIZE..NONCE_SIZE]);
        let count = u64::from_be_bytes(count);

        if self.prefix.is_some_and(|expected| expected != prefix) {
            bail!("record nonce prefix changed mid-stream");
        }
        if count != self.next {
            bail!("record {} out of sequence, expected {}", count, self.next);
        }
        self.prefix = Some(prefix);
        self.next += 1;
        Ok(())
    }
}

pub struct AesGcmCipher {
    engine: Engine,
    nonces: NonceSequence,
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self.engine {
            Engine::Aes128(_) => 128,
            Engine::Aes256(_) => 256,
        };
        f.debug_struct("AesGcmCipher")
            .field("key_bits", &bits)
            .field("records_sealed", &self.nonces.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl AesGcmCipher {
    /// Builds a cipher for a 16-byte (AES-128) or 32-byte (AES-256) key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let engine = match key.len() {
            16 => Engine::Aes128(Aes128Gcm::new_from_slice(key).map_err(|e| anyhow!(e))?),
            32 => Engine::Aes256(Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!(e))?),
            other => bail!("AES-GCM key must be 16 or 32 bytes, got {}", other),
        };
        Ok(Self {
            engine,
            nonces: NonceSequence::random(),
        })
    }

    /// Encrypts `plaintext` into a self-describing record.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.nonces.next()?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = match &self.engine {
            Engine::Aes128(cipher) => cipher.encrypt(nonce, plaintext),
            Engine::Aes256(cipher) => cipher.encrypt(nonce, plaintext),
        }
        .map_err(|_| anyhow!("record encryption failed"))?;

        let mut record = Vec::with_capacity(NONCE_SIZE + sealed.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&sealed);
        Ok(record)
    }

    /// Authenticates and decrypts a record produced by [`AesGcmCipher::seal`].
    pub fn open(&self, record: &[u8]) -> Result<Vec<u8>> {
        if record.len() < NONCE_SIZE + TAG_SIZE {
            bail!("record of {} bytes is shorter than nonce and tag", record.len());
        }
        let (nonce_bytes, sealed) = record.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        match &self.engine {
            Engine::Aes128(cipher) => cipher.decrypt(nonce, sealed),
            Engine::Aes256(cipher) => cipher.decrypt(nonce, sealed),
        }
        .map_err(|_| anyhow!("record failed authentication"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(len: usize) -> Vec<u8> {
        let mut key = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_seal_open_both_key_sizes() {
        for len in [16, 32] {
            let cipher = AesGcmCipher::new(&key(len)).unwrap();
            let record = cipher.seal(b"relay payload").unwrap();
            assert_eq!(record.len(), NONCE_SIZE + b"relay payload".len() + TAG_SIZE);
            assert_eq!(cipher.open(&record).unwrap(), b"relay payload");
        }
    }

    #[test]
    fn test_foreign_key_and_tampering_are_detected() {
        let cipher = AesGcmCipher::new(&key(32)).unwrap();
        let mut record = cipher.seal(b"do not touch").unwrap();

        let other = AesGcmCipher::new(&key(32)).unwrap();
        assert!(other.open(&record).is_err());

        record[NONCE_SIZE + 2] ^= 0x01;
        assert!(cipher.open(&record).is_err());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let err = AesGcmCipher::new(&[0u8; 24]).unwrap_err();
        assert!(err.to_string().contains("got 24"));

        let cipher = AesGcmCipher::new(&key(16)).unwrap();
        assert!(cipher.open(&[0u8; NONCE_SIZE + TAG_SIZE - 1]).is_err());
    }

    #[test]
    fn test_window_accepts_only_the_next_record() {
        let cipher = AesGcmCipher::new(&key(16)).unwrap();
        let first = cipher.seal(b"first").unwrap();
        let second = cipher.seal(b"second").unwrap();

        let mut window = NonceWindow::new();
        assert!(window.accept(&second).is_err());
        window.accept(&first).unwrap();
        assert!(window.accept(&first).is_err());
        window.accept(&second).unwrap();

        let foreign = AesGcmCipher::new(&key(16)).unwrap();
        foreign.seal(b"x").unwrap();
        foreign.seal(b"y").unwrap();
        let third = foreign.seal(b"z").unwrap();
        assert!(window.accept(&third).is_err());
    }

    #[test]
    fn test_nonces_share_prefix_and_count_up() {
        let cipher = AesGcmCipher::new(&key(32)).unwrap();
        let first = cipher.seal(b"a").unwrap();
        let second = cipher.seal(b"b").unwrap();

        assert_eq!(first[..PREFIX_SIZE], second[..PREFIX_SIZE]);
        let count = |record: &[u8]| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&record[PREFIX_SIZE..NONCE_SIZE]);
            u64::from_be_bytes(bytes)
        };
        assert_eq!(count(&first), 0);
        assert_eq!(count(&second), 1);
    }
}
