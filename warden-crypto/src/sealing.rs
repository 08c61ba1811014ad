//! A namespace key that remembers the nonces it issued recently.

use crate::cipher::{self, EncryptedData, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use rand::RngCore;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of recent nonces a [`SealingKey`] remembers.
pub const DEFAULT_NONCE_WINDOW: usize = 4096;

/// The most recent nonces issued under one key, oldest first.
struct NonceWindow {
    order: VecDeque<[u8; NONCE_SIZE]>,
    seen: HashSet<[u8; NONCE_SIZE]>,
    capacity: usize,
    issued: u64,
}

impl NonceWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
            issued: 0,
        }
    }

    /// Records `nonce`; `false` if it is still inside the window.
    fn insert(&mut self, nonce: [u8; NONCE_SIZE]) -> bool {
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.issued += 1;
        true
    }
}

/// Symmetric key held for one storage namespace.
///
/// Every call to [`SealingKey::seal`] draws a fresh random 96-bit nonce.
/// Uniqueness rests on the randomness of that draw; the key additionally
/// remembers its last `window` nonces and reports a repeat among them as
/// [`CryptoError::NonceReuse`] instead of producing ciphertext. Memory use
/// stays bounded no matter how many writes a namespace sees.
pub struct SealingKey {
    key: DerivedKey,
    window: Mutex<NonceWindow>,
}

impl SealingKey {
    pub fn new(key: DerivedKey) -> Self {
        Self::with_window(key, DEFAULT_NONCE_WINDOW)
    }

    pub fn with_window(key: DerivedKey, window: usize) -> Self {
        Self {
            key,
            window: Mutex::new(NonceWindow::new(window)),
        }
    }

    fn window(&self) -> MutexGuard<'_, NonceWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encrypts `plaintext` under a freshly drawn nonce.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        self.seal_with_nonce(nonce, plaintext)
    }

    pub(crate) fn seal_with_nonce(
        &self,
        nonce: [u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<EncryptedData> {
        if !self.window().insert(nonce) {
            return Err(CryptoError::NonceReuse);
        }
        cipher::encrypt_with_nonce(&self.key, nonce, plaintext)
    }

    /// Decrypts data sealed under this key.
    pub fn open(&self, encrypted: &EncryptedData) -> CryptoResult<Vec<u8>> {
        cipher::decrypt(&self.key, encrypted)
    }

    /// Number of nonces issued so far.
    pub fn issued_count(&self) -> u64 {
        self.window().issued
    }

    /// Number of nonces currently remembered, at most the window size.
    pub fn tracked_nonces(&self) -> usize {
        self.window().order.len()
    }

    /// Returns the underlying key.
    pub fn key(&self) -> &DerivedKey {
        &self.key
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKey")
            .field("key", &self.key)
            .field("issued", &self.issued_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::generate_ephemeral_key;

    #[test]
    fn seal_open_roundtrip() {
        let key = SealingKey::new(generate_ephemeral_key());
        let sealed = key.seal(b"payload").unwrap();
        assert_eq!(key.open(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn repeated_nonce_is_refused() {
        let key = SealingKey::new(generate_ephemeral_key());
        let nonce = [7u8; NONCE_SIZE];
        key.seal_with_nonce(nonce, b"first").unwrap();
        let err = key.seal_with_nonce(nonce, b"second").unwrap_err();
        assert!(matches!(err, CryptoError::NonceReuse));
    }

    #[test]
    fn issued_count_tracks_every_seal() {
        let key = SealingKey::new(generate_ephemeral_key());
        for _ in 0..5 {
            key.seal(b"x").unwrap();
        }
        assert_eq!(key.issued_count(), 5);
    }

    #[test]
    fn window_stays_bounded() {
        let key = SealingKey::with_window(generate_ephemeral_key(), 8);
        for _ in 0..100 {
            key.seal(b"x").unwrap();
        }
        assert_eq!(key.issued_count(), 100);
        assert_eq!(key.tracked_nonces(), 8);
    }

    #[test]
    fn repeat_inside_window_is_refused_and_outside_is_forgotten() {
        let key = SealingKey::with_window(generate_ephemeral_key(), 2);
        key.seal_with_nonce([1u8; NONCE_SIZE], b"a").unwrap();
        key.seal_with_nonce([2u8; NONCE_SIZE], b"b").unwrap();
        assert!(matches!(
            key.seal_with_nonce([2u8; NONCE_SIZE], b"c"),
            Err(CryptoError::NonceReuse)
        ));
        key.seal_with_nonce([3u8; NONCE_SIZE], b"d").unwrap();
        assert_eq!(key.tracked_nonces(), 2);
        // [1; 12] has left the window.
        key.seal_with_nonce([1u8; NONCE_SIZE], b"e").unwrap();
    }

    #[test]
    fn debug_redacts_key() {
        let key = SealingKey::new(generate_ephemeral_key());
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
    }
}
